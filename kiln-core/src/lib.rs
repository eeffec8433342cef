pub mod audio;
pub mod caption;
pub mod config;
pub mod device_map;
mod error;
pub mod health;
pub mod imagine;
pub mod loader;
mod loader_factory;
pub mod manager;
pub mod pool;
pub mod synthesize;
pub mod transcribe;
pub mod util;
pub mod validate;
pub mod video;

mod blip;
mod flux;
mod parler;
mod whisper;

pub use blip::BlipLoader;
pub use config::{ServiceKind, Settings};
pub use device_map::*;
pub use error::{ClientError, ClientErrorKind, Error, Result};
pub use flux::{FluxLoader, FluxVariant};
pub use health::{HealthChecker, HealthReport};
pub use loader::*;
pub use loader_factory::*;
pub use manager::{ModelManager, ModelState, ModelStatus};
pub use parler::ParlerLoader;
pub use pool::InferencePool;
pub use whisper::WhisperLoader;

/// Anything a [`ModelManager`] can own.
///
/// `release` is called once at shutdown to hand device memory back before
/// the process exits; the default does nothing.
pub trait ModelLike: Send + Sync {
    fn release(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
