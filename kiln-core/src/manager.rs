//! Lifecycle owner for the process's one expensive inference resource.
//!
//! A [`ModelManager`] starts out `Uninitialized`, becomes `Ready` once
//! [`ModelManager::initialize`] has validated settings, authenticated against
//! the hub and constructed the resource, and ends `Stopped` after
//! [`ModelManager::cleanup`]. Nothing can reach the resource unless the
//! manager is `Ready`.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use hf_hub::api::tokio::Api;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{loader, DeviceMap, Error, ModelLike, Result, Settings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Uninitialized,
    Initializing,
    Ready,
    Stopped,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

enum Slot<R: ?Sized> {
    Uninitialized,
    Initializing,
    Ready(Arc<R>),
    Stopped,
}

impl<R: ?Sized> Slot<R> {
    fn state(&self) -> ModelState {
        match self {
            Self::Uninitialized => ModelState::Uninitialized,
            Self::Initializing => ModelState::Initializing,
            Self::Ready(_) => ModelState::Ready,
            Self::Stopped => ModelState::Stopped,
        }
    }
}

/// Read-only view of a manager, used by health reporting.
pub trait ModelStatus: Send + Sync {
    fn model_id(&self) -> &str;
    fn state(&self) -> ModelState;

    fn is_initialized(&self) -> bool {
        self.state() == ModelState::Ready
    }
}

pub struct ModelManager<R: ?Sized> {
    model_id: String,
    slot: RwLock<Slot<R>>,
    // Serialises initialize/cleanup against each other.
    transition: Mutex<()>,
}

impl<R> ModelManager<R>
where
    R: ModelLike + ?Sized,
{
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            slot: RwLock::new(Slot::Uninitialized),
            transition: Mutex::new(()),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn state(&self) -> ModelState {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == ModelState::Ready
    }

    /// Validates `settings`, authenticates against the hub and runs `build`.
    ///
    /// Calling this again once the manager is `Ready` does nothing. On any
    /// failure the manager drops back to `Uninitialized` and the error is
    /// returned to the caller.
    pub async fn initialize<F, Fut>(&self, settings: &Settings, build: F) -> Result<()>
    where
        F: FnOnce(Api, DeviceMap) -> Fut,
        Fut: Future<Output = anyhow::Result<Arc<R>>>,
    {
        let _transition = self.transition.lock().await;
        match self.state() {
            ModelState::Ready => return Ok(()),
            ModelState::Stopped => return Err(Error::Stopped(self.model_id.clone())),
            ModelState::Uninitialized | ModelState::Initializing => {}
        }

        info!(model = %self.model_id, "Starting model initialization");
        self.set(Slot::Initializing);

        match self.construct(settings, build).await {
            Ok(resource) => {
                self.set(Slot::Ready(resource));
                info!(model = %self.model_id, "Model initialization completed successfully");
                Ok(())
            }
            Err(err) => {
                self.set(Slot::Uninitialized);
                error!(model = %self.model_id, error = %err, "Model initialization failed");
                Err(err)
            }
        }
    }

    async fn construct<F, Fut>(&self, settings: &Settings, build: F) -> Result<Arc<R>>
    where
        F: FnOnce(Api, DeviceMap) -> Fut,
        Fut: Future<Output = anyhow::Result<Arc<R>>>,
    {
        settings.validate()?;
        let api = loader::authenticate(settings)?;
        info!(model = %self.model_id, device = %settings.device_map, "Loading model");
        build(api, settings.device_map)
            .await
            .map_err(Error::Inference)
    }

    /// The resource handle, or `Error::NotInitialized` unless `Ready`.
    pub fn get(&self) -> Result<Arc<R>> {
        match &*self.slot.read().unwrap_or_else(PoisonError::into_inner) {
            Slot::Ready(resource) => Ok(Arc::clone(resource)),
            _ => Err(Error::NotInitialized(self.model_id.clone())),
        }
    }

    /// Releases the resource and moves to `Stopped`. Never fails.
    pub async fn cleanup(&self) {
        let _transition = self.transition.lock().await;
        let previous = std::mem::replace(
            &mut *self.slot.write().unwrap_or_else(PoisonError::into_inner),
            Slot::Stopped,
        );
        if let Slot::Ready(resource) = previous {
            if let Err(err) = resource.release() {
                warn!(model = %self.model_id, error = %err, "Error during model cleanup");
            }
            let outstanding = Arc::strong_count(&resource) - 1;
            if outstanding > 0 {
                warn!(
                    model = %self.model_id,
                    outstanding,
                    "Model still borrowed by in-flight requests at cleanup"
                );
            }
        }
        info!(model = %self.model_id, "Model cleanup completed");
    }

    fn set(&self, slot: Slot<R>) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = slot;
    }
}

impl<R> ModelStatus for ModelManager<R>
where
    R: ModelLike + ?Sized,
{
    fn model_id(&self) -> &str {
        ModelManager::model_id(self)
    }

    fn state(&self) -> ModelState {
        ModelManager::state(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::ServiceKind;

    struct Dummy {
        released: AtomicUsize,
        fail_release: bool,
    }

    impl Dummy {
        fn new() -> Self {
            Self {
                released: AtomicUsize::new(0),
                fail_release: false,
            }
        }
    }

    impl ModelLike for Dummy {
        fn release(&self) -> anyhow::Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            if self.fail_release {
                anyhow::bail!("device went away");
            }
            Ok(())
        }
    }

    fn settings() -> Settings {
        Settings {
            hf_token: Some("hf_test_token".into()),
            ..Settings::new(ServiceKind::Caption)
        }
    }

    #[tokio::test]
    async fn get_fails_before_initialize() {
        let manager = ModelManager::<Dummy>::new("dummy");
        assert_eq!(manager.state(), ModelState::Uninitialized);
        assert!(matches!(manager.get(), Err(Error::NotInitialized(ref id)) if id == "dummy"));
    }

    #[tokio::test]
    async fn initialize_twice_constructs_once_and_get_returns_same_instance() {
        let manager = ModelManager::<Dummy>::new("dummy");
        let builds = AtomicUsize::new(0);
        for _ in 0..2 {
            manager
                .initialize(&settings(), |_, _| async {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(Dummy::new()))
                })
                .await
                .unwrap();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(manager.is_initialized());

        let first = manager.get().unwrap();
        let second = manager.get().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn failed_construction_leaves_manager_uninitialized() {
        let manager = ModelManager::<Dummy>::new("dummy");
        let err = manager
            .initialize(&settings(), |_, _| async { anyhow::bail!("weights missing") })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
        assert_eq!(manager.state(), ModelState::Uninitialized);
        assert!(manager.get().is_err());
    }

    #[tokio::test]
    async fn settings_are_validated_before_construction() {
        let manager = ModelManager::<Dummy>::new("dummy");
        let builds = AtomicUsize::new(0);
        let err = manager
            .initialize(&Settings::new(ServiceKind::Caption), |_, _| async {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(Dummy::new()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_terminal() {
        let manager = ModelManager::<Dummy>::new("dummy");
        manager
            .initialize(&settings(), |_, _| async { Ok(Arc::new(Dummy::new())) })
            .await
            .unwrap();
        let handle = manager.get().unwrap();

        manager.cleanup().await;
        manager.cleanup().await;
        assert_eq!(handle.released.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ModelState::Stopped);
        assert!(matches!(manager.get(), Err(Error::NotInitialized(_))));

        let err = manager
            .initialize(&settings(), |_, _| async { Ok(Arc::new(Dummy::new())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Stopped(_)));
    }

    #[tokio::test]
    async fn release_failure_is_swallowed() {
        let manager = ModelManager::<Dummy>::new("dummy");
        manager
            .initialize(&settings(), |_, _| async {
                Ok(Arc::new(Dummy {
                    released: AtomicUsize::new(0),
                    fail_release: true,
                }))
            })
            .await
            .unwrap();
        manager.cleanup().await;
        assert_eq!(manager.state(), ModelState::Stopped);
    }

    #[tokio::test]
    async fn works_behind_trait_objects() {
        trait Echo: ModelLike {
            fn echo(&self) -> &'static str;
        }
        impl Echo for Dummy {
            fn echo(&self) -> &'static str {
                "pong"
            }
        }

        let manager = ModelManager::<dyn Echo>::new("echo");
        manager
            .initialize(&settings(), |_, _| async {
                Ok(Arc::new(Dummy::new()) as Arc<dyn Echo>)
            })
            .await
            .unwrap();
        assert_eq!(manager.get().unwrap().echo(), "pong");
        let status: &dyn ModelStatus = &manager;
        assert!(status.is_initialized());
        assert_eq!(status.model_id(), "echo");
    }
}
