//! HTTP surface: one action router per service plus `/health`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{extract::DefaultBodyLimit, Router};
use kiln_core::{
    caption::CaptionGenerator, imagine::ImageGenerator, synthesize::Synthesizer,
    transcribe::Transcriber, validate::MIB, video::VideoGenerator, HealthChecker,
};
use tower_http::trace::TraceLayer;

mod caption;
mod form;
mod health;
mod imagine;
mod synthesize;
mod transcribe;
mod video;


/// Largest accepted request body. Uploads are capped at 10 MiB by the
/// validators; the extra MiB lets oversize files reach them and get a 400.
pub const BODY_LIMIT: usize = 11 * MIB;

/// The action handler a process serves.
pub enum Gateway {
    Caption(Arc<CaptionGenerator>),
    Imagine(Arc<ImageGenerator>),
    Transcribe(Arc<Transcriber>),
    Synthesize(Arc<Synthesizer>),
    Video(Arc<VideoGenerator>),
}

pub fn create_router(gateway: Gateway, checker: HealthChecker, root_path: Option<&str>) -> Router {
    let actions = match gateway {
        Gateway::Caption(generator) => caption::router(generator),
        Gateway::Imagine(generator) => imagine::router(generator),
        Gateway::Transcribe(transcriber) => transcribe::router(transcriber),
        Gateway::Synthesize(synthesizer) => synthesize::router(synthesizer),
        Gateway::Video(generator) => video::router(generator),
    };

    let app = actions
        .merge(health::router(checker))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(TraceLayer::new_for_http());

    match root_path.map(|p| p.trim_end_matches('/')) {
        Some(prefix) if !prefix.is_empty() => {
            let prefix = if prefix.starts_with('/') {
                prefix.to_string()
            } else {
                format!("/{prefix}")
            };
            Router::new().nest(&prefix, app)
        }
        _ => app,
    }
}

pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
