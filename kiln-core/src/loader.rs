use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::{Api, ApiBuilder};
use tracing::info;

use crate::{DeviceMap, ModelLike, Settings};

pub trait Loader {
    type Model: ModelLike;

    fn load(
        model_id: &str,
        api: Api,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Model>> + Send
    where
        Self: Sized;
}

/// Builds the hub client every loader downloads weights through.
///
/// The token is attached to every request, so gated repositories fail at
/// the first download rather than later on.
pub fn authenticate(settings: &Settings) -> crate::Result<Api> {
    let token = settings
        .hf_token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string);
    let authenticated = token.is_some();
    let api = ApiBuilder::new()
        .with_token(token)
        .with_progress(false)
        .build()?;
    if authenticated {
        info!("Authenticated with Hugging Face hub");
    } else {
        info!("Using anonymous Hugging Face hub access");
    }
    Ok(api)
}
