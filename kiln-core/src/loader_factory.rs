use std::sync::Arc;

use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::caption::Captioner;
use crate::imagine::ImagePipeline;
use crate::synthesize::SpeechSynthesizer;
use crate::transcribe::SpeechRecognizer;
use crate::video::VideoPipeline;
use crate::{BlipLoader, DeviceMap, FluxLoader, FluxVariant, Loader, ParlerLoader, ServiceKind, WhisperLoader};

/// Model architectures with a native backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    Blip,
    Flux(FluxVariant),
    Whisper,
    ParlerTts,
}

impl ModelType {
    /// Detect model type from a repository name.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("BLIP") {
            Some(Self::Blip)
        } else if name_upper.contains("FLUX") {
            Some(Self::Flux(FluxVariant::from_model_id(model_name)))
        } else if name_upper.contains("WHISPER") {
            Some(Self::Whisper)
        } else if name_upper.contains("PARLER") {
            Some(Self::ParlerTts)
        } else {
            None
        }
    }

    pub fn service(self) -> ServiceKind {
        match self {
            Self::Blip => ServiceKind::Caption,
            Self::Flux(_) => ServiceKind::Imagine,
            Self::Whisper => ServiceKind::Transcribe,
            Self::ParlerTts => ServiceKind::Synthesize,
        }
    }
}

/// Checks that `model_name` has a backend able to serve `service`.
pub fn detect(service: ServiceKind, model_name: &str) -> Result<ModelType> {
    let model_type = ModelType::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model type: {model_name}"))?;
    if model_type.service() != service {
        return Err(anyhow!(
            "Model {model_name} (detected type: {model_type:?}) cannot serve the {service} service"
        ));
    }
    info!("Loading model: {model_name} (detected type: {model_type:?})");
    Ok(model_type)
}

pub async fn load_captioner(
    model_name: &str,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn Captioner>> {
    detect(ServiceKind::Caption, model_name)?;
    let model = BlipLoader::load(model_name, api, device_map).await?;
    Ok(Arc::new(model))
}

pub async fn load_image_pipeline(
    model_name: &str,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn ImagePipeline>> {
    detect(ServiceKind::Imagine, model_name)?;
    let model = FluxLoader::load(model_name, api, device_map).await?;
    Ok(Arc::new(model))
}

pub async fn load_recognizer(
    model_name: &str,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn SpeechRecognizer>> {
    detect(ServiceKind::Transcribe, model_name)?;
    let model = WhisperLoader::load(model_name, api, device_map).await?;
    Ok(Arc::new(model))
}

pub async fn load_synthesizer(
    model_name: &str,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn SpeechSynthesizer>> {
    detect(ServiceKind::Synthesize, model_name)?;
    let model = ParlerLoader::load(model_name, api, device_map).await?;
    Ok(Arc::new(model))
}

/// No image-to-video architecture has a native backend yet, so a `video`
/// process fails at startup.
pub async fn load_video_pipeline(
    model_name: &str,
    _api: Api,
    _device_map: DeviceMap,
) -> Result<Arc<dyn VideoPipeline>> {
    Err(anyhow!("No native backend for image-to-video model {model_name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{caption, imagine, synthesize, transcribe, video};

    #[test]
    fn default_models_resolve_to_their_service() {
        for model in [
            caption::DEFAULT_MODEL_ID,
            imagine::DEFAULT_MODEL_ID,
            transcribe::DEFAULT_MODEL_ID,
            synthesize::DEFAULT_MODEL_ID,
        ] {
            let model_type = ModelType::from_name(model).unwrap();
            assert_eq!(model_type.service().default_model_id(), model);
        }
        assert_eq!(ModelType::from_name(video::DEFAULT_MODEL_ID), None);
    }

    #[tokio::test]
    async fn video_models_have_no_backend() {
        let api = hf_hub::api::tokio::ApiBuilder::new().build().unwrap();
        let err = load_video_pipeline(video::DEFAULT_MODEL_ID, api, DeviceMap::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("No native backend"));
    }

    #[test]
    fn mismatched_service_is_rejected() {
        assert!(detect(ServiceKind::Caption, "openai/whisper-small").is_err());
        assert!(detect(ServiceKind::Imagine, "acme/unknown").is_err());
        assert_eq!(
            detect(ServiceKind::Imagine, "black-forest-labs/FLUX.1-dev").unwrap(),
            ModelType::Flux(FluxVariant::Dev)
        );
    }
}
