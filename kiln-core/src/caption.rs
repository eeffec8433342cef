//! Image captioning: validation, orchestration and the pipeline contract.

use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::validate::{self, Validation};
use crate::{util, ClientError, ClientErrorKind, Error, InferencePool, ModelLike, ModelManager, Result};

pub const DEFAULT_MODEL_ID: &str = "Salesforce/blip-image-captioning-large";
pub const MAX_IMAGE_SIZE_MB: usize = 10;
pub const SUPPORTED_IMAGE_FORMATS: &[&str] = &["image/jpeg", "image/png", "image/jpg", "image/webp"];
pub const DEFAULT_MAX_NEW_TOKENS: usize = 256;
pub const MAX_NEW_TOKENS_LIMIT: usize = 1000;
pub const DEFAULT_TEMPERATURE: f64 = 1.0;
pub const MAX_TEMPERATURE: f64 = 2.0;
pub const DEFAULT_DO_SAMPLE: bool = true;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptionParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub do_sample: bool,
}

impl Default for CaptionParams {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            do_sample: DEFAULT_DO_SAMPLE,
        }
    }
}

pub trait Captioner: ModelLike {
    fn caption(&self, image: &DynamicImage, params: &CaptionParams) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caption {
    pub caption: String,
    pub model_name: String,
    pub processing_time: f64,
}

pub fn validate_content_type(content_type: Option<&str>) -> Validation {
    match content_type {
        Some(ct) if SUPPORTED_IMAGE_FORMATS.contains(&ct) => Ok(()),
        _ => Err(ClientError::new(
            ClientErrorKind::UnsupportedFormat,
            "file",
            format!(
                "Unsupported image format. Supported formats: {}",
                SUPPORTED_IMAGE_FORMATS.join(", ")
            ),
        )),
    }
}

pub fn validate_file_size(len: usize) -> Validation {
    validate::ensure_max_bytes("file", len, MAX_IMAGE_SIZE_MB)
}

pub fn validate_params(params: &CaptionParams) -> Validation {
    validate::ensure_range("max_new_tokens", params.max_new_tokens, 1, MAX_NEW_TOKENS_LIMIT)?;
    // temperature excludes its lower bound
    if !(params.temperature > 0.0 && params.temperature <= MAX_TEMPERATURE) {
        return Err(ClientError::new(
            ClientErrorKind::OutOfRange,
            "temperature",
            format!("temperature must be between 0 and {MAX_TEMPERATURE:.1}"),
        ));
    }
    Ok(())
}

pub struct CaptionGenerator {
    models: Arc<ModelManager<dyn Captioner>>,
    pool: InferencePool,
}

impl CaptionGenerator {
    pub fn new(models: Arc<ModelManager<dyn Captioner>>, pool: InferencePool) -> Self {
        Self { models, pool }
    }

    pub async fn generate(&self, image: Vec<u8>, params: CaptionParams) -> Result<Caption> {
        let model = self.models.get()?;
        let model_name = self.models.model_id().to_string();
        info!("Starting image caption generation");

        let caption = self
            .pool
            .run(move || {
                let image = util::decode_image(&image)?;
                let start = Instant::now();
                let caption = model
                    .caption(&image, &params)
                    .map_err(Error::Inference)?;
                Ok(Caption {
                    caption: caption.trim().to_string(),
                    model_name,
                    processing_time: start.elapsed().as_secs_f64(),
                })
            })
            .await?;

        info!(
            "Successfully generated caption in {:.2} seconds",
            caption.processing_time
        );
        Ok(caption)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{ServiceKind, Settings};

    struct FixedCaptioner {
        calls: AtomicUsize,
    }

    impl ModelLike for FixedCaptioner {}

    impl Captioner for FixedCaptioner {
        fn caption(&self, image: &DynamicImage, _: &CaptionParams) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("  a {}x{} test card \n", image.width(), image.height()))
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(image::RgbImage::new(width, height));
        util::encode_png(&img).unwrap()
    }

    async fn ready_generator() -> (CaptionGenerator, Arc<FixedCaptioner>) {
        let captioner = Arc::new(FixedCaptioner {
            calls: AtomicUsize::new(0),
        });
        let models = Arc::new(ModelManager::<dyn Captioner>::new(DEFAULT_MODEL_ID));
        let settings = Settings {
            hf_token: Some("token".into()),
            ..Settings::new(ServiceKind::Caption)
        };
        let handle = Arc::clone(&captioner);
        models
            .initialize(&settings, |_, _| async move { Ok(handle as Arc<dyn Captioner>) })
            .await
            .unwrap();
        (CaptionGenerator::new(models, InferencePool::new(1, None)), captioner)
    }

    #[test]
    fn params_boundaries() {
        let at_max = CaptionParams {
            max_new_tokens: MAX_NEW_TOKENS_LIMIT,
            temperature: MAX_TEMPERATURE,
            ..Default::default()
        };
        assert!(validate_params(&at_max).is_ok());
        assert!(validate_params(&CaptionParams { max_new_tokens: 1, ..Default::default() }).is_ok());

        let zero_tokens = CaptionParams { max_new_tokens: 0, ..Default::default() };
        assert_eq!(validate_params(&zero_tokens).unwrap_err().field, "max_new_tokens");

        let frozen = CaptionParams { temperature: 0.0, ..Default::default() };
        let err = validate_params(&frozen).unwrap_err();
        assert_eq!(err.field, "temperature");
        assert_eq!(err.detail, "temperature must be between 0 and 2.0");
    }

    #[test]
    fn content_type_allow_list() {
        assert!(validate_content_type(Some("image/webp")).is_ok());
        assert!(validate_content_type(Some("image/gif")).is_err());
        assert!(validate_content_type(None).is_err());
    }

    #[tokio::test]
    async fn generates_trimmed_caption_with_metadata() {
        let (generator, captioner) = ready_generator().await;
        let caption = generator
            .generate(png(32, 16), CaptionParams::default())
            .await
            .unwrap();
        assert_eq!(caption.caption, "a 32x16 test card");
        assert_eq!(caption.model_name, DEFAULT_MODEL_ID);
        assert!(caption.processing_time > 0.0);
        assert_eq!(captioner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn undecodable_image_never_reaches_model() {
        let (generator, captioner) = ready_generator().await;
        let err = generator
            .generate(b"not an image".to_vec(), CaptionParams::default())
            .await
            .unwrap_err();
        assert!(err.is_client());
        assert_eq!(captioner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn uninitialized_manager_is_a_server_fault() {
        let models = Arc::new(ModelManager::<dyn Captioner>::new(DEFAULT_MODEL_ID));
        let generator = CaptionGenerator::new(models, InferencePool::new(1, None));
        let err = generator
            .generate(png(4, 4), CaptionParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotInitialized(_)));
        assert!(!err.is_client());
    }
}
