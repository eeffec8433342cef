//! Text-to-image generation.

use std::sync::Arc;
use std::time::Instant;

use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::validate::{self, Validation};
use crate::{util, ClientError, ClientErrorKind, Error, InferencePool, ModelLike, ModelManager, Result};

pub const DEFAULT_MODEL_ID: &str = "black-forest-labs/FLUX.1-schnell";

pub const DEFAULT_GUIDANCE_SCALE: f64 = 0.0;
pub const DEFAULT_NUM_INFERENCE_STEPS: usize = 4;
pub const DEFAULT_MAX_SEQUENCE_LENGTH: usize = 256;
pub const DEFAULT_WIDTH: u32 = 1024;
pub const DEFAULT_HEIGHT: u32 = 1024;

pub const MIN_DIMENSION: u32 = 256;
pub const MAX_DIMENSION: u32 = 2048;
pub const DIMENSION_MULTIPLE: u32 = 8;
pub const MIN_INFERENCE_STEPS: usize = 1;
pub const MAX_INFERENCE_STEPS: usize = 50;
pub const MIN_GUIDANCE_SCALE: f64 = 0.0;
pub const MAX_GUIDANCE_SCALE: f64 = 20.0;
pub const MAX_SEQUENCE_LENGTH_LIMIT: usize = 512;
pub const MAX_PROMPT_LENGTH: usize = 2000;
pub const SEED_LIMIT: u64 = 1 << 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub prompt: String,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default = "default_num_inference_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "default_max_sequence_length")]
    pub max_sequence_length: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

fn default_guidance_scale() -> f64 {
    DEFAULT_GUIDANCE_SCALE
}

fn default_num_inference_steps() -> usize {
    DEFAULT_NUM_INFERENCE_STEPS
}

fn default_max_sequence_length() -> usize {
    DEFAULT_MAX_SEQUENCE_LENGTH
}

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            num_inference_steps: DEFAULT_NUM_INFERENCE_STEPS,
            max_sequence_length: DEFAULT_MAX_SEQUENCE_LENGTH,
            seed: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

pub trait ImagePipeline: ModelLike {
    /// Renders one image. `seed` has already been resolved by the caller.
    fn generate(&self, request: &ImageRequest, seed: u64) -> anyhow::Result<DynamicImage>;
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub png: Vec<u8>,
    pub prompt: String,
    pub seed: u64,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub max_sequence_length: usize,
    pub model_name: String,
    pub generation_time: f64,
}

pub fn validate_request(request: &ImageRequest) -> Validation {
    validate::ensure_not_blank("prompt", "Prompt", &request.prompt)?;
    validate::ensure_max_chars("prompt", "Prompt", &request.prompt, MAX_PROMPT_LENGTH)?;
    validate::ensure_range("width", request.width, MIN_DIMENSION, MAX_DIMENSION)?;
    validate::ensure_range("height", request.height, MIN_DIMENSION, MAX_DIMENSION)?;
    validate::ensure_multiple_of("width", request.width, DIMENSION_MULTIPLE)?;
    validate::ensure_multiple_of("height", request.height, DIMENSION_MULTIPLE)?;
    validate::ensure_range(
        "num_inference_steps",
        request.num_inference_steps,
        MIN_INFERENCE_STEPS,
        MAX_INFERENCE_STEPS,
    )?;
    validate::ensure_range(
        "guidance_scale",
        request.guidance_scale,
        MIN_GUIDANCE_SCALE,
        MAX_GUIDANCE_SCALE,
    )?;
    validate::ensure_range(
        "max_sequence_length",
        request.max_sequence_length,
        1,
        MAX_SEQUENCE_LENGTH_LIMIT,
    )?;
    if request.seed.is_some_and(|seed| seed >= SEED_LIMIT) {
        return Err(ClientError::new(
            ClientErrorKind::OutOfRange,
            "seed",
            "seed must be between 0 and 2^32-1",
        ));
    }
    Ok(())
}

/// Brings a pipeline's output to exactly `width`×`height`.
///
/// Latent grids may round sizes up to their patch size; the surplus is cropped
/// evenly from both edges. Smaller outputs are resized.
pub fn fit_to_request(image: DynamicImage, width: u32, height: u32) -> DynamicImage {
    if image.width() == width && image.height() == height {
        return image;
    }
    if image.width() >= width && image.height() >= height {
        let x = (image.width() - width) / 2;
        let y = (image.height() - height) / 2;
        return image.crop_imm(x, y, width, height);
    }
    image.resize_exact(width, height, FilterType::Lanczos3)
}

pub struct ImageGenerator {
    models: Arc<ModelManager<dyn ImagePipeline>>,
    pool: InferencePool,
}

impl ImageGenerator {
    pub fn new(models: Arc<ModelManager<dyn ImagePipeline>>, pool: InferencePool) -> Self {
        Self { models, pool }
    }

    pub async fn generate(&self, request: ImageRequest) -> Result<GeneratedImage> {
        let pipeline = self.models.get()?;
        let model_name = self.models.model_id().to_string();
        let seed = request
            .seed
            .unwrap_or_else(|| u64::from(rand::random::<u32>()));
        let preview: String = request.prompt.chars().take(50).collect();
        info!("Starting image generation for prompt: '{preview}...'");

        let (image, generation_time, request) = self
            .pool
            .run(move || {
                let start = Instant::now();
                let image = pipeline
                    .generate(&request, seed)
                    .map_err(Error::Inference)?;
                Ok((image, start.elapsed().as_secs_f64(), request))
            })
            .await?;

        let image = fit_to_request(image, request.width, request.height);
        let (width, height) = (image.width(), image.height());
        let png = util::encode_png(&image).map_err(Error::Inference)?;
        info!(
            "Successfully generated {}x{} image in {:.2} seconds (seed: {}, steps: {})",
            width, height, generation_time, seed, request.num_inference_steps
        );

        Ok(GeneratedImage {
            png,
            prompt: request.prompt,
            seed,
            width,
            height,
            num_inference_steps: request.num_inference_steps,
            guidance_scale: request.guidance_scale,
            max_sequence_length: request.max_sequence_length,
            model_name,
            generation_time,
        })
    }
}
