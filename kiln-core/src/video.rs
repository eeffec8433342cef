//! Image-to-video generation and animated export.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use image::codecs::gif::{GifEncoder, Repeat};
use image::imageops::FilterType;
use image::{Delay, DynamicImage, Frame};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::validate::{self, Validation};
use crate::{util, ClientError, ClientErrorKind, Error, InferencePool, ModelLike, ModelManager, Result};

pub const DEFAULT_MODEL_ID: &str = "Wan-AI/Wan2.1-I2V-14B-480P-Diffusers";

pub const DEFAULT_NUM_FRAMES: usize = 81;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 5.0;
pub const DEFAULT_FPS: u32 = 16;
pub const DEFAULT_INFERENCE_STEPS: usize = 10;
pub const MAX_AREA_480P: u32 = 480 * 832;

pub const MIN_NUM_FRAMES: usize = 8;
pub const MAX_NUM_FRAMES: usize = 128;
pub const MIN_GUIDANCE_SCALE: f64 = 1.0;
pub const MAX_GUIDANCE_SCALE: f64 = 20.0;
pub const MIN_FPS: u32 = 8;
pub const MAX_FPS: u32 = 30;

pub const MAX_IMAGE_SIZE_MB: usize = 10;
pub const SUPPORTED_IMAGE_FORMATS: &[&str] = &["JPEG", "PNG", "JPG", "WEBP"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_num_frames")]
    pub num_frames: usize,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_inference_steps")]
    pub num_inference_steps: usize,
}

fn default_num_frames() -> usize {
    DEFAULT_NUM_FRAMES
}

fn default_guidance_scale() -> f64 {
    DEFAULT_GUIDANCE_SCALE
}

fn default_fps() -> u32 {
    DEFAULT_FPS
}

fn default_inference_steps() -> usize {
    DEFAULT_INFERENCE_STEPS
}

impl VideoRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            num_frames: DEFAULT_NUM_FRAMES,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            fps: DEFAULT_FPS,
            num_inference_steps: DEFAULT_INFERENCE_STEPS,
        }
    }
}

pub trait VideoPipeline: ModelLike {
    /// Both output sides must be a multiple of this.
    fn dimension_stride(&self) -> u32;

    /// Animates `image`, which has already been resized to stride multiples.
    fn generate(&self, image: &DynamicImage, request: &VideoRequest) -> anyhow::Result<Vec<DynamicImage>>;
}

#[derive(Debug, Clone)]
pub struct GeneratedVideo {
    pub gif: Vec<u8>,
    pub num_frames: usize,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub duration: f64,
    pub generation_time: f64,
    pub model_name: String,
}

pub fn validate_upload(filename: Option<&str>, content_type: Option<&str>, len: usize) -> Validation {
    let filename = validate::require_filename("image_file", filename)?;
    validate::ensure_extension("image_file", filename, SUPPORTED_IMAGE_FORMATS)?;
    if !content_type.is_some_and(|ct| ct.starts_with("image/")) {
        return Err(ClientError::new(
            ClientErrorKind::UnsupportedFormat,
            "image_file",
            "File must be an image",
        ));
    }
    validate::ensure_max_bytes("image_file", len, MAX_IMAGE_SIZE_MB)
}

pub fn validate_request(request: &VideoRequest) -> Validation {
    validate::ensure_not_blank("prompt", "Prompt", &request.prompt)?;
    validate::ensure_range("num_frames", request.num_frames, MIN_NUM_FRAMES, MAX_NUM_FRAMES)?;
    validate::ensure_range(
        "guidance_scale",
        request.guidance_scale,
        MIN_GUIDANCE_SCALE,
        MAX_GUIDANCE_SCALE,
    )?;
    validate::ensure_range("fps", request.fps, MIN_FPS, MAX_FPS)
}

/// Largest size with the input's aspect ratio fitting in `max_area`, both
/// sides rounded then floored to `stride`.
pub fn fit_dimensions(width: u32, height: u32, max_area: u32, stride: u32) -> Result<(u32, u32)> {
    if width == 0 || height == 0 {
        return Err(degenerate(width, height).into());
    }
    let stride = stride.max(1);
    let aspect = f64::from(height) / f64::from(width);
    let area = f64::from(max_area);
    let fit_height = (area * aspect).sqrt().round() as u32 / stride * stride;
    let fit_width = (area / aspect).sqrt().round() as u32 / stride * stride;
    if fit_width == 0 || fit_height == 0 {
        return Err(degenerate(width, height).into());
    }
    Ok((fit_width, fit_height))
}

fn degenerate(width: u32, height: u32) -> ClientError {
    ClientError::new(
        ClientErrorKind::OutOfRange,
        "image_file",
        format!("Image dimensions {width}x{height} cannot be resized for video generation"),
    )
}

/// Encodes frames as an endlessly looping GIF at `fps`.
pub fn encode_gif(frames: &[DynamicImage], fps: u32) -> anyhow::Result<Vec<u8>> {
    let delay = Delay::from_numer_denom_ms(1000, fps.max(1));
    let mut bytes = Vec::new();
    {
        let mut encoder = GifEncoder::new(Cursor::new(&mut bytes));
        encoder
            .set_repeat(Repeat::Infinite)
            .context("failed to configure GIF loop")?;
        for frame in frames {
            encoder
                .encode_frame(Frame::from_parts(frame.to_rgba8(), 0, 0, delay))
                .context("failed to encode video frame")?;
        }
    }
    Ok(bytes)
}

/// `{stem}_generated_video_{timestamp}.gif`, with `image` as the fallback stem.
///
/// Characters outside `[A-Za-z0-9._-]` become `_` so the name is always a
/// valid quoted header parameter.
pub fn download_filename(upload_name: Option<&str>, timestamp: u64) -> String {
    let stem: String = upload_name
        .map(|name| name.rsplit(['/', '\\']).next().unwrap_or(name))
        .map(|name| name.rsplit_once('.').map_or(name, |(stem, _)| stem))
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = if stem.is_empty() { "image" } else { stem.as_str() };
    format!("{stem}_generated_video_{timestamp}.gif")
}

pub struct VideoGenerator {
    models: Arc<ModelManager<dyn VideoPipeline>>,
    pool: InferencePool,
}

impl VideoGenerator {
    pub fn new(models: Arc<ModelManager<dyn VideoPipeline>>, pool: InferencePool) -> Self {
        Self { models, pool }
    }

    pub async fn generate(&self, image: Vec<u8>, request: VideoRequest) -> Result<GeneratedVideo> {
        let pipeline = self.models.get()?;
        let model_name = self.models.model_id().to_string();
        info!("Starting video generation");

        let fps = request.fps;
        let (frames, width, height, generation_time) = self
            .pool
            .run(move || {
                let image = util::decode_image(&image)
                    .map_err(|e| ClientError::new(e.kind, "image_file", "Invalid image file"))?;
                let (width, height) = fit_dimensions(
                    image.width(),
                    image.height(),
                    MAX_AREA_480P,
                    pipeline.dimension_stride(),
                )?;
                let resized = image.resize_exact(width, height, FilterType::Lanczos3);
                info!("Resized image to {width}x{height}");

                let start = Instant::now();
                let frames = pipeline
                    .generate(&resized, &request)
                    .map_err(Error::Inference)?;
                Ok((frames, width, height, start.elapsed().as_secs_f64()))
            })
            .await?;

        if frames.is_empty() {
            return Err(Error::Inference(anyhow::anyhow!("pipeline produced no frames")));
        }
        let num_frames = frames.len();
        let gif = self
            .pool
            .offload(move || encode_gif(&frames, fps).map_err(Error::Inference))
            .await?;
        info!("Video generated successfully in {generation_time:.2}s");

        Ok(GeneratedVideo {
            gif,
            num_frames,
            fps,
            width,
            height,
            duration: num_frames as f64 / f64::from(fps.max(1)),
            generation_time,
            model_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{ServiceKind, Settings};

    #[derive(Default)]
    struct FadePipeline {
        seen: Mutex<Option<(u32, u32)>>,
    }

    impl ModelLike for FadePipeline {}

    impl VideoPipeline for FadePipeline {
        fn dimension_stride(&self) -> u32 {
            16
        }

        fn generate(&self, image: &DynamicImage, request: &VideoRequest) -> anyhow::Result<Vec<DynamicImage>> {
            *self.seen.lock().unwrap() = Some((image.width(), image.height()));
            Ok((0..request.num_frames).map(|_| image.clone()).collect())
        }
    }

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(image::RgbImage::new(width, height));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
            .unwrap();
        bytes
    }

    #[test]
    fn fits_area_keeping_aspect_and_stride() {
        let (w, h) = fit_dimensions(1920, 1080, MAX_AREA_480P, 16).unwrap();
        assert_eq!((w, h), (832, 464));
        assert!(w * h <= MAX_AREA_480P);

        let (w, h) = fit_dimensions(512, 512, MAX_AREA_480P, 16).unwrap();
        assert_eq!(w, h);
        assert_eq!(w % 16, 0);

        assert!(fit_dimensions(0, 10, MAX_AREA_480P, 16).is_err());
        let err = fit_dimensions(10_000, 1, MAX_AREA_480P, 16).unwrap_err();
        assert!(err.is_client());
    }

    #[test]
    fn request_limits() {
        let few = VideoRequest { num_frames: 4, ..VideoRequest::new("waves") };
        let err = validate_request(&few).unwrap_err();
        assert_eq!(err.field, "num_frames");
        assert!(err.detail.contains('8'));

        let fast = VideoRequest { fps: 31, ..VideoRequest::new("waves") };
        assert_eq!(validate_request(&fast).unwrap_err().field, "fps");
        assert!(validate_request(&VideoRequest::new("waves")).is_ok());
        assert!(validate_request(&VideoRequest::new("")).is_err());
    }

    #[test]
    fn upload_rules() {
        assert!(validate_upload(Some("cat.JPG"), Some("image/jpeg"), 100).is_ok());
        assert!(validate_upload(Some("cat.gif"), Some("image/gif"), 100).is_err());
        assert!(validate_upload(Some("cat.png"), Some("text/plain"), 100).is_err());
        assert!(validate_upload(Some("cat.png"), Some("image/png"), 11 * validate::MIB).is_err());
    }

    #[test]
    fn download_name_uses_upload_stem() {
        assert_eq!(download_filename(Some("beach.photo.png"), 7), "beach.photo_generated_video_7.gif");
        assert_eq!(download_filename(None, 7), "image_generated_video_7.gif");
    }

    #[test]
    fn download_filename_replaces_unsafe_characters() {
        assert_eq!(
            download_filename(Some("my \"best\"\r\nshot.png"), 3),
            "my__best___shot_generated_video_3.gif"
        );
        assert_eq!(download_filename(Some("café.jpg"), 3), "caf__generated_video_3.gif");
        let name = download_filename(Some("a\u{7}b;c=d.webp"), 3);
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)), "{name}");
    }

    #[tokio::test]
    async fn generates_gif_with_requested_frames() {
        let pipeline = Arc::new(FadePipeline::default());
        let models = Arc::new(ModelManager::<dyn VideoPipeline>::new(DEFAULT_MODEL_ID));
        let settings = Settings {
            hf_token: Some("token".into()),
            ..Settings::new(ServiceKind::Video)
        };
        let handle = Arc::clone(&pipeline);
        models
            .initialize(&settings, |_, _| async move { Ok(handle as Arc<dyn VideoPipeline>) })
            .await
            .unwrap();
        let generator = VideoGenerator::new(models, InferencePool::new(1, None));

        let request = VideoRequest { num_frames: 8, ..VideoRequest::new("waves") };
        let video = generator.generate(jpeg(64, 64), request).await.unwrap();
        assert_eq!(video.num_frames, 8);
        assert!((video.duration - 0.5).abs() < 1e-9);
        assert_eq!(*pipeline.seen.lock().unwrap(), Some((video.width, video.height)));
        assert_eq!(video.width % 16, 0);
        assert!(video.gif.starts_with(b"GIF89a"));
    }
}
