//! Image-to-video endpoint. Responds with an animated GIF attachment.

use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    http::header,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use kiln_core::video::{self, VideoGenerator, VideoRequest};
use tracing::info;

use super::{form::Form, unix_timestamp};
use crate::error::ApiError;

const FAILURE: &str = "Internal server error during video generation";

pub fn router(generator: Arc<VideoGenerator>) -> Router {
    Router::new()
        .route("/api/v1/generate", post(generate_video))
        .with_state(generator)
}

async fn generate_video(
    State(generator): State<Arc<VideoGenerator>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let mut form = Form::read(multipart?, &["image_file"]).await?;
    let upload = form
        .take_file("image_file")
        .ok_or_else(|| ApiError::bad_request("image_file is required"))?;
    info!(
        "Received video generation request for file: {}",
        upload.filename.as_deref().unwrap_or_default()
    );
    video::validate_upload(
        upload.filename.as_deref(),
        upload.content_type.as_deref(),
        upload.bytes.len(),
    )?;

    let request = VideoRequest {
        prompt: form.text("prompt").unwrap_or_default().to_string(),
        negative_prompt: form.text("negative_prompt").unwrap_or_default().to_string(),
        num_frames: form.parse_or("num_frames", video::DEFAULT_NUM_FRAMES)?,
        guidance_scale: form.parse_or("guidance_scale", video::DEFAULT_GUIDANCE_SCALE)?,
        fps: form.parse_or("fps", video::DEFAULT_FPS)?,
        num_inference_steps: video::DEFAULT_INFERENCE_STEPS,
    };
    video::validate_request(&request)?;

    let clip = generator
        .generate(upload.bytes.to_vec(), request)
        .await
        .map_err(|err| ApiError::from_core(err, FAILURE))?;

    let filename = video::download_filename(upload.filename.as_deref(), unix_timestamp());
    let headers = [
        (header::CONTENT_TYPE, "image/gif".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
        (header::CONTENT_LENGTH, clip.gif.len().to_string()),
        (
            header::HeaderName::from_static("x-generation-time"),
            format!("{:.3}", clip.generation_time),
        ),
        (
            header::HeaderName::from_static("x-num-frames"),
            clip.num_frames.to_string(),
        ),
        (header::HeaderName::from_static("x-fps"), clip.fps.to_string()),
        (
            header::HeaderName::from_static("x-video-duration"),
            format!("{:.3}", clip.duration),
        ),
        (
            header::HeaderName::from_static("x-resolution"),
            format!("{}x{}", clip.width, clip.height),
        ),
    ];
    Ok((headers, clip.gif).into_response())
}
