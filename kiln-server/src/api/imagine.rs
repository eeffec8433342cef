//! Text-to-image endpoints: a PNG download and a base64 JSON variant.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::header,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use kiln_core::imagine::{self, GeneratedImage, ImageGenerator, ImageRequest};
use serde::Serialize;
use serde_json::json;

use super::unix_timestamp;
use crate::error::ApiError;

const FAILURE: &str = "Image generation failed";

pub fn router(generator: Arc<ImageGenerator>) -> Router {
    Router::new()
        .route("/api/v1/imagine", post(generate_image_file))
        .route("/v1/images/generations", post(generate_image_json))
        .with_state(generator)
}

#[derive(Serialize)]
struct GenerationResponse {
    image_base64: String,
    prompt: String,
    seed: u64,
    generation_time: f64,
    metadata: serde_json::Value,
}

async fn generate(
    generator: &ImageGenerator,
    request: Result<Json<ImageRequest>, JsonRejection>,
) -> Result<GeneratedImage, ApiError> {
    let Json(request) = request?;
    imagine::validate_request(&request)?;
    generator
        .generate(request)
        .await
        .map_err(|err| ApiError::from_core(err, FAILURE))
}

async fn generate_image_file(
    State(generator): State<Arc<ImageGenerator>>,
    request: Result<Json<ImageRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let image = generate(&generator, request).await?;
    let filename = format!("generated_image_{}_{}.png", image.seed, unix_timestamp());
    let headers = [
        (header::CONTENT_TYPE, "image/png".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
        (header::CONTENT_LENGTH, image.png.len().to_string()),
        (
            header::HeaderName::from_static("x-generation-time"),
            image.generation_time.to_string(),
        ),
        (
            header::HeaderName::from_static("x-seed-used"),
            image.seed.to_string(),
        ),
    ];
    Ok((headers, image.png).into_response())
}

async fn generate_image_json(
    State(generator): State<Arc<ImageGenerator>>,
    request: Result<Json<ImageRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let image = generate(&generator, request).await?;
    Ok(Json(GenerationResponse {
        image_base64: BASE64_STANDARD.encode(&image.png),
        metadata: json!({
            "width": image.width,
            "height": image.height,
            "num_inference_steps": image.num_inference_steps,
            "guidance_scale": image.guidance_scale,
            "max_sequence_length": image.max_sequence_length,
            "model": image.model_name,
        }),
        prompt: image.prompt,
        seed: image.seed,
        generation_time: image.generation_time,
    }))
}
