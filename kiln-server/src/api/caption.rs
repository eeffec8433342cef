//! Image captioning endpoint.

use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    routing::post,
    Json, Router,
};
use kiln_core::caption::{self, Caption, CaptionGenerator, CaptionParams};
use tracing::info;

use super::form::Form;
use crate::error::ApiError;

const FAILURE: &str = "Internal server error during caption generation";

pub fn router(generator: Arc<CaptionGenerator>) -> Router {
    Router::new()
        .route("/api/v1/caption", post(generate_caption))
        .with_state(generator)
}

async fn generate_caption(
    State(generator): State<Arc<CaptionGenerator>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Caption>, ApiError> {
    let mut form = Form::read(multipart?, &["file"]).await?;
    let upload = form
        .take_file("file")
        .ok_or_else(|| ApiError::bad_request("No file uploaded"))?;

    caption::validate_content_type(upload.content_type.as_deref())?;
    caption::validate_file_size(upload.bytes.len())?;

    let defaults = CaptionParams::default();
    let params = CaptionParams {
        max_new_tokens: form.parse_or("max_new_tokens", defaults.max_new_tokens)?,
        temperature: form.parse_or("temperature", defaults.temperature)?,
        do_sample: form.flag_or("do_sample", defaults.do_sample)?,
    };
    caption::validate_params(&params)?;
    info!(
        filename = upload.filename.as_deref().unwrap_or_default(),
        bytes = upload.bytes.len(),
        "Caption request accepted"
    );

    let caption = generator
        .generate(upload.bytes.to_vec(), params)
        .await
        .map_err(|err| ApiError::from_core(err, FAILURE))?;
    Ok(Json(caption))
}
