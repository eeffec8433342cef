use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    routing::post,
    Json, Router,
};
use kiln_core::transcribe::{self, Transcriber};
use serde::Serialize;

use super::form::Form;
use crate::error::ApiError;

const FAILURE: &str = "Transcription failed";

pub fn router(transcriber: Arc<Transcriber>) -> Router {
    Router::new()
        .route("/api/v1/transcribe", post(transcribe_audio))
        .with_state(transcriber)
}

#[derive(Serialize)]
struct TranscriptionResponse {
    transcription: String,
    processing_info: ProcessingInfo,
}

#[derive(Serialize)]
struct ProcessingInfo {
    filename: Option<String>,
    content_type: Option<String>,
    chunks: usize,
    audio_duration: f64,
    processing_time: f64,
}

async fn transcribe_audio(
    State(transcriber): State<Arc<Transcriber>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<TranscriptionResponse>, ApiError> {
    let mut form = Form::read(multipart?, &["file"]).await?;
    let upload = form
        .take_file("file")
        .ok_or_else(|| ApiError::bad_request("No file uploaded"))?;
    transcribe::validate_upload(upload.filename.as_deref(), upload.bytes.len())?;

    let result = transcriber
        .transcribe(upload.bytes.to_vec())
        .await
        .map_err(|err| ApiError::from_core(err, FAILURE))?;

    Ok(Json(TranscriptionResponse {
        transcription: result.text,
        processing_info: ProcessingInfo {
            filename: upload.filename,
            content_type: upload.content_type,
            chunks: result.chunks,
            audio_duration: result.audio_duration,
            processing_time: result.processing_time,
        },
    }))
}
