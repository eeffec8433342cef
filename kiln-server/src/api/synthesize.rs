//! Text-to-speech endpoints.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use kiln_core::synthesize::{self, SpeechRequest, Synthesizer, Voice, VOICES};
use serde::Serialize;

use crate::error::ApiError;

const FAILURE: &str = "Speech synthesis failed";

pub fn router(synthesizer: Arc<Synthesizer>) -> Router {
    Router::new()
        .route("/api/v1/synthesize", post(synthesize_speech))
        .route("/api/v1/synthesize/", post(synthesize_speech))
        .route("/api/v1/voices", get(list_voices))
        .with_state(synthesizer)
}

#[derive(Serialize)]
struct VoiceList {
    voices: &'static [Voice],
}

async fn list_voices() -> Json<VoiceList> {
    Json(VoiceList { voices: VOICES })
}

async fn synthesize_speech(
    State(synthesizer): State<Arc<Synthesizer>>,
    request: Result<Json<SpeechRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = request?;
    synthesize::validate_request(&request)?;

    let speech = synthesizer
        .synthesize(request)
        .await
        .map_err(|err| ApiError::from_core(err, FAILURE))?;

    let headers = [
        (header::CONTENT_TYPE, "audio/wav".to_string()),
        (
            header::CONTENT_DISPOSITION,
            "attachment; filename=\"synthesized_speech.wav\"".to_string(),
        ),
        (header::CONTENT_LENGTH, speech.wav.len().to_string()),
        (
            header::HeaderName::from_static("x-generation-time"),
            format!("{:.3}", speech.generation_time),
        ),
        (
            header::HeaderName::from_static("x-audio-duration"),
            format!("{:.3}", speech.audio_duration),
        ),
        (
            header::HeaderName::from_static("x-rtf"),
            format!("{:.3}", speech.rtf),
        ),
    ];
    Ok((headers, speech.wav).into_response())
}
