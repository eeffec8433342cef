//! Speech-to-text over fixed-length windows of an uploaded WAV file.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info};

use crate::validate::{self, Validation};
use crate::{audio, ClientError, ClientErrorKind, Error, InferencePool, ModelLike, ModelManager, Result};

pub const DEFAULT_MODEL_ID: &str = "openai/whisper-tiny";
pub const MAX_FILE_SIZE_MB: usize = 10;
pub const MAX_AUDIO_DURATION_SEC: f64 = 600.0;
pub const TARGET_SAMPLE_RATE: u32 = 16_000;
pub const CHUNK_DURATION_SEC: f64 = 30.0;
pub const SUPPORTED_AUDIO_FORMATS: &[&str] = &[".wav"];
pub const MAX_FILENAME_LENGTH: usize = 255;
/// Stands in for a window whose transcription failed.
pub const CHUNK_ERROR_PLACEHOLDER: &str = "[Error in chunk]";

pub trait SpeechRecognizer: ModelLike {
    /// Transcribes one mono window sampled at `sample_rate`.
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct Transcription {
    pub text: String,
    pub chunks: usize,
    pub audio_duration: f64,
    pub processing_time: f64,
    pub model_name: String,
}

/// Checks everything that can be known before decoding.
pub fn validate_upload(filename: Option<&str>, len: usize) -> Validation {
    let filename = validate::require_filename("file", filename)?;
    if filename.chars().count() > MAX_FILENAME_LENGTH {
        return Err(ClientError::new(
            ClientErrorKind::TooLong,
            "file",
            format!("Filename too long. Maximum length is {MAX_FILENAME_LENGTH} characters"),
        ));
    }
    validate::ensure_extension("file", filename, SUPPORTED_AUDIO_FORMATS)?;
    validate::ensure_max_bytes("file", len, MAX_FILE_SIZE_MB)
}

pub fn validate_duration(duration_secs: f64) -> Validation {
    if duration_secs <= MAX_AUDIO_DURATION_SEC {
        return Ok(());
    }
    Err(ClientError::new(
        ClientErrorKind::OutOfRange,
        "file",
        format!(
            "Audio duration ({duration_secs:.1}s) exceeds maximum allowed duration ({MAX_AUDIO_DURATION_SEC:.0}s)"
        ),
    ))
}

/// Decodes, checks duration, downmixes and resamples to the target rate.
pub fn prepare_audio(bytes: &[u8]) -> Result<(Vec<f32>, f64)> {
    let decoded = audio::decode_wav(bytes)?;
    let duration = decoded.duration_secs();
    validate_duration(duration)?;

    let mono = audio::downmix(&decoded.samples, decoded.channels);
    if decoded.channels > 1 {
        info!("Converting stereo to mono");
    }
    if decoded.sample_rate != TARGET_SAMPLE_RATE {
        info!(
            "Resampling from {} Hz to {} Hz",
            decoded.sample_rate, TARGET_SAMPLE_RATE
        );
    }
    let samples = audio::resample(&mono, decoded.sample_rate, TARGET_SAMPLE_RATE)
        .map_err(Error::Inference)?;
    Ok((samples, duration))
}

/// Transcribes windows in order, replacing failed ones with the placeholder.
pub fn transcribe_chunks(recognizer: &dyn SpeechRecognizer, chunks: &[&[f32]]) -> Vec<String> {
    let total = chunks.len();
    chunks
        .iter()
        .enumerate()
        .map(|(idx, chunk)| {
            info!("Processing chunk {}/{}", idx + 1, total);
            match recognizer.transcribe(chunk, TARGET_SAMPLE_RATE) {
                Ok(text) => text.trim().to_string(),
                Err(err) => {
                    error!("Error processing chunk {}: {err:#}", idx + 1);
                    CHUNK_ERROR_PLACEHOLDER.to_string()
                }
            }
        })
        .collect()
}

pub struct Transcriber {
    models: Arc<ModelManager<dyn SpeechRecognizer>>,
    pool: InferencePool,
}

impl Transcriber {
    pub fn new(models: Arc<ModelManager<dyn SpeechRecognizer>>, pool: InferencePool) -> Self {
        Self { models, pool }
    }

    pub async fn transcribe(&self, bytes: Vec<u8>) -> Result<Transcription> {
        let recognizer = self.models.get()?;
        let model_name = self.models.model_id().to_string();

        let (samples, audio_duration) = self.pool.offload(move || prepare_audio(&bytes)).await?;

        let (texts, processing_time) = self
            .pool
            .run(move || {
                let chunks = audio::chunk(&samples, TARGET_SAMPLE_RATE, CHUNK_DURATION_SEC);
                info!(
                    "Split audio into {} chunks of {} seconds each",
                    chunks.len(),
                    CHUNK_DURATION_SEC
                );
                let start = Instant::now();
                let texts = transcribe_chunks(recognizer.as_ref(), &chunks);
                Ok((texts, start.elapsed().as_secs_f64()))
            })
            .await?;

        info!("File transcription completed. Total chunks: {}", texts.len());
        Ok(Transcription {
            chunks: texts.len(),
            text: texts.join(" "),
            audio_duration,
            processing_time,
            model_name,
        })
    }
}
