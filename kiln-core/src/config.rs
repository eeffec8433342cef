//! Process-wide settings, resolved once at startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{caption, imagine, synthesize, transcribe, video, DeviceMap, Error, Result};

/// The model-backed service a process exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Caption,
    Imagine,
    Transcribe,
    Synthesize,
    Video,
}

serde_plain::derive_display_from_serialize!(ServiceKind);
serde_plain::derive_fromstr_from_deserialize!(ServiceKind);

impl ServiceKind {
    pub fn default_model_id(self) -> &'static str {
        match self {
            Self::Caption => caption::DEFAULT_MODEL_ID,
            Self::Imagine => imagine::DEFAULT_MODEL_ID,
            Self::Transcribe => transcribe::DEFAULT_MODEL_ID,
            Self::Synthesize => synthesize::DEFAULT_MODEL_ID,
            Self::Video => video::DEFAULT_MODEL_ID,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Caption => "Image-to-Text Service",
            Self::Imagine => "Text-to-Image Service",
            Self::Transcribe => "Speech-to-Text Service",
            Self::Synthesize => "Text-to-Speech Service",
            Self::Video => "Image-to-Video Service",
        }
    }

    /// Whether startup must fail without a hub token.
    ///
    /// The default Whisper checkpoint is public, the other defaults are gated.
    pub fn requires_token(self) -> bool {
        !matches!(self, Self::Transcribe)
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub service: ServiceKind,
    pub model_id: String,
    pub device_map: DeviceMap,
    pub hf_token: Option<String>,
    pub max_concurrent_generations: usize,
    /// `None` disables the request-side deadline.
    pub generation_timeout: Option<Duration>,
}

pub const DEFAULT_MAX_CONCURRENT_GENERATIONS: usize = 2;
pub const DEFAULT_GENERATION_TIMEOUT_SECS: u64 = 300;

impl Settings {
    pub fn new(service: ServiceKind) -> Self {
        Self {
            service,
            model_id: service.default_model_id().to_string(),
            device_map: DeviceMap::default(),
            hf_token: None,
            max_concurrent_generations: DEFAULT_MAX_CONCURRENT_GENERATIONS,
            generation_timeout: Some(Duration::from_secs(DEFAULT_GENERATION_TIMEOUT_SECS)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let token_missing = self
            .hf_token
            .as_deref()
            .is_none_or(|token| token.trim().is_empty());
        if self.service.requires_token() && token_missing {
            return Err(Error::Config(
                "HUGGINGFACE_HUB_TOKEN is not set in the environment".to_string(),
            ));
        }
        if self.model_id.trim().is_empty() {
            return Err(Error::Config("model id must not be empty".to_string()));
        }
        if self.max_concurrent_generations == 0 {
            return Err(Error::Config(
                "max concurrent generations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_kind_round_trips_through_strings() {
        assert_eq!("synthesize".parse::<ServiceKind>().unwrap(), ServiceKind::Synthesize);
        assert_eq!(ServiceKind::Video.to_string(), "video");
        assert!("painting".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn missing_token_fails_validation_for_gated_services() {
        let settings = Settings::new(ServiceKind::Imagine);
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("HUGGINGFACE_HUB_TOKEN")));

        let blank = Settings {
            hf_token: Some("   ".into()),
            ..Settings::new(ServiceKind::Caption)
        };
        assert!(blank.validate().is_err());
    }

    #[test]
    fn transcription_runs_without_token() {
        assert!(Settings::new(ServiceKind::Transcribe).validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let settings = Settings {
            max_concurrent_generations: 0,
            ..Settings::new(ServiceKind::Transcribe)
        };
        assert!(settings.validate().is_err());
    }
}
