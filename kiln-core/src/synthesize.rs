//! Text-to-speech with a fixed voice catalogue.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::validate::{self, Validation};
use crate::{audio, ClientError, ClientErrorKind, Error, InferencePool, ModelLike, ModelManager, Result};

pub const DEFAULT_MODEL_ID: &str = "parler-tts/parler-tts-mini-v1";
pub const MAX_TEXT_LENGTH: usize = 5000;
pub const DEFAULT_VOICE: &str = "tara";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Voice {
    pub name: &'static str,
    pub description: &'static str,
    /// Speaker prompt handed to description-conditioned models.
    #[serde(skip)]
    pub style: &'static str,
}

pub const VOICES: &[Voice] = &[
    Voice {
        name: "tara",
        description: "Female voice",
        style: "Tara speaks with a warm, clear and moderately paced voice. The recording is very close-sounding and clean.",
    },
    Voice {
        name: "leah",
        description: "Female voice",
        style: "Leah speaks softly with a slightly slow pace and a calm tone in a quiet room.",
    },
    Voice {
        name: "jess",
        description: "Female voice",
        style: "Jess speaks quickly with an energetic and expressive delivery. The audio is crisp.",
    },
    Voice {
        name: "leo",
        description: "Male voice",
        style: "Leo speaks with a deep, steady voice at a moderate pace. The recording is clean with no background noise.",
    },
    Voice {
        name: "dan",
        description: "Male voice",
        style: "Dan speaks in a relaxed, conversational tone with a slightly fast pace.",
    },
    Voice {
        name: "mia",
        description: "Female voice",
        style: "Mia speaks with a bright, high-pitched voice and a cheerful delivery in a clean recording.",
    },
    Voice {
        name: "zac",
        description: "Male voice",
        style: "Zac speaks with a low-pitched, monotone voice at a slow pace. The audio is very clear.",
    },
];

pub fn voice_names() -> Vec<&'static str> {
    VOICES.iter().map(|voice| voice.name).collect()
}

pub fn find_voice(name: &str) -> Option<&'static Voice> {
    VOICES.iter().find(|voice| voice.name == name)
}

pub fn resolve_voice(name: &str) -> std::result::Result<&'static Voice, ClientError> {
    find_voice(name).ok_or_else(|| {
        ClientError::new(
            ClientErrorKind::InvalidChoice,
            "voice",
            format!("Invalid voice '{name}'. Choose from: {}", voice_names().join(", ")),
        )
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    #[serde(default = "default_voice")]
    pub voice: String,
}

fn default_voice() -> String {
    DEFAULT_VOICE.to_string()
}

pub trait SpeechSynthesizer: ModelLike {
    fn sample_rate(&self) -> u32;

    /// Produces the utterance as ordered chunks of mono PCM16 samples.
    fn synthesize(&self, text: &str, voice: &Voice) -> anyhow::Result<Vec<Vec<i16>>>;
}

#[derive(Debug, Clone)]
pub struct SynthesizedSpeech {
    pub wav: Vec<u8>,
    pub voice: &'static str,
    pub sample_rate: u32,
    pub audio_duration: f64,
    pub generation_time: f64,
    pub rtf: f64,
    pub model_name: String,
}

pub fn validate_request(request: &SpeechRequest) -> Validation {
    validate::ensure_not_blank("text", "Text", &request.text)?;
    validate::ensure_max_chars("text", "Text", &request.text, MAX_TEXT_LENGTH)?;
    resolve_voice(&request.voice).map(|_| ())
}

pub struct Synthesizer {
    models: Arc<ModelManager<dyn SpeechSynthesizer>>,
    pool: InferencePool,
}

impl Synthesizer {
    pub fn new(models: Arc<ModelManager<dyn SpeechSynthesizer>>, pool: InferencePool) -> Self {
        Self { models, pool }
    }

    pub async fn synthesize(&self, request: SpeechRequest) -> Result<SynthesizedSpeech> {
        let model = self.models.get()?;
        let model_name = self.models.model_id().to_string();
        let voice = resolve_voice(&request.voice)?;
        let preview: String = request.text.chars().take(50).collect();
        info!(
            "Starting speech synthesis for text: '{preview}...' with voice: {}",
            voice.name
        );

        let (chunks, sample_rate, generation_time) = self
            .pool
            .run(move || {
                let start = Instant::now();
                let chunks = model
                    .synthesize(&request.text, voice)
                    .map_err(Error::Inference)?;
                Ok((chunks, model.sample_rate(), start.elapsed().as_secs_f64()))
            })
            .await?;

        let samples: Vec<i16> = chunks.into_iter().flatten().collect();
        if samples.is_empty() {
            return Err(Error::Inference(anyhow::anyhow!("No audio chunks generated")));
        }
        let wav = audio::encode_wav_i16(&samples, sample_rate).map_err(Error::Inference)?;

        let audio_duration = samples.len() as f64 / f64::from(sample_rate.max(1));
        let rtf = if audio_duration > 0.0 {
            generation_time / audio_duration
        } else {
            0.0
        };
        info!(
            "Successfully generated {:.2} seconds of audio in {:.2} seconds (RTF: {:.2})",
            audio_duration, generation_time, rtf
        );

        Ok(SynthesizedSpeech {
            wav,
            voice: voice.name,
            sample_rate,
            audio_duration,
            generation_time,
            rtf,
            model_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ServiceKind, Settings};

    struct ScriptedSynth {
        chunks: Vec<Vec<i16>>,
    }

    impl ModelLike for ScriptedSynth {}

    impl SpeechSynthesizer for ScriptedSynth {
        fn sample_rate(&self) -> u32 {
            24_000
        }

        fn synthesize(&self, _: &str, _: &Voice) -> anyhow::Result<Vec<Vec<i16>>> {
            Ok(self.chunks.clone())
        }
    }

    async fn synthesizer(chunks: Vec<Vec<i16>>) -> Synthesizer {
        let model: Arc<dyn SpeechSynthesizer> = Arc::new(ScriptedSynth { chunks });
        let models = Arc::new(ModelManager::<dyn SpeechSynthesizer>::new(DEFAULT_MODEL_ID));
        let settings = Settings {
            hf_token: Some("token".into()),
            ..Settings::new(ServiceKind::Synthesize)
        };
        models
            .initialize(&settings, |_, _| async move { Ok(model) })
            .await
            .unwrap();
        Synthesizer::new(models, InferencePool::new(1, None))
    }

    fn request(voice: &str) -> SpeechRequest {
        SpeechRequest {
            text: "Hello there.".into(),
            voice: voice.into(),
        }
    }

    #[test]
    fn voice_defaults_to_tara() {
        let parsed: SpeechRequest = serde_json::from_str(r#"{"text": "hi"}"#).unwrap();
        assert_eq!(parsed.voice, "tara");
        assert!(validate_request(&parsed).is_ok());
    }

    #[test]
    fn request_rules() {
        let err = validate_request(&request("unknown")).unwrap_err();
        assert_eq!(err.kind, ClientErrorKind::InvalidChoice);
        assert!(err.detail.contains("tara, leah, jess, leo, dan, mia, zac"));

        let long = SpeechRequest {
            text: "a".repeat(MAX_TEXT_LENGTH + 1),
            voice: DEFAULT_VOICE.into(),
        };
        assert_eq!(validate_request(&long).unwrap_err().kind, ClientErrorKind::TooLong);
    }

    #[tokio::test]
    async fn chunks_are_concatenated_in_order() {
        let synth = synthesizer(vec![vec![1; 12_000], vec![2; 12_000]]).await;
        let speech = synth.synthesize(request("leo")).await.unwrap();
        assert_eq!(speech.wav.len(), 44 + 24_000 * 2);
        assert!((speech.audio_duration - 1.0).abs() < 1e-9);
        assert_eq!(speech.voice, "leo");

        let decoded = audio::decode_wav(&speech.wav).unwrap();
        let first = decoded.samples[0];
        let last = decoded.samples[decoded.samples.len() - 1];
        assert!(first < last);
    }

    #[tokio::test]
    async fn empty_output_is_a_server_fault() {
        let synth = synthesizer(vec![vec![], vec![]]).await;
        let err = synth.synthesize(request("tara")).await.unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
    }
}
