use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::parler_tts;
use hf_hub::api::tokio::Api;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::synthesize::{SpeechSynthesizer, Voice};
use crate::util::select_best_device;
use crate::{audio, DeviceMap, Loader, ModelLike};

/// Longest text segment generated in one pass.
const MAX_SEGMENT_CHARS: usize = 240;
/// Decoder steps per segment, a little over ten seconds of codes.
const MAX_STEPS: usize = 1024;
const PEAK_LEVEL: f32 = 0.95;

/// Groups sentences into segments of at most `max_chars` characters.
///
/// A sentence longer than `max_chars` is split on whitespace.
pub fn split_segments(text: &str, max_chars: usize) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut push = |current: &mut String, piece: &str| {
        let needed = if current.is_empty() { 0 } else { 1 } + piece.chars().count();
        if !current.is_empty() && current.chars().count() + needed > max_chars {
            segments.push(std::mem::take(current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(piece);
    };

    for sentence in text.split_inclusive(['.', '!', '?', '\n']) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        if sentence.chars().count() <= max_chars {
            push(&mut current, sentence);
        } else {
            for word in sentence.split_whitespace() {
                push(&mut current, word);
            }
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Scales so the loudest sample sits at `PEAK_LEVEL`. Silence is left alone.
fn normalize_peak(pcm: &mut [f32]) {
    let peak = pcm.iter().fold(0f32, |acc, s| acc.max(s.abs()));
    if peak > f32::EPSILON {
        let gain = PEAK_LEVEL / peak;
        pcm.iter_mut().for_each(|s| *s *= gain);
    }
}

pub struct ParlerModel {
    device: Device,
    tokenizer: Tokenizer,
    sample_rate: u32,
    model: Mutex<Option<parler_tts::Model>>,
}

impl ParlerModel {
    fn tokens(&self, text: &str) -> Result<Tensor> {
        let ids = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        Ok(Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?)
    }
}

impl ModelLike for ParlerModel {
    fn release(&self) -> Result<()> {
        if self
            .model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            info!("Released Parler-TTS weights");
        }
        Ok(())
    }
}

impl SpeechSynthesizer for ParlerModel {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn synthesize(&self, text: &str, voice: &Voice) -> Result<Vec<Vec<i16>>> {
        let description = self.tokens(voice.style)?;
        let mut guard = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        let model = guard.as_mut().context("Parler-TTS model has been released")?;

        let segments = split_segments(text, MAX_SEGMENT_CHARS);
        let total = segments.len();
        let mut chunks = Vec::with_capacity(total);
        for (idx, segment) in segments.iter().enumerate() {
            debug!("Synthesizing segment {}/{}", idx + 1, total);
            let prompt = self.tokens(segment)?;
            // greedy decoding keeps a voice stable across segments
            let lp = LogitsProcessor::new(0, None, None);
            let codes = model.generate(&prompt, &description, lp, MAX_STEPS)?;
            let codes = codes.to_dtype(DType::I64)?.unsqueeze(0)?;
            let pcm = model.audio_encoder.decode_codes(&codes)?;
            let mut pcm = pcm.i((0, 0))?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
            normalize_peak(&mut pcm);
            chunks.push(audio::f32_to_i16(&pcm));
        }
        Ok(chunks)
    }
}

pub struct ParlerLoader;

impl Loader for ParlerLoader {
    type Model = ParlerModel;

    async fn load(model_id: &str, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let repo = api.model(model_id.to_string());
        let config_file = repo
            .get("config.json")
            .await
            .context("failed to get Parler-TTS config")?;
        let tokenizer_file = repo
            .get("tokenizer.json")
            .await
            .context("failed to get Parler-TTS tokenizer")?;
        let weights_file = repo
            .get("model.safetensors")
            .await
            .context("failed to get Parler-TTS weights")?;

        let config: parler_tts::Config = serde_json::from_str(
            &std::fs::read_to_string(config_file).context("failed to read Parler-TTS config")?,
        )
        .context("failed to parse Parler-TTS config")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load Parler-TTS tokenizer")?;
        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[weights_file], DType::F32, &device)
                .context("failed to build Parler-TTS var builder")?
        };
        let sample_rate = config.audio_encoder.sampling_rate as u32;
        let model = parler_tts::Model::new(&config, vb).context("failed to load Parler-TTS model")?;
        info!(sample_rate, "Parler-TTS model ready");

        Ok(ParlerModel {
            device,
            tokenizer,
            sample_rate,
            model: Mutex::new(Some(model)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_respect_limit_and_keep_order() {
        let text = "One two three. Four five! Six seven eight nine? Ten.";
        let segments = split_segments(text, 20);
        assert!(segments.iter().all(|s| s.chars().count() <= 20), "{segments:?}");
        assert_eq!(segments.join(" "), text);
    }

    #[test]
    fn oversized_sentence_splits_on_words() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let segments = split_segments(text, 12);
        assert!(segments.len() > 1);
        assert!(segments.iter().all(|s| s.chars().count() <= 12));
        assert_eq!(segments.join(" "), text);
    }

    #[test]
    fn short_text_is_one_segment() {
        assert_eq!(split_segments("  Hello there.  ", 240), vec!["Hello there."]);
        assert!(split_segments("   ", 240).is_empty());
    }

    #[test]
    fn peak_normalisation() {
        let mut pcm = vec![0.1, -0.5, 0.25];
        normalize_peak(&mut pcm);
        assert!((pcm[1] + PEAK_LEVEL).abs() < 1e-6);
        let mut silence = vec![0.0; 4];
        normalize_peak(&mut silence);
        assert_eq!(silence, vec![0.0; 4]);
    }
}
