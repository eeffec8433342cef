use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_transformers::models::whisper::{self as m, Config};
use hf_hub::api::tokio::Api;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::transcribe::SpeechRecognizer;
use crate::util::select_best_device;
use crate::{DeviceMap, Loader, ModelLike};

mod mel;

pub use mel::mel_filters;

/// Upper bound on decoded tokens per 30 second window.
const MAX_NEW_TOKENS: usize = 444;
const LANGUAGE_TOKEN: &str = "<|en|>";

struct Prompt {
    sot: u32,
    language: Option<u32>,
    transcribe: u32,
    no_timestamps: u32,
    eot: u32,
}

impl Prompt {
    fn tokens(&self) -> Vec<u32> {
        let mut tokens = vec![self.sot];
        tokens.extend(self.language);
        tokens.push(self.transcribe);
        tokens.push(self.no_timestamps);
        tokens
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .with_context(|| format!("no token-id for {token}"))
}

pub struct WhisperModel {
    device: Device,
    config: Config,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    prompt: Prompt,
    suppress_tokens: Tensor,
    model: Mutex<Option<m::model::Whisper>>,
}

impl WhisperModel {
    /// Log-mel features for one window, zero padded to the encoder's 30 seconds.
    fn features(&self, samples: &[f32]) -> Result<Tensor> {
        let mut pcm = samples.to_vec();
        pcm.resize(pcm.len().max(m::N_SAMPLES), 0.0);
        let mel = m::audio::pcm_to_mel(&self.config, &pcm, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?;
        Ok(mel.narrow(2, 0, frames.min(m::N_FRAMES))?)
    }

    fn decode(&self, model: &mut m::model::Whisper, mel: &Tensor) -> Result<Vec<u32>> {
        let audio_features = model.encoder.forward(mel, true)?;
        let mut tokens = self.prompt.tokens();
        let prompt_len = tokens.len();
        let budget = MAX_NEW_TOKENS.min(self.config.max_target_positions.saturating_sub(prompt_len));

        for i in 0..budget {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&tokens_t, &audio_features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let logits = logits.broadcast_add(&self.suppress_tokens)?;
            let next_token = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;
            if next_token == self.prompt.eot {
                break;
            }
            tokens.push(next_token);
        }
        Ok(tokens.split_off(prompt_len))
    }
}

impl ModelLike for WhisperModel {
    fn release(&self) -> Result<()> {
        if self
            .model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            info!("Released Whisper weights");
        }
        Ok(())
    }
}

impl SpeechRecognizer for WhisperModel {
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String> {
        if sample_rate as usize != m::SAMPLE_RATE {
            anyhow::bail!("expected {} Hz audio, got {sample_rate} Hz", m::SAMPLE_RATE);
        }
        let mel = self.features(samples)?;

        let mut guard = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        let model = guard.as_mut().context("Whisper model has been released")?;
        let tokens = self.decode(model, &mel)?;
        debug!(tokens = tokens.len(), "Window decoded");

        self.tokenizer.decode(&tokens, true).map_err(Error::msg)
    }
}

pub struct WhisperLoader;

impl Loader for WhisperLoader {
    type Model = WhisperModel;

    async fn load(model_id: &str, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let repo = api.model(model_id.to_string());
        let config_file = repo
            .get("config.json")
            .await
            .context("failed to get Whisper config")?;
        let tokenizer_file = repo
            .get("tokenizer.json")
            .await
            .context("failed to get Whisper tokenizer")?;
        let weights_file = repo
            .get("model.safetensors")
            .await
            .context("failed to get Whisper weights")?;

        let config: Config = serde_json::from_str(
            &std::fs::read_to_string(config_file).context("failed to read Whisper config")?,
        )
        .context("failed to parse Whisper config")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load Whisper tokenizer")?;

        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[weights_file], m::DTYPE, &device)
                .context("failed to build Whisper var builder")?
        };
        let model = m::model::Whisper::load(&vb, config.clone())
            .context("failed to load Whisper model")?;

        let multilingual = !model_id.ends_with(".en");
        let prompt = Prompt {
            sot: token_id(&tokenizer, m::SOT_TOKEN)?,
            language: if multilingual {
                Some(token_id(&tokenizer, LANGUAGE_TOKEN)?)
            } else {
                None
            },
            transcribe: token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?,
            no_timestamps: token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
            eot: token_id(&tokenizer, m::EOT_TOKEN)?,
        };

        let suppress: Vec<f32> = (0..config.vocab_size as u32)
            .map(|i| {
                if config.suppress_tokens.contains(&i) || i == prompt.no_timestamps {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();
        let suppress_tokens = Tensor::new(suppress.as_slice(), &device)?.to_dtype(DType::F32)?;
        let mel_filters = mel_filters(m::SAMPLE_RATE as u32, m::N_FFT, config.num_mel_bins);
        info!(multilingual, "Whisper model ready");

        Ok(WhisperModel {
            device,
            config,
            tokenizer,
            mel_filters,
            prompt,
            suppress_tokens,
            model: Mutex::new(Some(model)),
        })
    }
}
