use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer};
use candle_transformers::models::flux::{autoencoder, model, sampling};
use candle_transformers::models::t5::{self, T5EncoderModel};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::imagine::{ImagePipeline, ImageRequest};
use crate::util::{select_best_device, tensor_to_image};
use crate::{DeviceMap, Loader, ModelLike};

mod noise;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    /// Picks the variant from a repository name, defaulting to schnell.
    pub fn from_model_id(model_id: &str) -> Self {
        let name = model_id.to_uppercase();
        if name.contains("DEV") && !name.contains("SCHNELL") {
            Self::Dev
        } else {
            Self::Schnell
        }
    }

    fn weights_file(self) -> &'static str {
        match self {
            Self::Schnell => "flux1-schnell.safetensors",
            Self::Dev => "flux1-dev.safetensors",
        }
    }

    fn configs(self) -> (model::Config, autoencoder::Config) {
        match self {
            Self::Schnell => (model::Config::schnell(), autoencoder::Config::schnell()),
            Self::Dev => (model::Config::dev(), autoencoder::Config::dev()),
        }
    }
}

struct Components {
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: autoencoder::AutoEncoder,
    flux_model: model::Flux,
}

pub struct FluxModel {
    device: Device,
    dtype: DType,
    variant: FluxVariant,
    // T5 keeps a mutable cache, so one request encodes at a time.
    components: Mutex<Option<Components>>,
}

impl FluxModel {
    fn encode_prompt(
        &self,
        components: &mut Components,
        prompt: &str,
        max_sequence_length: usize,
    ) -> Result<(Tensor, Tensor)> {
        let mut t5_tokens = components
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(max_sequence_length, 0);
        let input_token_ids = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = components.t5_model.forward(&input_token_ids)?;

        let clip_tokens = components
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let input_token_ids = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = components.clip_model.forward(&input_token_ids)?;
        Ok((t5_emb, clip_emb))
    }
}

impl ModelLike for FluxModel {
    fn release(&self) -> Result<()> {
        let released = self
            .components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if released.is_some() {
            info!("Released FLUX pipeline weights");
        }
        Ok(())
    }
}

impl ImagePipeline for FluxModel {
    fn generate(&self, request: &ImageRequest, seed: u64) -> Result<DynamicImage> {
        let mut guard = self
            .components
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let components = guard.as_mut().context("FLUX pipeline has been released")?;

        let height = request.height as usize;
        let width = request.width as usize;
        let noise_img = noise::gaussian(seed, height, width, &self.device)?.to_dtype(self.dtype)?;

        let (t5_emb, clip_emb) =
            self.encode_prompt(components, &request.prompt, request.max_sequence_length)?;
        let state = sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = match self.variant {
            FluxVariant::Schnell => sampling::get_schedule(request.num_inference_steps, None),
            FluxVariant::Dev => sampling::get_schedule(
                request.num_inference_steps,
                Some((state.img.dim(1)?, 0.5, 1.15)),
            ),
        };

        let latent_img = sampling::denoise(
            &components.flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            request.guidance_scale,
        )?;
        let unpacked = sampling::unpack(&latent_img, height, width)?;
        debug!("Generated latent image");

        let decoded = components.autoencoder.decode(&unpacked)?;
        debug!("Decoded image");

        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Model = FluxModel;

    async fn load(model_id: &str, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let variant = FluxVariant::from_model_id(model_id);
        info!(?variant, "Loading FLUX pipeline");
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();

        // --- T5 encoder and tokenizer ---
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model_file = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to load T5 model file")?;
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[t5_model_file], dtype, &device)
                .context("failed to build T5 var builder")?
        };
        let config_filename = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer_filename = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .await
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- CLIP text encoder and tokenizer ---
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model_file = clip_repo
            .get("model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[clip_model_file], dtype, &device)
                .context("failed to build CLIP var builder")?
        };
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer_filename = clip_repo
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Autoencoder and transformer, both from the requested repository ---
        let bf_repo = api.repo(hf_hub::Repo::model(model_id.to_string()));
        let (flux_config, autoencoder_config) = variant.configs();
        let autoencoder_model_file = bf_repo
            .get("ae.safetensors")
            .await
            .context("failed to get autoencoder model file")?;
        let autoencoder_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[autoencoder_model_file],
                dtype,
                &device,
            )
            .context("failed to build autoencoder var builder")?
        };
        let autoencoder = autoencoder::AutoEncoder::new(&autoencoder_config, autoencoder_vb)
            .context("failed to load autoencoder")?;

        let flux_model_file = bf_repo
            .get(variant.weights_file())
            .await
            .context("failed to get flux model file")?;
        let flux_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[flux_model_file], dtype, &device)
                .context("failed to build flux var builder")?
        };
        let flux_model =
            model::Flux::new(&flux_config, flux_vb).context("failed to load flux model")?;

        Ok(FluxModel {
            device,
            dtype,
            variant,
            components: Mutex::new(Some(Components {
                t5_model,
                t5_tokenizer,
                clip_model,
                clip_tokenizer,
                autoencoder,
                flux_model,
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_detection() {
        assert_eq!(
            FluxVariant::from_model_id("black-forest-labs/FLUX.1-schnell"),
            FluxVariant::Schnell
        );
        assert_eq!(
            FluxVariant::from_model_id("black-forest-labs/FLUX.1-dev"),
            FluxVariant::Dev
        );
        assert_eq!(FluxVariant::from_model_id("someone/flux-finetune"), FluxVariant::Schnell);
    }
}
