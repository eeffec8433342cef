use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::blip;
use hf_hub::api::tokio::Api;
use image::imageops::FilterType;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::caption::{CaptionParams, Captioner};
use crate::util::select_best_device;
use crate::{DeviceMap, Loader, ModelLike};

const IMAGE_SIZE: u32 = 384;
const BOS_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;
const MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

pub struct BlipModel {
    device: Device,
    tokenizer: Tokenizer,
    // the text decoder carries a kv cache between steps
    model: Mutex<Option<blip::BlipForConditionalGeneration>>,
}

/// Resizes to the vision tower's input and normalises with CLIP statistics.
fn preprocess(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let img = image
        .resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle)
        .to_rgb8();
    let side = IMAGE_SIZE as usize;
    let data = img.into_raw();
    let pixels = Tensor::from_vec(data, (side, side, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 255.0, 0.0)?;
    let mean = Tensor::new(&MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&STD, &Device::Cpu)?.reshape((3, 1, 1))?;
    let normalised = pixels.broadcast_sub(&mean)?.broadcast_div(&std)?;
    Ok(normalised.to_device(device)?)
}

impl ModelLike for BlipModel {
    fn release(&self) -> Result<()> {
        if self
            .model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            info!("Released BLIP weights");
        }
        Ok(())
    }
}

impl Captioner for BlipModel {
    fn caption(&self, image: &DynamicImage, params: &CaptionParams) -> Result<String> {
        let mut guard = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        let model = guard.as_mut().context("BLIP model has been released")?;

        let pixels = preprocess(image, &self.device)?;
        let image_embeds = pixels.unsqueeze(0)?.apply(model.vision_model())?;

        let temperature = params.do_sample.then_some(params.temperature);
        let mut logits_processor = LogitsProcessor::new(rand::random(), temperature, None);

        model.reset_kv_cache();
        let mut token_ids = vec![BOS_TOKEN_ID];
        for index in 0..params.max_new_tokens {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = model.text_decoder().forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let token = logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }
        model.reset_kv_cache();
        debug!(tokens = token_ids.len() - 1, "Caption decoded");

        self.tokenizer
            .decode(&token_ids[1..], true)
            .map_err(Error::msg)
    }
}

pub struct BlipLoader;

impl Loader for BlipLoader {
    type Model = BlipModel;

    async fn load(model_id: &str, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let repo = api.repo(hf_hub::Repo::with_revision(
            model_id.to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/18".to_string(),
        ));
        let model_file = repo
            .get("model.safetensors")
            .await
            .context("failed to get BLIP model file")?;
        let tokenizer_file = api
            .model(model_id.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get BLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load BLIP tokenizer")?;

        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[model_file], DType::F32, &device)
                .context("failed to build BLIP var builder")?
        };
        let config = blip::Config::image_captioning_large();
        let model = blip::BlipForConditionalGeneration::new(&config, vb)
            .context("failed to load BLIP model")?;

        Ok(BlipModel {
            device,
            tokenizer,
            model: Mutex::new(Some(model)),
        })
    }
}
