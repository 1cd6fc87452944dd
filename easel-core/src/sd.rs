//! Stable Diffusion v1.x pipeline assembled from pretrained components.
//!
//! Inference is fixed to f32 on CPU and no safety filter is applied; images
//! are returned exactly as the model produced them.

use std::sync::Arc;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::info;

use crate::{
    tensor_to_image, GenerationRequest, LoadOptions, Loader, PipelineFactory, PipelineLike,
    DEFAULT_HEIGHT, DEFAULT_WIDTH,
};

/// Tokenizer shipped separately from the diffusion weights.
const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

const VAE_SCALE: f64 = 0.18215;
const LATENT_CHANNELS: usize = 4;

pub struct SdPipeline {
    device: Device,
    dtype: DType,
    config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    clip: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl SdPipeline {
    /// Encodes a prompt into CLIP hidden states, padded to the model's
    /// context length. Prompts past the 77-token context are cut, matching
    /// the reference pipeline.
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let clip_config = &self.config.clip;
        let pad_token = clip_config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = self
            .tokenizer
            .token_to_id(pad_token)
            .ok_or_else(|| Error::msg(format!("tokenizer has no token {pad_token:?}")))?;

        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(clip_config.max_position_embeddings);
        tokens.resize(clip_config.max_position_embeddings, pad_id);

        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip.forward(&tokens)?)
    }
}

impl PipelineLike for SdPipeline {
    fn run(&self, request: &GenerationRequest) -> Result<DynamicImage> {
        let width = request.width();
        let height = request.height();
        let steps = request.steps();
        let guidance = request.guidance();

        // The VAE downscales by 8; other sizes cannot be decoded.
        if height % 8 != 0 || width % 8 != 0 {
            anyhow::bail!("height and width must be multiples of 8, got {height}x{width}");
        }
        if let Some(seed) = request.seed {
            self.device.set_seed(seed)?;
        }

        let mut scheduler = self.config.build_scheduler(steps)?;

        // Classifier-free guidance: one unconditional and one prompted pass
        // per step, batched together.
        let text_embeddings = self.encode_prompt(&request.prompt)?;
        let uncond_embeddings = self.encode_prompt("")?;
        let embeddings = Tensor::cat(&[uncond_embeddings, text_embeddings], 0)?;

        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, LATENT_CHANNELS, height / 8, width / 8),
            &self.device,
        )?
        .to_dtype(self.dtype)?;
        let mut latents = (latents * scheduler.init_noise_sigma())?;

        let timesteps = scheduler.timesteps().to_vec();
        for timestep in timesteps {
            let input = Tensor::cat(&[&latents, &latents], 0)?;
            let input = scheduler.scale_model_input(input, timestep)?;
            let noise_pred = self.unet.forward(&input, timestep as f64, &embeddings)?;
            let chunks = noise_pred.chunk(2, 0)?;
            let (uncond, prompted) = (&chunks[0], &chunks[1]);
            let noise_pred = (uncond + ((prompted - uncond)? * guidance)?)?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        let decoded = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let image = ((decoded / 2.)? + 0.5)?.clamp(0f32, 1.)?;
        let image = (image * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&image)
    }
}

pub struct SdLoader;

impl SdLoader {
    /// Construction recipe for a [`crate::ModelHandle`]; the handle invokes
    /// it at most once per process.
    pub fn factory(api: Api, options: LoadOptions) -> PipelineFactory {
        Box::new(move || {
            let api = api.clone();
            let options = options.clone();
            Box::pin(async move {
                let pipeline = SdLoader::load(api, options).await?;
                Ok(Arc::new(pipeline) as Arc<dyn PipelineLike>)
            })
        })
    }
}

impl Loader for SdLoader {
    type Pipeline = SdPipeline;

    async fn load(api: Api, options: LoadOptions) -> Result<SdPipeline> {
        // Fixed per the deployment target: f32 weights on CPU.
        let device = Device::Cpu;
        let dtype = DType::F32;

        // v1-4 weights share the v1-5 architecture, so the stock config
        // applies to both.
        let config =
            StableDiffusionConfig::v1_5(None, Some(DEFAULT_HEIGHT), Some(DEFAULT_WIDTH));

        let tokenizer_file = api
            .model(TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        let repo = api.repo(hf_hub::Repo::model(options.model_id.clone()));

        let clip_file = repo
            .get("text_encoder/model.safetensors")
            .await
            .context("failed to get CLIP text encoder weights")?;
        let clip =
            stable_diffusion::build_clip_transformer(&config.clip, clip_file, &device, dtype)
                .context("failed to load CLIP text encoder")?;

        let vae_file = repo
            .get("vae/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get VAE weights")?;
        let vae = config
            .build_vae(vae_file, &device, dtype)
            .context("failed to load VAE")?;

        let unet_file = repo
            .get("unet/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get UNet weights")?;
        let unet = config
            .build_unet(unet_file, &device, LATENT_CHANNELS, false, dtype)
            .context("failed to load UNet")?;

        info!(model = %options.model_id, "pipeline components loaded");

        Ok(SdPipeline {
            device,
            dtype,
            config,
            tokenizer,
            clip,
            unet,
            vae,
        })
    }
}
