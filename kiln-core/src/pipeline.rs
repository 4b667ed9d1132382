//! The diffusion pipeline behind each client session.
//!
//! Construction is cheap and does no I/O; the expensive weight load
//! happens in `initialize` (or implicitly on first `generate`), so a
//! session entry can exist before its pipeline is resident. `cleanup`
//! drops every component and synchronizes the device, after which the
//! instance is normally discarded.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, schedulers::Scheduler, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::config::{
    PipelineConfig, DEFAULT_HEIGHT, DEFAULT_WIDTH, GUIDANCE_SCALE, NEGATIVE_PROMPT,
    NUM_INFERENCE_STEPS,
};
use crate::error::PipelineError;
use crate::util::tensor_to_image;
use crate::{GenerationRequest, PipelineLike};

// Files expected under the model directory, diffusers layout.
const TOKENIZER_FILE: &str = "tokenizer.json";
const CLIP_FILE: &str = "text_encoder.safetensors";
const UNET_FILE: &str = "unet.safetensors";
const VAE_FILE: &str = "vae.safetensors";

/// Latent scaling factor of the v1.5 autoencoder.
const VAE_SCALE: f64 = 0.18215;

/// Everything loaded by `initialize`: models, tokenizer and the device
/// they live on. Dropping this frees the device memory.
struct Components {
    device: Device,
    dtype: DType,
    sd_config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    clip: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

pub struct SdPipeline {
    config: PipelineConfig,
    components: Option<Components>,
}

impl SdPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            components: None,
        }
    }

    /// Whether weights are currently resident on the device.
    pub fn is_ready(&self) -> bool {
        self.components.is_some()
    }

    fn load(&self) -> Result<Components, PipelineError> {
        let dir = self.config.model_dir();
        let tokenizer_file = weight_file(&dir, TOKENIZER_FILE)?;
        let clip_file = weight_file(&dir, CLIP_FILE)?;
        let unet_file = weight_file(&dir, UNET_FILE)?;
        let vae_file = weight_file(&dir, VAE_FILE)?;

        let device = self.config.device.select()?;
        let dtype = if device.is_cpu() {
            DType::F32
        } else {
            DType::F16
        };
        let sd_config =
            StableDiffusionConfig::v1_5(None, Some(DEFAULT_HEIGHT), Some(DEFAULT_WIDTH));

        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))?;
        let clip =
            stable_diffusion::build_clip_transformer(&sd_config.clip, clip_file, &device, dtype)
                .map_err(PipelineError::Load)?;
        let vae = sd_config
            .build_vae(vae_file, &device, dtype)
            .map_err(PipelineError::Load)?;
        let unet = sd_config
            .build_unet(unet_file, &device, 4, false, dtype)
            .map_err(PipelineError::Load)?;

        Ok(Components {
            device,
            dtype,
            sd_config,
            tokenizer,
            clip,
            unet,
            vae,
        })
    }
}

impl PipelineLike for SdPipeline {
    fn initialize(&mut self) -> Result<(), PipelineError> {
        if self.components.is_some() {
            debug!("pipeline already initialized");
            return Ok(());
        }
        info!(model = %self.config.model, "loading diffusion pipeline");
        match self.load() {
            Ok(components) => {
                self.components = Some(components);
                info!(model = %self.config.model, "pipeline ready");
                Ok(())
            }
            Err(e) => {
                // Unwind whatever the failed load left on the device
                // before the error propagates.
                let _ = self.cleanup();
                Err(e)
            }
        }
    }

    fn generate(&mut self, request: &GenerationRequest) -> Result<DynamicImage, PipelineError> {
        if self.components.is_none() {
            info!("pipeline not initialized, initializing first");
            self.initialize()?;
        }
        let components = self.components.as_ref().expect("initialized above");
        components.run(request)
    }

    fn cleanup(&mut self) -> Result<(), PipelineError> {
        let Some(components) = self.components.take() else {
            return Ok(());
        };
        let device = components.device.clone();
        drop(components);
        device.synchronize().map_err(PipelineError::Release)?;
        info!("pipeline released");
        Ok(())
    }
}

impl Components {
    /// Tokenize `prompt`, pad to the encoder's context length, and embed.
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor, PipelineError> {
        let max_len = self.sd_config.clip.max_position_embeddings;
        let pad_id = match &self.sd_config.clip.pad_with {
            Some(pad) => self.tokenizer.token_to_id(pad),
            None => self.tokenizer.token_to_id("<|endoftext|>"),
        }
        .ok_or_else(|| PipelineError::Tokenizer("no padding token in vocabulary".to_string()))?;

        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))?
            .get_ids()
            .to_vec();
        tokens.truncate(max_len);
        while tokens.len() < max_len {
            tokens.push(pad_id);
        }

        let tokens = Tensor::new(tokens.as_slice(), &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(PipelineError::Inference)?;
        self.clip.forward(&tokens).map_err(PipelineError::Inference)
    }

    fn run(&self, request: &GenerationRequest) -> Result<DynamicImage, PipelineError> {
        let width = request.width.unwrap_or(DEFAULT_WIDTH);
        let height = request.height.unwrap_or(DEFAULT_HEIGHT);

        // Conditional and negative-prompt embeddings, batched for a single
        // guided UNet pass per step.
        let cond = self.encode_prompt(&request.prompt)?;
        let uncond = self.encode_prompt(NEGATIVE_PROMPT)?;
        let text_embeddings = Tensor::cat(&[&uncond, &cond], 0)
            .and_then(|t| t.to_dtype(self.dtype))
            .map_err(PipelineError::Inference)?;

        self.sample(&text_embeddings, width, height)
            .map_err(PipelineError::Inference)
    }

    fn sample(
        &self,
        text_embeddings: &Tensor,
        width: usize,
        height: usize,
    ) -> candle_core::Result<DynamicImage> {
        if width % 8 != 0 || height % 8 != 0 {
            candle_core::bail!("image dimensions must be multiples of 8, got {width}x{height}");
        }

        let scheduler = self.sd_config.build_scheduler(NUM_INFERENCE_STEPS)?;

        // --- Start from pure noise in latent space ---
        let latents = Tensor::randn(0f32, 1f32, (1, 4, height / 8, width / 8), &self.device)?
            .to_dtype(self.dtype)?;
        let mut latents = (latents * scheduler.init_noise_sigma())?;

        // --- Denoise with classifier-free guidance ---
        for &timestep in scheduler.timesteps() {
            let input = Tensor::cat(&[&latents, &latents], 0)?;
            let input = scheduler.scale_model_input(input, timestep)?;
            let noise_pred = self.unet.forward(&input, timestep as f64, text_embeddings)?;
            let chunks = noise_pred.chunk(2, 0)?;
            let guided = (&chunks[0] + ((&chunks[1] - &chunks[0])? * GUIDANCE_SCALE)?)?;
            latents = scheduler.step(&guided, timestep, &latents)?;
        }

        // --- Decode the latent image and convert to u8 pixels ---
        let decoded = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let image = ((decoded / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let image = (image.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&image)
    }
}

fn weight_file(dir: &Path, name: &str) -> Result<PathBuf, PipelineError> {
    let path = dir.join(name);
    if path.exists() {
        Ok(path)
    } else {
        Err(PipelineError::ModelNotFound { path })
    }
}
