//! Pipeline configuration and the fixed sampling profile.

use std::path::PathBuf;

use crate::device::DeviceMap;

/// Denoising steps per image.
pub const NUM_INFERENCE_STEPS: usize = 5;

/// Classifier-free guidance strength.
pub const GUIDANCE_SCALE: f64 = 2.0;

/// Applied to every generation; requests cannot override it.
pub const NEGATIVE_PROMPT: &str =
    "text, watermark, logo, title, signature, blurry, low quality, distorted";

/// Output dimensions when a request leaves them unset.
pub const DEFAULT_WIDTH: usize = 768;
pub const DEFAULT_HEIGHT: usize = 768;

/// Everything a pipeline needs to find and place its weights. Cheap to
/// clone and does no I/O; the paths are only resolved at initialization.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub models_dir: PathBuf,
    pub model: String,
    pub device: DeviceMap,
}

impl PipelineConfig {
    pub fn new(
        models_dir: impl Into<PathBuf>,
        model: impl Into<String>,
        device: DeviceMap,
    ) -> Self {
        Self {
            models_dir: models_dir.into(),
            model: model.into(),
            device,
        }
    }

    /// Directory holding this model's tokenizer and weight files.
    pub fn model_dir(&self) -> PathBuf {
        self.models_dir.join(&self.model)
    }
}
