pub mod config;
pub mod device;
pub mod error;
pub mod pipeline;
mod util;

pub use config::PipelineConfig;
pub use device::DeviceMap;
pub use error::PipelineError;
pub use pipeline::SdPipeline;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

// Define the request type shared by the HTTP surface and the pipeline.
// Sampling parameters (steps, guidance, negative prompt) are fixed server
// side; requests only choose the prompt and output dimensions.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub width: Option<usize>,
    pub height: Option<usize>,
}

/// The lifecycle contract for a cached per-client pipeline.
///
/// `initialize` and `cleanup` are idempotent; `generate` initializes
/// implicitly when the pipeline is not yet resident and leaves the loaded
/// state untouched on failure, so the caller decides whether to discard
/// the instance.
pub trait PipelineLike: Send {
    /// Load model weights onto the device. No-op when already loaded.
    fn initialize(&mut self) -> Result<(), PipelineError>;

    /// Produce an image for `request`, loading the pipeline first if needed.
    fn generate(&mut self, request: &GenerationRequest) -> Result<DynamicImage, PipelineError>;

    /// Release all device memory. Safe to call at any point in the lifecycle.
    fn cleanup(&mut self) -> Result<(), PipelineError>;
}
