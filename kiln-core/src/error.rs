//! Error taxonomy for pipeline lifecycle and inference.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The configured model directory or one of its weight files is missing.
    #[error("model not found at {}", path.display())]
    ModelNotFound { path: PathBuf },

    /// Device setup or weight loading failed.
    #[error("failed to load pipeline: {0}")]
    Load(#[source] candle_core::Error),

    /// Prompt tokenization failed.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// The sampling or decoding pass failed.
    #[error("image generation failed: {0}")]
    Inference(#[source] candle_core::Error),

    /// Device memory could not be released cleanly.
    #[error("failed to release pipeline: {0}")]
    Release(#[source] candle_core::Error),
}
