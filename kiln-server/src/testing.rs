//! Shared test doubles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::DynamicImage;
use kiln_core::{GenerationRequest, PipelineError, PipelineLike};

/// Lifecycle call counters shared between a fake pipeline and the test
/// body.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub initialize: AtomicUsize,
    pub generate: AtomicUsize,
    pub cleanup: AtomicUsize,
}

impl Counters {
    pub fn initialize_calls(&self) -> usize {
        self.initialize.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate.load(Ordering::SeqCst)
    }

    pub fn cleanup_calls(&self) -> usize {
        self.cleanup.load(Ordering::SeqCst)
    }
}

/// A pipeline that follows the real lifecycle contract without touching
/// any device: initialize is idempotent, generate initializes implicitly,
/// cleanup releases.
pub(crate) struct FakePipeline {
    counters: Arc<Counters>,
    ready: bool,
    fail_generate: bool,
    fail_cleanup: bool,
}

impl FakePipeline {
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            counters,
            ready: false,
            fail_generate: false,
            fail_cleanup: false,
        }
    }

    pub fn failing(counters: Arc<Counters>) -> Self {
        Self {
            fail_generate: true,
            ..Self::new(counters)
        }
    }

    pub fn failing_cleanup(counters: Arc<Counters>) -> Self {
        Self {
            fail_cleanup: true,
            ..Self::new(counters)
        }
    }
}

impl PipelineLike for FakePipeline {
    fn initialize(&mut self) -> Result<(), PipelineError> {
        if self.ready {
            return Ok(());
        }
        self.counters.initialize.fetch_add(1, Ordering::SeqCst);
        self.ready = true;
        Ok(())
    }

    fn generate(&mut self, _request: &GenerationRequest) -> Result<DynamicImage, PipelineError> {
        self.initialize()?;
        self.counters.generate.fetch_add(1, Ordering::SeqCst);
        if self.fail_generate {
            return Err(PipelineError::Tokenizer("synthetic failure".to_string()));
        }
        Ok(DynamicImage::new_rgb8(8, 8))
    }

    fn cleanup(&mut self) -> Result<(), PipelineError> {
        self.ready = false;
        self.counters.cleanup.fetch_add(1, Ordering::SeqCst);
        if self.fail_cleanup {
            return Err(PipelineError::Tokenizer(
                "synthetic cleanup failure".to_string(),
            ));
        }
        Ok(())
    }
}
