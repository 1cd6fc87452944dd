pub mod prompt;

mod controller;
mod error;
mod handle;
mod loader;
mod sd;
mod util;

pub use controller::{GeneratedImage, RequestController, IMAGE_FILE_NAME};
pub use error::GenerateError;
pub use handle::{ModelHandle, PipelineFactory, PipelineFuture};
use image::DynamicImage;
pub use loader::{LoadOptions, Loader, DEFAULT_MODEL_ID};
pub use prompt::{normalize, SamplePrompts, MAX_PROMPT_CHARS};
pub use sd::{SdLoader, SdPipeline};
use serde::{Deserialize, Serialize};
pub(crate) use util::*;

/// Fixed sampling parameters, applied whenever a request leaves them unset.
pub const DEFAULT_STEPS: usize = 50;
pub const DEFAULT_GUIDANCE: f64 = 7.5;
pub const DEFAULT_HEIGHT: usize = 512;
pub const DEFAULT_WIDTH: usize = 512;

/// One generation request as handed to the pipeline. Built from a resolved
/// prompt; immutable once constructed.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, PartialOrd)]
pub struct GenerationRequest {
    pub prompt: String,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    /// Request with the fixed default parameters for the given resolved prompt.
    pub fn for_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            width: None,
            height: None,
            steps: None,
            guidance: None,
            seed: None,
        }
    }

    pub fn width(&self) -> usize {
        self.width.unwrap_or(DEFAULT_WIDTH)
    }

    pub fn height(&self) -> usize {
        self.height.unwrap_or(DEFAULT_HEIGHT)
    }

    pub fn steps(&self) -> usize {
        self.steps.unwrap_or(DEFAULT_STEPS)
    }

    pub fn guidance(&self) -> f64 {
        self.guidance.unwrap_or(DEFAULT_GUIDANCE)
    }
}

/// A loaded generation pipeline. `run` blocks the calling thread for the
/// full duration of inference (minutes on CPU).
///
/// Implementations must be safe to share between threads for sequential
/// reuse; concurrent `run` calls are not part of the contract and callers
/// are expected to serialize them.
pub trait PipelineLike: Send + Sync {
    fn run(&self, request: &GenerationRequest) -> anyhow::Result<DynamicImage>;
}
