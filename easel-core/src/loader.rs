use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::PipelineLike;

/// Default pretrained weights, matching the original deployment.
pub const DEFAULT_MODEL_ID: &str = "CompVis/stable-diffusion-v1-4";

/// Fixed construction settings for a pipeline. Precision and device are not
/// configurable; inference always runs in f32 on CPU.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Hugging Face model repository holding the diffusion weights.
    pub model_id: String,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
        }
    }
}

pub trait Loader {
    type Pipeline: PipelineLike;

    fn load(api: Api, options: LoadOptions) -> impl Future<Output = Result<Self::Pipeline>>
    where
        Self: Sized;
}
