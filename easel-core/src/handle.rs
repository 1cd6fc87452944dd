use std::{future::Future, pin::Pin, sync::Arc};

use image::DynamicImage;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::{GenerateError, GenerationRequest, PipelineLike};

/// Future produced by a [`PipelineFactory`].
pub type PipelineFuture =
    Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn PipelineLike>>> + Send>>;

/// Deferred pipeline construction. A [`ModelHandle`] invokes its factory at
/// most once, no matter how many requests race on first access.
pub type PipelineFactory = Box<dyn Fn() -> PipelineFuture + Send + Sync>;

/// Process-wide owner of the lazily constructed pipeline.
///
/// Construction is single-flight and its outcome is cached for the life of
/// the handle: a successful load is reused by every later request, and a
/// failed load keeps failing with `ModelLoad` without being re-attempted.
pub struct ModelHandle {
    factory: PipelineFactory,
    loaded: OnceCell<Result<Arc<dyn PipelineLike>, String>>,
}

impl ModelHandle {
    pub fn new(factory: PipelineFactory) -> Self {
        Self {
            factory,
            loaded: OnceCell::new(),
        }
    }

    /// Returns the cached pipeline, constructing it on first call.
    pub async fn ensure_loaded(&self) -> Result<Arc<dyn PipelineLike>, GenerateError> {
        let outcome = self
            .loaded
            .get_or_init(|| async {
                info!("loading generation pipeline, this can take minutes on first use");
                match (self.factory)().await {
                    Ok(pipeline) => {
                        info!("pipeline loaded");
                        Ok(pipeline)
                    }
                    Err(e) => {
                        error!("pipeline construction failed: {e:#}");
                        Err(format!("{e:#}"))
                    }
                }
            })
            .await;
        match outcome {
            Ok(pipeline) => Ok(Arc::clone(pipeline)),
            Err(cause) => Err(GenerateError::ModelLoad(cause.clone())),
        }
    }

    /// Runs one inference on a blocking worker thread. The pipeline call is
    /// CPU-bound and holds the thread for its full duration.
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<DynamicImage, GenerateError> {
        let pipeline = self.ensure_loaded().await?;
        tokio::task::spawn_blocking(move || pipeline.run(&request))
            .await
            .map_err(|e| GenerateError::Inference(e.to_string()))?
            .map_err(|e| GenerateError::Inference(format!("{e:#}")))
    }
}
