use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::{
    encode_png, normalize, GenerateError, GenerationRequest, ModelHandle, SamplePrompts,
};

/// Suggested download name for a generated image.
pub const IMAGE_FILE_NAME: &str = "generated_image.png";

/// A finished generation: PNG bytes plus the resolved prompt that produced
/// them, so the caller can echo exactly what was generated.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub png: Vec<u8>,
    pub prompt: String,
    pub file_name: String,
}

/// Turns raw user input into at most one in-flight generation and maps every
/// outcome to an explicit value.
///
/// The controller owns the session-level invariant: while one
/// `handle_generate` call is pending, a second call for the same controller
/// is rejected with [`GenerateError::Busy`] instead of pre-empting the first.
pub struct RequestController {
    model: Arc<ModelHandle>,
    samples: SamplePrompts,
    in_flight: Mutex<()>,
}

impl RequestController {
    pub fn new(model: Arc<ModelHandle>) -> Self {
        Self::with_samples(model, SamplePrompts::default())
    }

    pub fn with_samples(model: Arc<ModelHandle>, samples: SamplePrompts) -> Self {
        Self {
            model,
            samples,
            in_flight: Mutex::new(()),
        }
    }

    /// A random member of the sample prompt set, already resolved.
    pub fn pick_sample(&self) -> &str {
        self.samples.pick()
    }

    /// Normalizes the prompt, runs one generation, and encodes the result as
    /// PNG. Failures are classified per [`GenerateError`] and never retried.
    pub async fn handle_generate(&self, raw_prompt: &str) -> Result<GeneratedImage, GenerateError> {
        let prompt = normalize(raw_prompt);
        if prompt.is_empty() {
            return Err(GenerateError::EmptyPrompt);
        }

        let _guard = self
            .in_flight
            .try_lock()
            .map_err(|_| GenerateError::Busy)?;

        info!(prompt = %prompt, "generation started");
        let image = self
            .model
            .generate(GenerationRequest::for_prompt(prompt.clone()))
            .await?;
        let png = encode_png(&image).map_err(|e| GenerateError::Inference(format!("{e:#}")))?;
        info!(bytes = png.len(), "generation finished");

        Ok(GeneratedImage {
            png,
            prompt,
            file_name: IMAGE_FILE_NAME.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use image::{DynamicImage, RgbImage};

    use crate::{PipelineFactory, PipelineLike};

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

    struct RecordingPipeline {
        seen: std::sync::Mutex<Vec<GenerationRequest>>,
        fail_on: Option<String>,
    }

    impl RecordingPipeline {
        fn new(fail_on: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                seen: std::sync::Mutex::new(Vec::new()),
                fail_on: fail_on.map(str::to_string),
            })
        }
    }

    impl PipelineLike for RecordingPipeline {
        fn run(&self, request: &GenerationRequest) -> anyhow::Result<DynamicImage> {
            self.seen.lock().unwrap().push(request.clone());
            if self.fail_on.as_deref() == Some(request.prompt.as_str()) {
                anyhow::bail!("sampling diverged");
            }
            Ok(DynamicImage::ImageRgb8(RgbImage::new(1, 1)))
        }
    }

    fn controller_for(pipeline: Arc<dyn PipelineLike>) -> RequestController {
        let factory: PipelineFactory = Box::new(move || {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move { Ok(pipeline) })
        });
        RequestController::new(Arc::new(ModelHandle::new(factory)))
    }

    #[tokio::test]
    async fn empty_prompt_never_touches_the_model() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loads_in_factory = Arc::clone(&loads);
        let factory: PipelineFactory = Box::new(move || {
            let loads = Arc::clone(&loads_in_factory);
            Box::pin(async move {
                loads.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("must not be reached")
            })
        });
        let controller = RequestController::new(Arc::new(ModelHandle::new(factory)));

        for raw in ["", "   ", "\t\n"] {
            let err = controller.handle_generate(raw).await.unwrap_err();
            assert!(matches!(err, GenerateError::EmptyPrompt), "raw: {raw:?}");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pipeline_sees_the_resolved_prompt_with_fixed_parameters() {
        let pipeline = RecordingPipeline::new(None);
        let controller = controller_for(pipeline.clone());

        let result = controller
            .handle_generate("  a   red apple on a wooden table,   photorealistic ")
            .await
            .unwrap();

        assert_eq!(result.prompt, "a red apple on a wooden table, photorealistic");
        assert_eq!(result.file_name, IMAGE_FILE_NAME);
        assert_eq!(&result.png[..8], &PNG_MAGIC);

        let seen = pipeline.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].prompt, result.prompt);
        assert_eq!(seen[0].steps(), 50);
        assert_eq!(seen[0].guidance(), 7.5);
        assert_eq!(seen[0].height(), 512);
        assert_eq!(seen[0].width(), 512);
    }

    #[tokio::test]
    async fn inference_failure_does_not_poison_later_requests() {
        let pipeline = RecordingPipeline::new(Some("a broken prompt"));
        let controller = controller_for(pipeline.clone());

        let err = controller
            .handle_generate("a broken prompt")
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::Inference(_)));

        let ok = controller.handle_generate("a calm lake").await.unwrap();
        assert_eq!(ok.prompt, "a calm lake");
        assert_eq!(pipeline.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn load_failure_is_terminal_for_every_request() {
        let factory: PipelineFactory =
            Box::new(|| Box::pin(async { anyhow::bail!("weights missing") }));
        let controller = RequestController::new(Arc::new(ModelHandle::new(factory)));

        for _ in 0..2 {
            let err = controller.handle_generate("a red apple").await.unwrap_err();
            assert!(matches!(err, GenerateError::ModelLoad(_)));
        }
    }

    #[tokio::test]
    async fn pick_sample_returns_a_member_of_the_set() {
        let pipeline = RecordingPipeline::new(None);
        let controller = controller_for(pipeline);
        for _ in 0..50 {
            let picked = controller.pick_sample().to_string();
            assert!(SamplePrompts::default()
                .as_slice()
                .iter()
                .any(|p| p == &picked));
        }
    }

    /// Blocks inside `run` until the test releases it, so a second request
    /// can be issued while the first is provably in flight.
    struct BlockingPipeline {
        started: mpsc::Sender<()>,
        release: std::sync::Mutex<mpsc::Receiver<()>>,
    }

    impl PipelineLike for BlockingPipeline {
        fn run(&self, _request: &GenerationRequest) -> anyhow::Result<DynamicImage> {
            self.started.send(()).ok();
            self.release.lock().unwrap().recv().ok();
            Ok(DynamicImage::ImageRgb8(RgbImage::new(1, 1)))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_request_while_in_flight_is_rejected_as_busy() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let pipeline = Arc::new(BlockingPipeline {
            started: started_tx,
            release: std::sync::Mutex::new(release_rx),
        });
        let controller = Arc::new(controller_for(pipeline));

        let first = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.handle_generate("a red apple").await })
        };

        started_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("first generation never started");

        let err = controller.handle_generate("a second apple").await.unwrap_err();
        assert!(matches!(err, GenerateError::Busy));

        release_tx.send(()).unwrap();
        let result = first.await.unwrap().unwrap();
        assert_eq!(result.prompt, "a red apple");

        // The guard is released; a new request goes through again.
        release_tx.send(()).unwrap();
        controller.handle_generate("a third apple").await.unwrap();
    }
}
