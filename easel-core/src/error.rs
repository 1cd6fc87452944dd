use thiserror::Error;

/// Classified failure surfaced to the presentation layer. Nothing is retried
/// internally; the caller decides whether the user may try again.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// The prompt normalized to nothing.
    #[error("enter a description before generating")]
    EmptyPrompt,

    /// A generation for this session is already in flight.
    #[error("a generation is already in progress")]
    Busy,

    /// Pipeline construction failed. Terminal for the process: every later
    /// request fails the same way until restart.
    #[error("the model failed to load: {0}")]
    ModelLoad(String),

    /// A single generation attempt failed.
    #[error("image generation failed: {0}")]
    Inference(String),
}

impl GenerateError {
    /// Stable tag for wire payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyPrompt => "empty_prompt",
            Self::Busy => "busy",
            Self::ModelLoad(_) => "model_load",
            Self::Inference(_) => "inference",
        }
    }

    /// Actionable guidance shown next to the error message.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::EmptyPrompt => "Type a prompt or pick a sample one.",
            Self::Busy => "Wait for the current image to finish.",
            Self::ModelLoad(_) => "The model cannot be loaded in this process; restart the server.",
            Self::Inference(_) => "Try again with a different or simpler prompt.",
        }
    }

    /// True when no retry can succeed without a process restart.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ModelLoad(_))
    }
}
