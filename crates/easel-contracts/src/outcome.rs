use std::fmt;
use std::path::PathBuf;

/// Where a produced image lives: a remote URL or a file written locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Url(String),
    File(PathBuf),
}

impl ImageRef {
    pub fn describe(&self) -> String {
        match self {
            ImageRef::Url(url) => url.clone(),
            ImageRef::File(path) => path.display().to_string(),
        }
    }
}

/// Successful generation outcome, tagged with the engine that actually
/// produced the image (the fallback engine when fallback occurred).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub engine: String,
    pub image: ImageRef,
}

/// Everything that can go wrong between a chat prompt and an image.
/// Engines and the orchestrator never let any other error type cross
/// the boundary to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationFailure {
    InvalidPrompt,
    NoPriorPrompt,
    Submission(String),
    PollTimeout { budget_secs: u64 },
    Generation(String),
}

impl GenerationFailure {
    /// Stable identifier used in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationFailure::InvalidPrompt => "invalid_prompt",
            GenerationFailure::NoPriorPrompt => "no_prior_prompt",
            GenerationFailure::Submission(_) => "submission_error",
            GenerationFailure::PollTimeout { .. } => "poll_timeout",
            GenerationFailure::Generation(_) => "generation_error",
        }
    }

    /// Short, non-technical line shown to the chat user.
    pub fn user_message(&self) -> &'static str {
        match self {
            GenerationFailure::InvalidPrompt => "That prompt is too short. Use at least 5 characters.",
            GenerationFailure::NoPriorPrompt => "There is no previous prompt yet. Send one first.",
            GenerationFailure::Submission(_) => "The image service rejected the request. Try again in a moment.",
            GenerationFailure::PollTimeout { .. } => "The image was not ready in time. Try again in a moment.",
            GenerationFailure::Generation(_) => "The image could not be generated. Try again in a moment.",
        }
    }
}

impl fmt::Display for GenerationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationFailure::InvalidPrompt => write!(f, "prompt too short"),
            GenerationFailure::NoPriorPrompt => write!(f, "no prior prompt"),
            GenerationFailure::Submission(detail) => write!(f, "submission rejected: {detail}"),
            GenerationFailure::PollTimeout { budget_secs } => {
                write!(f, "job not done after {budget_secs}s")
            }
            GenerationFailure::Generation(detail) => write!(f, "generation failed: {detail}"),
        }
    }
}

impl std::error::Error for GenerationFailure {}
