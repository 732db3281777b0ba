use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that escape the pipeline to the caller.
///
/// Per-attempt failures (rejected code, runtime exceptions, timeouts) are
/// recorded on the session and fed back into refinement; they never surface
/// through this type. The variants here are the genuinely unrecoverable
/// cases: the generation service is unreachable, or the crate itself broke.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("generation service unavailable: {0}")]
    GenerationUnavailable(String),

    #[error("generation response malformed: {0}")]
    MalformedGeneration(String),

    #[error("execution worker failed: {0}")]
    Worker(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
