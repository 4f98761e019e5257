//! Pipeline error taxonomy with stable wire codes.

use thiserror::Error;

use oshield_media::MediaError;
use oshield_store::StoreError;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors surfaced by the orchestrator. Every variant maps to a stable code
/// carried on the terminal error event.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Resource failure: {0}")]
    Resource(String),

    #[error("Dependency unavailable: {0}")]
    Dependency(String),

    #[error("Phase deadline exceeded after {0} seconds")]
    Timeout(u64),

    #[error("Processing cancelled")]
    Cancelled,

    #[error("Video not found: {0}")]
    NotFound(String),

    #[error("Not authorized to access this video")]
    Forbidden,

    #[error("Anonymization failed: {0}")]
    Edition(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable code carried on the error event.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::InvalidInput(_) => "INVALID_INPUT",
            PipelineError::Resource(_) => "RESOURCE_ERROR",
            PipelineError::Dependency(_) => "DEPENDENCY_ERROR",
            PipelineError::Timeout(_) => "TIMEOUT_ERROR",
            PipelineError::Cancelled => "CANCELLED",
            PipelineError::NotFound(_) => "NOT_FOUND",
            PipelineError::Forbidden => "FORBIDDEN",
            PipelineError::Edition(_) => "EDITION_ERROR",
            PipelineError::Internal(_) => "PROCESSING_ERROR",
        }
    }

    /// Whether the client may retry without operator intervention.
    pub fn recoverable(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

impl From<MediaError> for PipelineError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::Cancelled => PipelineError::Cancelled,
            MediaError::Timeout(secs) => PipelineError::Timeout(secs),
            MediaError::InvalidVideo(msg) => PipelineError::InvalidInput(msg),
            MediaError::FileNotFound(path) => {
                PipelineError::InvalidInput(format!("file not found: {}", path.display()))
            }
            MediaError::FfmpegNotFound | MediaError::FfprobeNotFound => {
                PipelineError::Dependency(e.to_string())
            }
            MediaError::Io(_) | MediaError::ModelNotFound(_) => {
                PipelineError::Resource(e.to_string())
            }
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        // Persistence is a hard dependency of every phase.
        PipelineError::Dependency(e.to_string())
    }
}
