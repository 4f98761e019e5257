//! Error types for the vision-LLM client.

use thiserror::Error;

/// Result type for witness operations.
pub type WitnessResult<T> = Result<T, WitnessError>;

/// Errors that can occur talking to the vision backend.
#[derive(Debug, Error)]
pub enum WitnessError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not parse model output: {0}")]
    InvalidResponse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
