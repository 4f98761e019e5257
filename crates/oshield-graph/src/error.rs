//! Error types for the knowledge graph client.

use thiserror::Error;

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors that can occur talking to the knowledge graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Cypher statement failed: {code}: {message}")]
    Cypher { code: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Graph unavailable: {0}")]
    Unavailable(String),
}
