//! GDPR knowledge graph client.
//!
//! Queries articles, fines and explanation graphs from Neo4j over its HTTP
//! transaction endpoint. Unavailability never fails the pipeline: every read
//! degrades to a static triage context (articles 5, 6 and 9). Results are
//! cached process-wide with a 300 s TTL because the judge asks for the same
//! detection types over and over within one video.

mod client;
mod error;
mod queries;

pub use client::{GdprArticle, GraphClient, GraphConfig, FineInfo};
pub use error::{GraphError, GraphResult};
