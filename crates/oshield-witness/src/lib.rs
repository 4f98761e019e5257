//! Vision-LLM client.
//!
//! Two modes, selected by detection type. For `person` the model acts as a
//! *witness*: it returns an objective visual description and never a legal
//! conclusion. For every other type the verdict is derived from a fixed rule
//! table, so it is deterministic and auditable without a model. When the
//! vision backend is down both modes degrade to mock responses; the pipeline
//! never blocks on LLM availability.

mod client;
mod error;
mod rules;

pub use client::{WitnessClient, WitnessConfig};
pub use error::{WitnessError, WitnessResult};
pub use rules::rule_verdict;
