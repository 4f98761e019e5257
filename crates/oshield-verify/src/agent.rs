//! Per-capture verification agent.
//!
//! One agent call resolves one capture: retrieve the legal context for the
//! detection type, run the witness (persons) or the rule table (everything
//! else), and tag the result with its detection record.

use std::sync::Arc;

use tracing::debug;

use oshield_graph::GraphClient;
use oshield_models::{BoundingBox, DetectionType, Verdict, WitnessReport};
use oshield_witness::WitnessClient;

/// One capture queued for verification.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub image_path: String,
    /// Persisted detection record id this capture belongs to
    pub detection_id: String,
    pub track_id: u64,
    pub detection_type: DetectionType,
    pub bbox: BoundingBox,
    pub frame: u64,
    pub timestamp: f64,
}

/// Evidence produced for one capture.
#[derive(Debug, Clone)]
pub enum CaptureEvidence {
    /// Objective description (person tracks)
    Witness(WitnessReport),
    /// Rule-derived verdict (all other types)
    Verdict(Verdict),
}

/// Stateless agent that verifies a single capture.
pub struct VerificationAgent {
    graph: Arc<GraphClient>,
    witness: Arc<WitnessClient>,
}

impl VerificationAgent {
    pub fn new(graph: Arc<GraphClient>, witness: Arc<WitnessClient>) -> Self {
        Self { graph, witness }
    }

    pub fn witness(&self) -> &Arc<WitnessClient> {
        &self.witness
    }

    pub fn graph(&self) -> &Arc<GraphClient> {
        &self.graph
    }

    /// Verify one capture, re-labeling ambiguous classes first.
    pub async fn verify_capture(&self, request: &VerificationRequest) -> CaptureEvidence {
        let mut detection_type = request.detection_type;
        if detection_type.is_ambiguous() {
            detection_type = self.witness.classify(&request.image_path).await;
            debug!(
                track_id = request.track_id,
                from = %request.detection_type,
                to = %detection_type,
                "Re-labeled ambiguous detection"
            );
        }

        match detection_type {
            DetectionType::Person => {
                let report = self.witness.describe(&request.image_path).await;
                CaptureEvidence::Witness(report)
            }
            other => {
                let context = self.graph.context_for(other.as_str()).await;
                let snippets: Vec<String> = context
                    .iter()
                    .map(|a| format!("**{}**\n{}", a.title, a.content))
                    .collect();
                CaptureEvidence::Verdict(self.witness.verdict(other, &snippets))
            }
        }
    }
}
