//! Persisted projections of tracks and verdicts.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::detection::{BoundingBox, Capture, DetectionType, TrackedObject};
use crate::verdict::{RecommendedAction, Severity, TrackVerdict};

/// Detection record as persisted in the store. Carries the full box history
/// and captures inline so the anonymizer can reconstruct geometry without
/// re-running detection.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DetectionRecord {
    /// Record id (`detection:<id>`), set by the store on create.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Strong back-reference to the parent video (`video:<id>`).
    pub video_id: String,
    pub track_id: u64,
    pub detection_type: DetectionType,
    pub first_frame: u64,
    pub last_frame: u64,
    pub avg_confidence: f64,
    pub max_confidence: f64,
    pub duration_seconds: f64,
    /// Captures directory for this track.
    #[serde(default)]
    pub storage_path: String,
    #[serde(default)]
    pub bbox_history: Vec<BoundingBox>,
    #[serde(default)]
    pub captures: Vec<Capture>,
}

impl DetectionRecord {
    /// Project a finished track into its persisted form.
    pub fn from_track(track: &TrackedObject, video_record_id: &str, fps: f64) -> Self {
        Self {
            id: None,
            video_id: video_record_id.to_string(),
            track_id: track.track_id,
            detection_type: track.detection_type,
            first_frame: track.first_frame(),
            last_frame: track.last_frame(),
            avg_confidence: track.avg_confidence(),
            max_confidence: track.max_confidence(),
            duration_seconds: track.duration_seconds(fps),
            storage_path: track
                .captures
                .first()
                .and_then(|c| {
                    std::path::Path::new(&c.image_path)
                        .parent()
                        .map(|p| p.to_string_lossy().into_owned())
                })
                .unwrap_or_default(),
            bbox_history: track.bbox_history.clone(),
            captures: track.captures.clone(),
        }
    }
}

/// Verification record: the judge's per-track verdict as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VerificationRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Strong back-reference to the detection record. Legacy schemas used the
    /// wire name `detection`; we write `detection_id` and accept both.
    #[serde(alias = "detection")]
    pub detection_id: String,
    #[serde(default)]
    pub capture_index: u32,
    pub is_violation: bool,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub violated_articles: Vec<String>,
    #[serde(default)]
    pub detected_personal_data: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub processing_time_ms: u64,
    #[serde(default)]
    pub llm_model: String,
    #[serde(default)]
    pub recommended_action: RecommendedAction,
    #[serde(default)]
    pub llm_raw_response: String,
}

impl VerificationRecord {
    /// Build from a judge verdict linked to its detection record.
    pub fn from_verdict(
        detection_id: &str,
        verdict: &TrackVerdict,
        llm_model: impl Into<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            id: None,
            detection_id: detection_id.to_string(),
            capture_index: 0,
            is_violation: verdict.is_violation,
            severity: verdict.severity,
            description: verdict.reasoning.clone(),
            violated_articles: verdict.violated_articles.clone(),
            detected_personal_data: Vec::new(),
            confidence: verdict.confidence,
            processing_time_ms,
            llm_model: llm_model.into(),
            recommended_action: verdict.recommended_action,
            llm_raw_response: serde_json::to_string(verdict).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_record_from_track() {
        let mut track = TrackedObject::new(7, DetectionType::Face);
        track.add_bbox(BoundingBox::new(0.0, 0.0, 30.0, 30.0, 0.6, 30));
        track.add_bbox(BoundingBox::new(0.0, 0.0, 30.0, 30.0, 0.9, 90));

        let record = DetectionRecord::from_track(&track, "video:vid_abc", 30.0);
        assert_eq!(record.video_id, "video:vid_abc");
        assert_eq!(record.track_id, 7);
        assert_eq!(record.first_frame, 30);
        assert_eq!(record.last_frame, 90);
        assert!((record.duration_seconds - 2.0).abs() < 1e-9);
        assert!((record.max_confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_verification_accepts_legacy_wire_name() {
        let json = r#"{"detection": "detection:abc", "is_violation": true}"#;
        let record: VerificationRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.detection_id, "detection:abc");

        let json = r#"{"detection_id": "detection:def", "is_violation": false}"#;
        let record: VerificationRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.detection_id, "detection:def");
    }

    #[test]
    fn test_verification_from_verdict() {
        let verdict = TrackVerdict {
            is_violation: true,
            severity: Severity::High,
            violated_articles: vec!["6".to_string(), "9".to_string()],
            reasoning: "identifiable face".to_string(),
            recommended_action: RecommendedAction::Blur,
            confidence: 0.95,
            max_confidence: 0.97,
            vulnerability_type: None,
        };
        let record =
            VerificationRecord::from_verdict("detection:abc", &verdict, "gemma-3-4b", 120);
        assert!(record.is_violation);
        assert_eq!(record.severity, Severity::High);
        assert_eq!(record.llm_model, "gemma-3-4b");
        assert!(!record.llm_raw_response.is_empty());
    }
}
