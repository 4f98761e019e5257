//! Typed progress events for the live event stream.
//!
//! Event names match what the SSE surface puts on the wire: `initial_state`,
//! `phase_change`, `progress`, `detection`, `verification`, `complete`,
//! `error`, `heartbeat`. `complete` and `error` are terminal.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::video::ProcessingPhase;

/// Snapshot of a video's in-memory progress state, sent as `initial_state`
/// when a subscriber attaches.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct ProgressSnapshot {
    pub video_id: String,
    pub phase: ProcessingPhase,
    pub progress: u8,
    pub current: u64,
    pub total: u64,
    pub message: String,
    /// Cumulative detection counts by type
    #[serde(default)]
    pub detections: HashMap<String, u64>,
    pub elapsed_seconds: f64,
}

/// One event on a subscriber's queue.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ProgressEvent {
    InitialState {
        state: ProgressSnapshot,
    },
    PhaseChange {
        phase: ProcessingPhase,
        previous_phase: ProcessingPhase,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        estimated_time_seconds: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    Progress {
        phase: ProcessingPhase,
        progress: u8,
        current: u64,
        total: u64,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Detection {
        detection_type: String,
        count: u64,
        frame_number: u64,
        confidence: f64,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Verification {
        vulnerability_id: String,
        status: String,
        agents_completed: u64,
        total_agents: u64,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Complete {
        video_id: String,
        total_vulnerabilities: u64,
        total_violations: u64,
        processing_time_seconds: f64,
        redirect_url: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        recoverable: bool,
        timestamp: DateTime<Utc>,
    },
    Heartbeat,
}

impl ProgressEvent {
    /// Wire name of this event on the SSE stream.
    pub fn event_name(&self) -> &'static str {
        match self {
            ProgressEvent::InitialState { .. } => "initial_state",
            ProgressEvent::PhaseChange { .. } => "phase_change",
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Detection { .. } => "detection",
            ProgressEvent::Verification { .. } => "verification",
            ProgressEvent::Complete { .. } => "complete",
            ProgressEvent::Error { .. } => "error",
            ProgressEvent::Heartbeat => "heartbeat",
        }
    }

    /// Whether the consumer should close its connection after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Complete { .. } | ProgressEvent::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let event = ProgressEvent::Heartbeat;
        assert_eq!(event.event_name(), "heartbeat");

        let event = ProgressEvent::Error {
            code: "TIMEOUT_ERROR".to_string(),
            message: "deadline exceeded".to_string(),
            details: None,
            recoverable: false,
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_name(), "error");
    }

    #[test]
    fn test_terminal_events() {
        let complete = ProgressEvent::Complete {
            video_id: "vid_abc".to_string(),
            total_vulnerabilities: 2,
            total_violations: 1,
            processing_time_seconds: 12.5,
            redirect_url: "/download/vid_abc".to_string(),
            message: "done".to_string(),
            timestamp: Utc::now(),
        };
        assert!(complete.is_terminal());
        assert!(!ProgressEvent::Heartbeat.is_terminal());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = ProgressEvent::Progress {
            phase: ProcessingPhase::Detecting,
            progress: 40,
            current: 120,
            total: 300,
            message: "detecting".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event_type":"progress""#));
        assert!(json.contains(r#""phase":"detecting""#));
    }
}
