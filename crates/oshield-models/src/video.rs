//! Video lifecycle models.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an uploaded video.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct VideoId(pub String);

impl VideoId {
    /// Generate a new random video ID.
    pub fn new() -> Self {
        Self(format!("vid_{}", &Uuid::new_v4().simple().to_string()[..12]))
    }

    /// Create from an existing string, stripping any `video:` table prefix.
    pub fn from_string(s: impl Into<String>) -> Self {
        let s = s.into();
        match s.strip_prefix("video:") {
            Some(bare) => Self(bare.to_string()),
            None => Self(s),
        }
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Record id in `video:<id>` form for the persistence store.
    pub fn record_id(&self) -> String {
        format!("video:{}", self.0)
    }
}

impl Default for VideoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for VideoId {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

impl From<&str> for VideoId {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

/// Persisted video lifecycle status.
///
/// Advances monotonically except for `Error`, which is terminal until the
/// video is retried or deleted. `Editing` is the DB name for the phase the
/// event stream calls `anonymizing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    /// Uploaded, waiting for processing to start
    #[default]
    Pending,
    /// Detection phase running
    Processing,
    /// Detection finished, verification not yet started
    Detected,
    /// Verification finished, waiting for human review
    Verified,
    /// Anonymization pass running
    Editing,
    /// Final video rendered
    Completed,
    /// Processing failed
    Error,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Pending => "pending",
            VideoStatus::Processing => "processing",
            VideoStatus::Detected => "detected",
            VideoStatus::Verified => "verified",
            VideoStatus::Editing => "editing",
            VideoStatus::Completed => "completed",
            VideoStatus::Error => "error",
        }
    }

    /// Statuses that indicate a phase was in flight; a process restart can
    /// never resume these mid-phase, so recovery marks them `Error`.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            VideoStatus::Processing | VideoStatus::Detected | VideoStatus::Editing
        )
    }

    /// Initial event-stream phase shown to a subscriber for this status.
    pub fn initial_phase(&self) -> ProcessingPhase {
        match self {
            VideoStatus::Pending => ProcessingPhase::Idle,
            VideoStatus::Processing => ProcessingPhase::Detecting,
            VideoStatus::Detected => ProcessingPhase::Verifying,
            VideoStatus::Verified => ProcessingPhase::WaitingForReview,
            VideoStatus::Editing => ProcessingPhase::Anonymizing,
            VideoStatus::Completed => ProcessingPhase::Completed,
            VideoStatus::Error => ProcessingPhase::Error,
        }
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Processing phase as reported on the live event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPhase {
    #[default]
    Idle,
    Uploading,
    Detecting,
    Verifying,
    WaitingForReview,
    Anonymizing,
    Completed,
    Error,
}

impl ProcessingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingPhase::Idle => "idle",
            ProcessingPhase::Uploading => "uploading",
            ProcessingPhase::Detecting => "detecting",
            ProcessingPhase::Verifying => "verifying",
            ProcessingPhase::WaitingForReview => "waiting_for_review",
            ProcessingPhase::Anonymizing => "anonymizing",
            ProcessingPhase::Completed => "completed",
            ProcessingPhase::Error => "error",
        }
    }

    /// Whether this phase ends the event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingPhase::Completed | ProcessingPhase::Error)
    }
}

impl fmt::Display for ProcessingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable source metadata probed at upload time.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VideoMetadata {
    pub duration_seconds: f64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub total_frames: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(default)]
    pub has_audio: bool,
}

/// Video record as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VideoRecord {
    pub id: String,
    pub user_id: String,
    pub filename: String,
    pub original_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_path: Option<String>,
    #[serde(default)]
    pub status: VideoStatus,
    pub metadata: VideoMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl VideoRecord {
    pub fn new(
        video_id: &VideoId,
        user_id: impl Into<String>,
        filename: impl Into<String>,
        original_path: impl Into<String>,
        metadata: VideoMetadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: video_id.record_id(),
            user_id: user_id.into(),
            filename: filename.into(),
            original_path: original_path.into(),
            processed_path: None,
            status: VideoStatus::Pending,
            metadata,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Video id without the table prefix.
    pub fn video_id(&self) -> VideoId {
        VideoId::from_string(self.id.clone())
    }
}

/// Normalize a user id for ownership comparison.
///
/// Record links come back from the store with typographic brackets around the
/// id part (`user:⟨abc⟩`); bare ids come in without the table prefix.
pub fn normalize_user_id(raw: &str) -> String {
    let stripped: String = raw.chars().filter(|c| *c != '⟨' && *c != '⟩').collect();
    if stripped.starts_with("user:") {
        stripped
    } else {
        format!("user:{stripped}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_id_generation() {
        let id1 = VideoId::new();
        let id2 = VideoId::new();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("vid_"));
    }

    #[test]
    fn test_video_id_strips_table_prefix() {
        let id = VideoId::from_string("video:vid_abc123");
        assert_eq!(id.as_str(), "vid_abc123");
        assert_eq!(id.record_id(), "video:vid_abc123");
    }

    #[test]
    fn test_status_phase_mapping() {
        assert_eq!(VideoStatus::Pending.initial_phase(), ProcessingPhase::Idle);
        assert_eq!(
            VideoStatus::Verified.initial_phase(),
            ProcessingPhase::WaitingForReview
        );
        assert_eq!(
            VideoStatus::Editing.initial_phase(),
            ProcessingPhase::Anonymizing
        );
    }

    #[test]
    fn test_in_flight_statuses() {
        assert!(VideoStatus::Processing.is_in_flight());
        assert!(VideoStatus::Editing.is_in_flight());
        assert!(!VideoStatus::Pending.is_in_flight());
        assert!(!VideoStatus::Completed.is_in_flight());
    }

    #[test]
    fn test_terminal_phases() {
        assert!(ProcessingPhase::Completed.is_terminal());
        assert!(ProcessingPhase::Error.is_terminal());
        assert!(!ProcessingPhase::WaitingForReview.is_terminal());
    }

    #[test]
    fn test_normalize_user_id() {
        assert_eq!(normalize_user_id("user:⟨abc⟩"), "user:abc");
        assert_eq!(normalize_user_id("abc"), "user:abc");
        assert_eq!(normalize_user_id("user:abc"), "user:abc");
    }
}
