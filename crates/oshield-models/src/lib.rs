//! Shared data models for the OccultaShield pipeline.
//!
//! This crate defines the types that cross crate boundaries: video lifecycle
//! state, detection geometry, persisted records, review decisions, witness
//! reports, legal verdicts and progress events. It carries no I/O.

pub mod decision;
pub mod detection;
pub mod events;
pub mod record;
pub mod verdict;
pub mod video;
pub mod witness;

pub use decision::{DecisionAction, UserDecision, UserDecisionBatch};
pub use detection::{BoundingBox, Capture, DetectionResult, DetectionType, TrackedObject};
pub use events::{ProgressEvent, ProgressSnapshot};
pub use record::{DetectionRecord, VerificationRecord};
pub use verdict::{RecommendedAction, Severity, TrackVerdict, Verdict};
pub use video::{normalize_user_id, ProcessingPhase, VideoId, VideoMetadata, VideoRecord, VideoStatus};
pub use witness::{AgeGroup, ClothingLevel, VisibleBiometrics, WitnessReport};
