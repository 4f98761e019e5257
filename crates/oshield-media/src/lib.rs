//! Media engine: frame I/O, batched ONNX detection, Kalman tracking,
//! capture extraction and the anonymization pass.
//!
//! Everything that touches pixels or the ffmpeg CLI lives here. Detection
//! and anonymization are the two passes over the source video; both iterate
//! frames in order and yield at batch/frame boundaries so the surrounding
//! scheduler stays responsive.

pub mod anonymize;
pub mod capture;
pub mod command;
pub mod detect;
pub mod error;
pub mod finalize;
pub mod gpu;
pub mod hungarian;
pub mod probe;
pub mod reader;
pub mod tracker;

pub use anonymize::{AnonymizeAction, Anonymizer, EffectConfig, EffectKind};
pub use capture::{CaptureManager, CapturePolicy};
pub use detect::{DetectorBackend, DetectorConfig, DetectorPool, FrameDetections};
pub use error::{MediaError, MediaResult};
pub use gpu::{probe_accelerator_memory_mb, DetectorStrategy, ModelSize, StrategyMode};
pub use probe::{probe_video, validate_video, VideoInfo};
pub use reader::{Frame, FrameReader, FrameWriter};
pub use tracker::{ObjectTracker, TrackerConfig};
