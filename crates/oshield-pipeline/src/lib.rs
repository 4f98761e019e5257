//! Pipeline orchestrator.
//!
//! Drives a video through `detecting → verifying → waiting_for_review →
//! anonymizing → completed` with persistence at each phase boundary,
//! cooperative cancellation, a phase deadline, and crash recovery at boot.

pub mod autostart;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod recovery;
pub mod storage;

pub use autostart::subscribe_with_autostart;
pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use logging::PipelineLogger;
pub use orchestrator::PipelineOrchestrator;
pub use recovery::recover_interrupted;
pub use storage::StorageLayout;
