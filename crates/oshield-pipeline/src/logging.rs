//! Structured per-run logging.

use tracing::{error, info, warn, Span};

/// Logger for one pipeline run, carrying the video id and phase on every
/// line.
#[derive(Debug, Clone)]
pub struct PipelineLogger {
    video_id: String,
    operation: String,
}

impl PipelineLogger {
    /// Create a logger for one video and operation (e.g. "phase1",
    /// "anonymization").
    pub fn new(video_id: &str, operation: &str) -> Self {
        Self {
            video_id: video_id.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            video_id = %self.video_id,
            operation = %self.operation,
            "Pipeline started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            video_id = %self.video_id,
            operation = %self.operation,
            "Pipeline progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            video_id = %self.video_id,
            operation = %self.operation,
            "Pipeline warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            video_id = %self.video_id,
            operation = %self.operation,
            "Pipeline error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            video_id = %self.video_id,
            operation = %self.operation,
            "Pipeline completed: {}", message
        );
    }

    /// Span carrying the run context for nested work.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "pipeline",
            video_id = %self.video_id,
            operation = %self.operation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_creation() {
        let logger = PipelineLogger::new("vid_abc", "phase1");
        logger.log_start("detection");
        logger.log_completion("done");
    }
}
