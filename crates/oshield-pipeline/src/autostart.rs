//! Auto-start on subscribe.
//!
//! Subscribing to a video's progress is a *write*: when the persisted status
//! is still `pending`, the subscriber atomically claims the video and
//! launches phase-1. Concurrent subscribers race on a compare-and-set over
//! the status, so exactly one launcher wins and the rest attach to the
//! already-running job.

use std::sync::Arc;

use tracing::info;

use oshield_models::{normalize_user_id, VideoId, VideoStatus};
use oshield_progress::Subscription;
use oshield_store::AuthenticatedUser;

use crate::error::{PipelineError, PipelineResult};
use crate::orchestrator::PipelineOrchestrator;

/// Subscribe to a video's progress stream, auto-starting phase-1 for
/// pending videos. Verifies ownership against the normalized user id.
pub async fn subscribe_with_autostart(
    orchestrator: Arc<PipelineOrchestrator>,
    video_id: &VideoId,
    user: &AuthenticatedUser,
) -> PipelineResult<Subscription> {
    let video = orchestrator
        .store()
        .get_video(video_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(video_id.to_string()))?;

    if normalize_user_id(&video.user_id) != normalize_user_id(&user.id) {
        return Err(PipelineError::Forbidden);
    }

    // Seed broker state from the persisted status for late subscribers.
    let broker = orchestrator.broker();
    if broker.get_state(video_id.as_str()).await.is_none() {
        broker.register(video_id.as_str()).await;
        broker
            .seed_phase(
                video_id.as_str(),
                video.status.initial_phase(),
                &format!("Video status: {}", video.status),
            )
            .await;
    }

    if video.status == VideoStatus::Pending {
        // Compare-and-set so only one subscriber launches the pipeline.
        if orchestrator.store().try_claim_pending(video_id).await? {
            info!(video_id = %video_id, "Auto-starting pipeline on first subscribe");
            let input_path = video.original_path.clone();
            let orchestrator = Arc::clone(&orchestrator);
            let video_id = video_id.clone();
            tokio::spawn(async move {
                orchestrator.start_pipeline(video_id, input_path, None).await;
            });
        }
    }

    Ok(broker.subscribe(video_id.as_str()).await)
}
