//! Crash recovery sweep.
//!
//! Phase state lives only in memory, so a process restart cannot resume a
//! phase mid-flight. At boot, every video still marked with an in-flight
//! status is failed; a retry is a fresh start.

use std::sync::Arc;

use tracing::{info, warn};

use oshield_store::SurrealClient;

use crate::error::PipelineResult;

/// Mark interrupted videos as failed. Returns how many were swept.
pub async fn recover_interrupted(store: &Arc<SurrealClient>) -> PipelineResult<u32> {
    let in_flight = store.list_in_flight_videos().await?;
    let mut swept = 0u32;

    for video in in_flight {
        let video_id = video.video_id();
        match store
            .set_video_error(&video_id, "Processing interrupted by service restart")
            .await
        {
            Ok(()) => {
                swept += 1;
                info!(video_id = %video_id, was = %video.status, "Marked interrupted video as failed");
            }
            Err(e) => warn!(video_id = %video_id, "Recovery sweep failed for video: {e}"),
        }
    }

    if swept > 0 {
        info!(swept, "Crash recovery sweep complete");
    }
    Ok(swept)
}
