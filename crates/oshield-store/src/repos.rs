//! Typed record operations used by the pipeline.

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, warn};

use oshield_models::{
    DetectionRecord, VerificationRecord, VideoId, VideoRecord, VideoStatus,
};

use crate::client::SurrealClient;
use crate::error::{StoreError, StoreResult};

impl SurrealClient {
    /// Fetch a video record.
    pub async fn get_video(&self, video_id: &VideoId) -> StoreResult<Option<VideoRecord>> {
        let row = self.select(&video_id.record_id()).await?;
        match row {
            Some(value) => Ok(Some(parse_video(value)?)),
            None => Ok(None),
        }
    }

    /// Set a video's status, stamping `updated_at`.
    pub async fn set_video_status(
        &self,
        video_id: &VideoId,
        status: VideoStatus,
    ) -> StoreResult<()> {
        self.merge(
            &video_id.record_id(),
            &json!({ "status": status, "updated_at": Utc::now() }),
        )
        .await?;
        Ok(())
    }

    /// Atomically claim a pending video for processing. Only one caller wins;
    /// the rest observe the already-running job.
    pub async fn try_claim_pending(&self, video_id: &VideoId) -> StoreResult<bool> {
        let sql = format!(
            "UPDATE {} SET status = 'processing', updated_at = time::now() \
             WHERE status = 'pending' RETURN AFTER;",
            crate::client::quote_record_id(&video_id.record_id())
        );
        let rows = self.query(&sql, &[]).await?;
        Ok(!rows.is_empty())
    }

    /// Mark a video failed with an error message.
    pub async fn set_video_error(&self, video_id: &VideoId, message: &str) -> StoreResult<()> {
        self.merge(
            &video_id.record_id(),
            &json!({
                "status": VideoStatus::Error,
                "error_message": message,
                "updated_at": Utc::now(),
            }),
        )
        .await?;
        Ok(())
    }

    /// Mark a video completed with its processed output path.
    pub async fn set_video_completed(
        &self,
        video_id: &VideoId,
        processed_path: &str,
    ) -> StoreResult<()> {
        self.merge(
            &video_id.record_id(),
            &json!({
                "status": VideoStatus::Completed,
                "processed_path": processed_path,
                "completed_at": Utc::now(),
                "updated_at": Utc::now(),
            }),
        )
        .await?;
        Ok(())
    }

    /// Persist one batch of detection records after detection completes.
    ///
    /// A single bad record is logged and skipped; losing every record aborts
    /// the phase. Returns `track_id -> detection record id`.
    pub async fn save_detections(
        &self,
        records: &[DetectionRecord],
    ) -> StoreResult<Vec<(u64, String)>> {
        let mut saved = Vec::with_capacity(records.len());
        let mut failures = 0usize;

        for record in records {
            let value = serde_json::to_value(record)?;
            match self.create("detection", &value).await {
                Ok(created) => {
                    let record_id = created
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("detection:fallback_{}", record.track_id));
                    saved.push((record.track_id, record_id));
                }
                Err(e) => {
                    failures += 1;
                    error!(track_id = record.track_id, "Failed to save detection: {e}");
                }
            }
        }

        if !records.is_empty() && saved.is_empty() {
            return Err(StoreError::query_failed(format!(
                "all {failures} detection writes failed"
            )));
        }
        if failures > 0 {
            warn!(failures, "Some detection records were not persisted");
        }
        Ok(saved)
    }

    /// Persist one verification record.
    pub async fn save_verification(&self, record: &VerificationRecord) -> StoreResult<String> {
        let value = serde_json::to_value(record)?;
        let created = self.create("gdpr_verification", &value).await?;
        Ok(created
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default())
    }

    /// Fetch a verification record by id, accepting ids with or without the
    /// table prefix.
    pub async fn get_verification(
        &self,
        verification_id: &str,
    ) -> StoreResult<Option<VerificationRecord>> {
        let record_id = if verification_id.starts_with("gdpr_verification:") {
            verification_id.to_string()
        } else {
            format!("gdpr_verification:{verification_id}")
        };
        let row = self.select(&record_id).await?;
        match row {
            Some(value) => Ok(Some(serde_json::from_value(normalize_ids(value))?)),
            None => Ok(None),
        }
    }

    /// Fetch a detection record by id.
    pub async fn get_detection(&self, detection_id: &str) -> StoreResult<Option<DetectionRecord>> {
        let record_id = if detection_id.starts_with("detection:") {
            detection_id.to_string()
        } else {
            format!("detection:{detection_id}")
        };
        let row = self.select(&record_id).await?;
        match row {
            Some(value) => Ok(Some(serde_json::from_value(normalize_ids(value))?)),
            None => Ok(None),
        }
    }

    /// Videos left in an in-flight status by a previous process.
    pub async fn list_in_flight_videos(&self) -> StoreResult<Vec<VideoRecord>> {
        let rows = self
            .query(
                "SELECT * FROM video WHERE status IN ['processing', 'detected', 'editing'];",
                &[],
            )
            .await?;
        rows.into_iter().map(parse_video).collect()
    }
}

/// Record links come back as structured ids; flatten them to `table:id`
/// strings so the typed models deserialize.
fn normalize_ids(mut value: Value) -> Value {
    if let Some(obj) = value.as_object_mut() {
        for key in ["id", "video_id", "detection_id", "detection"] {
            if let Some(field) = obj.get_mut(key) {
                if let Some(link) = record_link_to_string(field) {
                    *field = Value::String(link);
                }
            }
        }
    }
    value
}

fn record_link_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Object(obj) => {
            let table = obj.get("tb").and_then(Value::as_str)?;
            let id = obj.get("id")?;
            let id = match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some(format!("{table}:{id}"))
        }
        _ => None,
    }
}

fn parse_video(value: Value) -> StoreResult<VideoRecord> {
    Ok(serde_json::from_value(normalize_ids(value))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_link_flattening() {
        let value = json!({
            "id": {"tb": "detection", "id": "abc123"},
            "video_id": {"tb": "video", "id": "vid_x"},
            "track_id": 3,
        });
        let normalized = normalize_ids(value);
        assert_eq!(normalized["id"], "detection:abc123");
        assert_eq!(normalized["video_id"], "video:vid_x");
        assert_eq!(normalized["track_id"], 3);
    }

    #[test]
    fn test_plain_string_ids_untouched() {
        let value = json!({ "id": "video:vid_x", "status": "pending" });
        let normalized = normalize_ids(value);
        assert_eq!(normalized["id"], "video:vid_x");
    }
}
