//! Pipeline orchestrator: phase-1 (detect + verify) and phase-2 (anonymize).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

use oshield_graph::GraphClient;
use oshield_media::anonymize::{AnonymizeAction, Anonymizer, EffectConfig, EffectKind};
use oshield_media::capture::{CaptureManager, CapturePolicy};
use oshield_media::{
    probe_video, validate_video, DetectorConfig, DetectorPool, FrameReader, ObjectTracker,
    TrackerConfig, VideoInfo,
};
use oshield_models::{
    Capture, DecisionAction, DetectionRecord, DetectionResult, ProcessingPhase, TrackedObject,
    UserDecision, VerificationRecord, VideoId, VideoStatus,
};
use oshield_progress::ProgressBroker;
use oshield_store::SurrealClient;
use oshield_verify::{VerificationAgent, VerificationDispatcher, VerificationRequest};
use oshield_witness::WitnessClient;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::logging::PipelineLogger;
use crate::storage::StorageLayout;

/// Drives videos through the processing state machine.
pub struct PipelineOrchestrator {
    store: Arc<SurrealClient>,
    broker: Arc<ProgressBroker>,
    graph: Arc<GraphClient>,
    witness: Arc<WitnessClient>,
    config: PipelineConfig,
    storage: StorageLayout,
    /// Serializes detector batches; one accelerator per process.
    gpu_lock: Mutex<()>,
    /// Cancellation handles for running phases, keyed by video id.
    active: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<SurrealClient>,
        broker: Arc<ProgressBroker>,
        graph: Arc<GraphClient>,
        witness: Arc<WitnessClient>,
        config: PipelineConfig,
    ) -> Self {
        let storage = StorageLayout::new(&config.storage.root);
        Self {
            store,
            broker,
            graph,
            witness,
            config,
            storage,
            gpu_lock: Mutex::new(()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn broker(&self) -> &Arc<ProgressBroker> {
        &self.broker
    }

    pub fn store(&self) -> &Arc<SurrealClient> {
        &self.store
    }

    pub fn storage(&self) -> &StorageLayout {
        &self.storage
    }

    /// Request cooperative cancellation of a running phase. Returns whether
    /// a phase was active; the terminal `CANCELLED` event is emitted by the
    /// phase itself once it unwinds.
    pub async fn cancel(&self, video_id: &VideoId) -> bool {
        let active = self.active.lock().await;
        match active.get(video_id.as_str()) {
            Some(handle) => handle.send(true).is_ok(),
            None => false,
        }
    }

    async fn track_cancel_handle(&self, video_id: &VideoId) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.active
            .lock()
            .await
            .insert(video_id.to_string(), tx);
        rx
    }

    async fn drop_cancel_handle(&self, video_id: &VideoId) {
        self.active.lock().await.remove(video_id.as_str());
    }

    // ========================================================================
    // Phase 1: detection + verification
    // ========================================================================

    /// Run phase-1 to its terminal state. Advances
    /// `processing → verified → waiting_for_review`, or straight through
    /// anonymization when nothing was detected, or `error`.
    pub async fn start_pipeline(
        self: Arc<Self>,
        video_id: VideoId,
        input_path: String,
        timeout_secs: Option<u64>,
    ) {
        let timeout = timeout_secs.unwrap_or(self.config.processing.timeout_seconds);
        let logger = PipelineLogger::new(video_id.as_str(), "phase1");
        logger.log_start(&format!("input={input_path} timeout={timeout}s"));

        let cancel_rx = self.track_cancel_handle(&video_id).await;

        let runner = {
            let this = Arc::clone(&self);
            let video_id = video_id.clone();
            let input_path = input_path.clone();
            let cancel_rx = cancel_rx.clone();
            tokio::spawn(async move { this.run_phase1(&video_id, &input_path, cancel_rx).await })
        };

        let result = match tokio::time::timeout(Duration::from_secs(timeout), runner).await {
            Ok(joined) => joined
                .unwrap_or_else(|e| Err(PipelineError::Internal(format!("phase task failed: {e}")))),
            Err(_elapsed) => {
                // Deadline: trip the token and let the phase unwind at its
                // next suspension point.
                self.cancel(&video_id).await;
                Err(PipelineError::Timeout(timeout))
            }
        };

        match result {
            Ok((detections, violations)) => {
                logger.log_completion(&format!(
                    "{detections} detections, {violations} violations"
                ));
            }
            Err(e) => {
                logger.log_error(&e.to_string());
                self.fail_phase1(&video_id, &input_path, e).await;
            }
        }
        self.drop_cancel_handle(&video_id).await;
    }

    async fn run_phase1(
        &self,
        video_id: &VideoId,
        input_path: &str,
        cancel: watch::Receiver<bool>,
    ) -> PipelineResult<(u64, u64)> {
        self.broker.register(video_id.as_str()).await;
        self.broker
            .change_phase(
                video_id.as_str(),
                ProcessingPhase::Detecting,
                "Starting detection analysis...",
            )
            .await;

        let info = probe_video(input_path).await?;
        validate_video(&info)?;

        // --- Detection ---
        let detection = self
            .run_detection(video_id, input_path, &info, &cancel)
            .await?;
        let total_detections = detection.detections.len() as u64;

        // Detection writes are batched after the phase completes so an abort
        // mid-phase persists nothing partial.
        let records: Vec<DetectionRecord> = detection
            .detections
            .iter()
            .map(|t| DetectionRecord::from_track(t, &video_id.record_id(), info.fps))
            .collect();
        let saved = self.store.save_detections(&records).await?;
        let saved_map: HashMap<u64, String> = saved.into_iter().collect();
        info!(video_id = %video_id, saved = saved_map.len(), "Detections persisted");

        // --- Verification ---
        self.broker
            .change_phase(
                video_id.as_str(),
                ProcessingPhase::Verifying,
                "Verifying GDPR compliance...",
            )
            .await;

        let requests = build_verification_requests(&detection.detections, &saved_map);
        self.broker
            .update_progress(
                video_id.as_str(),
                0,
                0,
                requests.len() as u64,
                &format!("Analyzing {} objects...", requests.len()),
            )
            .await;

        let dispatcher = VerificationDispatcher::new(
            VerificationAgent::new(Arc::clone(&self.graph), Arc::clone(&self.witness)),
            self.config.verification.max_workers,
        );
        let verification_started = Instant::now();
        let results = dispatcher
            .process_requests(video_id.as_str(), requests, &self.broker, &cancel)
            .await;
        if *cancel.borrow() {
            return Err(PipelineError::Cancelled);
        }

        let elapsed_ms = verification_started.elapsed().as_millis() as u64;
        let mut violations = 0u64;
        let mut write_failures = 0usize;
        for result in &results {
            if result.verdict.is_violation {
                violations += 1;
            }
            let record = VerificationRecord::from_verdict(
                &result.detection_id,
                &result.verdict,
                self.witness.model_id(),
                elapsed_ms / results.len().max(1) as u64,
            );
            if let Err(e) = self.store.save_verification(&record).await {
                write_failures += 1;
                warn!(track_id = result.track_id, "Failed to save verification: {e}");
            }
        }
        if !results.is_empty() && write_failures == results.len() {
            return Err(PipelineError::Dependency(
                "all verification writes failed".to_string(),
            ));
        }

        self.store
            .merge(
                &video_id.record_id(),
                &json!({
                    "status": VideoStatus::Verified,
                    "analysis_completed_at": Utc::now(),
                    "updated_at": Utc::now(),
                }),
            )
            .await?;

        // --- Review gate ---
        if detection.detections.is_empty() {
            // Nothing detected: no review needed, output is a metadata strip.
            info!(video_id = %video_id, "No detections; skipping review");
            self.store
                .set_video_status(video_id, VideoStatus::Editing)
                .await?;
            self.broker
                .change_phase(
                    video_id.as_str(),
                    ProcessingPhase::Anonymizing,
                    "Applying metadata stripping...",
                )
                .await;
            self.run_phase2(video_id, &[], "system", cancel).await?;
            return Ok((0, 0));
        }

        // Detections exist: a human confirms, even when the judge saw no
        // violations.
        let review_message = format!(
            "Analysis complete. Found {total_detections} detections \
             ({violations} potential violations). Waiting for human review."
        );
        self.broker
            .change_phase(
                video_id.as_str(),
                ProcessingPhase::WaitingForReview,
                &review_message,
            )
            .await;
        self.broker
            .update_progress(video_id.as_str(), 100, 0, 0, &review_message)
            .await;

        Ok((total_detections, violations))
    }

    /// Detection pass: batched inference, tracking and capture extraction.
    async fn run_detection(
        &self,
        video_id: &VideoId,
        input_path: &str,
        info: &VideoInfo,
        cancel: &watch::Receiver<bool>,
    ) -> PipelineResult<DetectionResult> {
        let started = Instant::now();

        // Detectors own the accelerator for the duration of the phase.
        let _gpu = self.gpu_lock.lock().await;

        let detector_config = DetectorConfig {
            models_dir: self.config.detector.models_dir.clone().into(),
            face_confidence: self.config.detector.confidence_threshold as f32,
            person_confidence: self.config.detector.confidence_threshold as f32,
            nms_threshold: self.config.detector.nms_threshold as f32,
            input_size: self.config.detector.input_size,
            ..Default::default()
        };
        let mut pool = DetectorPool::init(detector_config).await?;
        let batch_size = pool.batch_size();

        let mut reader = FrameReader::open(input_path, info).await?;
        let mut tracker = ObjectTracker::with_config(TrackerConfig {
            iou_threshold: self.config.tracking.iou_threshold,
            max_age: self.config.tracking.max_age,
            min_hits: self.config.tracking.min_hits,
            ..Default::default()
        });
        let captures_dir = self.storage.captures_dir(video_id.as_str());
        let mut capture_manager = CaptureManager::new(
            &captures_dir,
            CapturePolicy {
                stability_threshold: self.config.processing.stability_threshold,
                stability_frames: self.config.processing.stability_frames,
                capture_interval: self.config.processing.capture_interval,
                ..Default::default()
            },
        );

        let mut tracked: HashMap<u64, TrackedObject> = HashMap::new();
        let mut frames_processed = 0u64;

        loop {
            if *cancel.borrow() {
                reader.close().await;
                pool.close();
                return Err(PipelineError::Cancelled);
            }

            let batch = reader.next_batch(batch_size).await?;
            if batch.is_empty() {
                break;
            }
            let frames = Arc::new(batch);
            let mut by_frame = pool.detect_all(Arc::clone(&frames)).await?;

            for frame in frames.iter() {
                let detections = by_frame.remove(&frame.index).unwrap_or_default();
                let reported = tracker.update(&detections, frame.index);

                for (track_id, detection_type, bbox) in reported {
                    // Coasting tracks carry their last measurement; only
                    // measured frames extend history and captures.
                    if bbox.frame != frame.index {
                        continue;
                    }

                    let track = tracked
                        .entry(track_id)
                        .or_insert_with(|| TrackedObject::new(track_id, detection_type));
                    track.add_bbox(bbox.clone());

                    if let Some((clean_path, _annotated)) = capture_manager.consider_frame(
                        track_id,
                        detection_type,
                        frame,
                        &bbox,
                        info.fps,
                    )? {
                        track.captures.push(Capture {
                            frame: frame.index,
                            image_path: clean_path,
                            bbox: bbox.clone(),
                            reason: "periodic".to_string(),
                            timestamp: frame.index as f64 / info.fps,
                        });
                        self.broker
                            .report_detection(
                                video_id.as_str(),
                                detection_type.as_str(),
                                frame.index,
                                bbox.confidence,
                            )
                            .await;
                    }
                }
                frames_processed += 1;
            }

            let last = frames.last().map(|f| f.index).unwrap_or(frames_processed);
            let percent = if info.total_frames > 0 {
                ((last * 100) / info.total_frames).min(100) as u8
            } else {
                0
            };
            self.broker
                .update_progress(
                    video_id.as_str(),
                    percent,
                    last,
                    info.total_frames,
                    &format!("Detecting objects ({last}/{})", info.total_frames),
                )
                .await;
            tokio::task::yield_now().await;
        }

        reader.close().await;
        pool.close();

        self.broker
            .update_progress(
                video_id.as_str(),
                100,
                info.total_frames,
                info.total_frames,
                "Detection complete",
            )
            .await;

        let mut detections: Vec<TrackedObject> = tracked.into_values().collect();
        detections.sort_by_key(|t| t.track_id);

        info!(
            video_id = %video_id,
            frames = frames_processed,
            tracks = detections.len(),
            elapsed_s = started.elapsed().as_secs_f64(),
            "Detection pass finished"
        );

        Ok(DetectionResult {
            video_path: input_path.to_string(),
            total_frames: info.total_frames,
            fps: info.fps,
            duration_seconds: info.duration,
            width: info.width,
            height: info.height,
            detections,
            frames_processed,
            processing_time_seconds: started.elapsed().as_secs_f64(),
        })
    }

    /// Phase-1 failure path: mark the video, emit the terminal event, clean
    /// captures; invalid input additionally removes the upload and resets to
    /// pending so the user can re-upload.
    async fn fail_phase1(&self, video_id: &VideoId, input_path: &str, error: PipelineError) {
        if matches!(error, PipelineError::InvalidInput(_)) {
            let _ = tokio::fs::remove_file(input_path).await;
            let _ = self
                .store
                .set_video_status(video_id, VideoStatus::Pending)
                .await;
        } else if let Err(e) = self.store.set_video_error(video_id, &error.to_string()).await {
            warn!(video_id = %video_id, "Failed to persist error status: {e}");
        }

        self.storage.clean_captures(video_id.as_str()).await;
        self.broker
            .error(
                video_id.as_str(),
                error.code(),
                &error.to_string(),
                None,
                error.recoverable(),
            )
            .await;
    }

    // ========================================================================
    // Phase 2: anonymization
    // ========================================================================

    /// Apply reviewer decisions and render the final video. Advances
    /// `waiting_for_review → editing → completed` or `error`.
    pub async fn apply_decisions(
        self: Arc<Self>,
        video_id: VideoId,
        decisions: Vec<UserDecision>,
        user_display_name: String,
    ) {
        let logger = PipelineLogger::new(video_id.as_str(), "anonymization");
        logger.log_start(&format!("{} decisions", decisions.len()));

        let cancel_rx = self.track_cancel_handle(&video_id).await;
        let result = self
            .run_phase2_outer(&video_id, &decisions, &user_display_name, cancel_rx)
            .await;

        match result {
            Ok(()) => logger.log_completion("output rendered"),
            Err(e) => {
                logger.log_error(&e.to_string());
                self.fail_phase2(&video_id, e).await;
            }
        }
        self.drop_cancel_handle(&video_id).await;
    }

    async fn run_phase2_outer(
        &self,
        video_id: &VideoId,
        decisions: &[UserDecision],
        user_display_name: &str,
        cancel: watch::Receiver<bool>,
    ) -> PipelineResult<()> {
        // Re-register when the reviewer reconnected after a restart.
        if self.broker.get_state(video_id.as_str()).await.is_none() {
            self.broker.register(video_id.as_str()).await;
        }

        self.store
            .set_video_status(video_id, VideoStatus::Editing)
            .await?;
        self.broker
            .change_phase(
                video_id.as_str(),
                ProcessingPhase::Anonymizing,
                "Preparing anonymization...",
            )
            .await;

        self.run_phase2(video_id, decisions, user_display_name, cancel)
            .await
    }

    /// Shared with the zero-detections fast path of phase-1.
    async fn run_phase2(
        &self,
        video_id: &VideoId,
        decisions: &[UserDecision],
        user_display_name: &str,
        cancel: watch::Receiver<bool>,
    ) -> PipelineResult<()> {
        let video = self
            .store
            .get_video(video_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(video_id.to_string()))?;

        let input_path = video.original_path.clone();
        if !std::path::Path::new(&input_path).exists() {
            return Err(PipelineError::Edition(format!(
                "original video file missing: {input_path}"
            )));
        }

        let mut actions = Vec::new();
        for decision in decisions {
            if !decision.action.modifies() {
                continue;
            }
            match self.action_from_decision(decision).await {
                Ok(Some(action)) => actions.push(action),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        verification_id = %decision.verification_id,
                        "Skipping decision: {e}"
                    );
                }
            }
        }
        info!(video_id = %video_id, actions = actions.len(), "Anonymization actions resolved");

        let output_path = self.storage.processed_path(&input_path);
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::Resource(e.to_string()))?;
        }
        let output_str = output_path.to_string_lossy().into_owned();

        // Forward encoder progress onto the event stream.
        let (progress_tx, mut progress_rx) = mpsc::channel::<(u64, u64)>(8);
        let broker = Arc::clone(&self.broker);
        let progress_video = video_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some((current, total)) = progress_rx.recv().await {
                let percent = if total > 0 {
                    ((current * 100) / total).min(100) as u8
                } else {
                    0
                };
                broker
                    .update_progress(
                        &progress_video,
                        percent,
                        current,
                        total,
                        "Rendering anonymized video...",
                    )
                    .await;
            }
        });

        let render = Anonymizer::new()
            .apply(
                video_id.as_str(),
                &input_path,
                &output_str,
                actions.clone(),
                user_display_name,
                &cancel,
                Some(progress_tx),
            )
            .await;
        let _ = forwarder.await;
        render?;

        self.store
            .set_video_completed(video_id, &output_str)
            .await?;
        self.broker
            .complete(
                video_id.as_str(),
                decisions.len() as u64,
                actions.len() as u64,
                Some(format!("/download/{video_id}")),
            )
            .await;

        Ok(())
    }

    /// Resolve one reviewer decision to an anonymization action by walking
    /// verification → detection and reconstructing the track geometry.
    async fn action_from_decision(
        &self,
        decision: &UserDecision,
    ) -> PipelineResult<Option<AnonymizeAction>> {
        let Some(verification) = self
            .store
            .get_verification(&decision.verification_id)
            .await?
        else {
            warn!(verification_id = %decision.verification_id, "Verification record not found");
            return Ok(None);
        };

        let Some(detection) = self.store.get_detection(&verification.detection_id).await? else {
            warn!(detection_id = %verification.detection_id, "Detection record not found");
            return Ok(None);
        };

        let mut bboxes = HashMap::new();
        let mut masks = HashMap::new();
        for bbox in &detection.bbox_history {
            bboxes.insert(bbox.frame, [bbox.x1, bbox.y1, bbox.x2, bbox.y2]);
            if let Some(mask) = &bbox.mask {
                masks.insert(bbox.frame, mask.clone());
            }
        }

        let kind = match decision.action {
            DecisionAction::Blur => EffectKind::Blur,
            DecisionAction::Pixelate => EffectKind::Pixelate,
            DecisionAction::Mask => EffectKind::Mask,
            DecisionAction::NoModify => return Ok(None),
        };

        Ok(Some(AnonymizeAction {
            kind,
            track_id: detection.track_id,
            bboxes,
            masks,
            config: EffectConfig {
                kernel_size: self.config.edition.kernel_size,
                blocks: self.config.edition.pixelate_blocks,
                scramble_seed: self.config.edition.scramble_seed,
                ..Default::default()
            },
        }))
    }

    /// Phase-2 failure path: the source stays, partial output goes, the
    /// video is marked failed and the terminal event goes out.
    async fn fail_phase2(&self, video_id: &VideoId, error: PipelineError) {
        if let Ok(Some(video)) = self.store.get_video(video_id).await {
            let output = self.storage.processed_path(&video.original_path);
            let _ = tokio::fs::remove_file(&output).await;
        }
        if let Err(e) = self.store.set_video_error(video_id, &error.to_string()).await {
            warn!(video_id = %video_id, "Failed to persist error status: {e}");
        }

        let code = if error.recoverable() {
            error.code()
        } else {
            "EDITION_ERROR"
        };
        self.broker
            .error(
                video_id.as_str(),
                code,
                &error.to_string(),
                None,
                error.recoverable(),
            )
            .await;
    }
}

/// Expand tracks into per-capture verification requests linked to their
/// persisted detection records.
fn build_verification_requests(
    tracks: &[TrackedObject],
    saved_map: &HashMap<u64, String>,
) -> Vec<VerificationRequest> {
    let mut requests = Vec::new();
    for track in tracks {
        if track.captures.is_empty() {
            continue;
        }
        let Some(detection_id) = saved_map.get(&track.track_id) else {
            continue;
        };
        for capture in &track.captures {
            requests.push(VerificationRequest {
                image_path: capture.image_path.clone(),
                detection_id: detection_id.clone(),
                track_id: track.track_id,
                detection_type: track.detection_type,
                bbox: capture.bbox.clone(),
                frame: capture.frame,
                timestamp: capture.timestamp,
            });
        }
    }
    requests
}
