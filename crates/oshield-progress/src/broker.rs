//! Per-video progress state and multi-subscriber broadcast.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use oshield_models::{ProcessingPhase, ProgressEvent, ProgressSnapshot};

/// Capacity of each subscriber queue.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 32;

/// Deadline for enqueuing an event to one subscriber before it is
/// considered dead.
const BROADCAST_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// In-memory progress state for one video.
#[derive(Debug)]
struct VideoProgress {
    phase: ProcessingPhase,
    progress: u8,
    current: u64,
    total: u64,
    message: String,
    detections: HashMap<String, u64>,
    errors: Vec<(String, String)>,
    started_at: DateTime<Utc>,
    subscribers: Vec<mpsc::Sender<ProgressEvent>>,
}

impl VideoProgress {
    fn new() -> Self {
        Self {
            phase: ProcessingPhase::Idle,
            progress: 0,
            current: 0,
            total: 0,
            message: String::new(),
            detections: HashMap::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            subscribers: Vec::new(),
        }
    }

    fn snapshot(&self, video_id: &str) -> ProgressSnapshot {
        ProgressSnapshot {
            video_id: video_id.to_string(),
            phase: self.phase,
            progress: self.progress,
            current: self.current,
            total: self.total,
            message: self.message.clone(),
            detections: self.detections.clone(),
            elapsed_seconds: (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0,
        }
    }
}

/// A live subscription to one video's events.
pub struct Subscription {
    pub video_id: String,
    pub receiver: mpsc::Receiver<ProgressEvent>,
    /// Handle identifying this subscriber inside the broker.
    sender: mpsc::Sender<ProgressEvent>,
}

impl Subscription {
    pub(crate) fn sender(&self) -> &mpsc::Sender<ProgressEvent> {
        &self.sender
    }
}

/// Progress broker: per-video state plus subscriber fan-out.
///
/// All mutations take a single async mutex and are brief; event delivery
/// happens outside the lock.
pub struct ProgressBroker {
    videos: Mutex<HashMap<String, VideoProgress>>,
    send_timeout: Duration,
}

impl Default for ProgressBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBroker {
    pub fn new() -> Self {
        Self {
            videos: Mutex::new(HashMap::new()),
            send_timeout: BROADCAST_SEND_TIMEOUT,
        }
    }

    /// Override the broadcast deadline (tests).
    #[cfg(test)]
    fn with_send_timeout(timeout: Duration) -> Self {
        Self {
            videos: Mutex::new(HashMap::new()),
            send_timeout: timeout,
        }
    }

    /// Register a video for tracking. Idempotent: an existing state is kept.
    pub async fn register(&self, video_id: &str) {
        let mut videos = self.videos.lock().await;
        if !videos.contains_key(video_id) {
            videos.insert(video_id.to_string(), VideoProgress::new());
            debug!(video_id = %video_id, "Registered video for progress tracking");
        }
    }

    /// Seed the phase for a video registered from persisted state.
    pub async fn seed_phase(&self, video_id: &str, phase: ProcessingPhase, message: &str) {
        let mut videos = self.videos.lock().await;
        if let Some(v) = videos.get_mut(video_id) {
            v.phase = phase;
            v.message = message.to_string();
        }
    }

    /// Current snapshot of a video's state, if registered.
    pub async fn get_state(&self, video_id: &str) -> Option<ProgressSnapshot> {
        let videos = self.videos.lock().await;
        videos.get(video_id).map(|v| v.snapshot(video_id))
    }

    /// Attach a new subscriber queue to a video. The video is registered if
    /// it was not already.
    pub async fn subscribe(&self, video_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let mut videos = self.videos.lock().await;
        let entry = videos
            .entry(video_id.to_string())
            .or_insert_with(VideoProgress::new);
        entry.subscribers.push(tx.clone());
        Subscription {
            video_id: video_id.to_string(),
            receiver: rx,
            sender: tx,
        }
    }

    /// Detach a subscriber.
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        let mut videos = self.videos.lock().await;
        if let Some(v) = videos.get_mut(&subscription.video_id) {
            v.subscribers
                .retain(|s| !s.same_channel(subscription.sender()));
        }
    }

    /// Number of live subscribers for a video.
    pub async fn subscriber_count(&self, video_id: &str) -> usize {
        let videos = self.videos.lock().await;
        videos
            .get(video_id)
            .map(|v| v.subscribers.len())
            .unwrap_or(0)
    }

    /// Drop all state and subscribers for a video.
    pub async fn cleanup(&self, video_id: &str) {
        let mut videos = self.videos.lock().await;
        videos.remove(video_id);
    }

    /// Deliver one event to every subscriber of a video. Subscribers that
    /// fail or miss the deadline are removed; nobody retries.
    async fn broadcast(&self, video_id: &str, event: ProgressEvent) {
        let subscribers: Vec<mpsc::Sender<ProgressEvent>> = {
            let videos = self.videos.lock().await;
            match videos.get(video_id) {
                Some(v) => v.subscribers.clone(),
                None => return,
            }
        };

        if subscribers.is_empty() {
            return;
        }

        let mut dead: Vec<mpsc::Sender<ProgressEvent>> = Vec::new();
        for sender in &subscribers {
            if sender
                .send_timeout(event.clone(), self.send_timeout)
                .await
                .is_err()
            {
                dead.push(sender.clone());
            }
        }

        if !dead.is_empty() {
            warn!(
                video_id = %video_id,
                dropped = dead.len(),
                "Dropping unresponsive progress subscribers"
            );
            let mut videos = self.videos.lock().await;
            if let Some(v) = videos.get_mut(video_id) {
                v.subscribers
                    .retain(|s| !dead.iter().any(|d| d.same_channel(s)));
            }
        }
    }

    // ========================================================================
    // Emitters
    // ========================================================================

    /// Change the processing phase. Resets the progress percentage.
    pub async fn change_phase(&self, video_id: &str, phase: ProcessingPhase, message: &str) {
        let previous = {
            let mut videos = self.videos.lock().await;
            let Some(v) = videos.get_mut(video_id) else {
                return;
            };
            let previous = v.phase;
            v.phase = phase;
            v.message = message.to_string();
            v.progress = 0;
            previous
        };

        debug!(video_id = %video_id, from = %previous, to = %phase, "Phase change");
        self.broadcast(
            video_id,
            ProgressEvent::PhaseChange {
                phase,
                previous_phase: previous,
                message: message.to_string(),
                estimated_time_seconds: None,
                timestamp: Utc::now(),
            },
        )
        .await;
    }

    /// Update progress within the current phase.
    pub async fn update_progress(
        &self,
        video_id: &str,
        progress: u8,
        current: u64,
        total: u64,
        message: &str,
    ) {
        let (phase, progress) = {
            let mut videos = self.videos.lock().await;
            let Some(v) = videos.get_mut(video_id) else {
                return;
            };
            v.progress = progress.min(100);
            v.current = current;
            v.total = total;
            if !message.is_empty() {
                v.message = message.to_string();
            }
            (v.phase, v.progress)
        };

        self.broadcast(
            video_id,
            ProgressEvent::Progress {
                phase,
                progress,
                current,
                total,
                message: message.to_string(),
                timestamp: Utc::now(),
            },
        )
        .await;
    }

    /// Report a new detection; counts accumulate per type.
    pub async fn report_detection(
        &self,
        video_id: &str,
        detection_type: &str,
        frame_number: u64,
        confidence: f64,
    ) {
        let count = {
            let mut videos = self.videos.lock().await;
            let Some(v) = videos.get_mut(video_id) else {
                return;
            };
            let count = v.detections.entry(detection_type.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        self.broadcast(
            video_id,
            ProgressEvent::Detection {
                detection_type: detection_type.to_string(),
                count,
                frame_number,
                confidence,
                message: format!("Detected {detection_type} #{count} at frame {frame_number}"),
                timestamp: Utc::now(),
            },
        )
        .await;
    }

    /// Report verification progress (completed groups out of total).
    pub async fn report_verification(
        &self,
        video_id: &str,
        vulnerability_id: &str,
        status: &str,
        agents_completed: u64,
        total_agents: u64,
    ) {
        self.broadcast(
            video_id,
            ProgressEvent::Verification {
                vulnerability_id: vulnerability_id.to_string(),
                status: status.to_string(),
                agents_completed,
                total_agents,
                message: format!("Verifying: {agents_completed}/{total_agents} complete"),
                timestamp: Utc::now(),
            },
        )
        .await;
    }

    /// Terminal success event.
    pub async fn complete(
        &self,
        video_id: &str,
        total_vulnerabilities: u64,
        total_violations: u64,
        redirect_url: Option<String>,
    ) {
        let elapsed = {
            let mut videos = self.videos.lock().await;
            let Some(v) = videos.get_mut(video_id) else {
                return;
            };
            v.phase = ProcessingPhase::Completed;
            v.progress = 100;
            (Utc::now() - v.started_at).num_milliseconds() as f64 / 1000.0
        };

        self.broadcast(
            video_id,
            ProgressEvent::Complete {
                video_id: video_id.to_string(),
                total_vulnerabilities,
                total_violations,
                processing_time_seconds: elapsed,
                redirect_url: redirect_url.unwrap_or_else(|| format!("/download/{video_id}")),
                message: format!("Processing complete! Found {total_violations} violations."),
                timestamp: Utc::now(),
            },
        )
        .await;
    }

    /// Terminal error event.
    pub async fn error(
        &self,
        video_id: &str,
        code: &str,
        message: &str,
        details: Option<String>,
        recoverable: bool,
    ) {
        {
            let mut videos = self.videos.lock().await;
            if let Some(v) = videos.get_mut(video_id) {
                v.phase = ProcessingPhase::Error;
                v.errors.push((code.to_string(), message.to_string()));
            }
        }

        self.broadcast(
            video_id,
            ProgressEvent::Error {
                code: code.to_string(),
                message: message.to_string(),
                details,
                recoverable,
                timestamp: Utc::now(),
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let broker = ProgressBroker::new();
        broker.register("vid_a").await;
        broker
            .change_phase("vid_a", ProcessingPhase::Detecting, "detecting")
            .await;
        broker.register("vid_a").await;

        let state = broker.get_state("vid_a").await.unwrap();
        assert_eq!(state.phase, ProcessingPhase::Detecting);
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe_restores_state() {
        let broker = ProgressBroker::new();
        broker.register("vid_a").await;
        assert_eq!(broker.subscriber_count("vid_a").await, 0);

        let sub = broker.subscribe("vid_a").await;
        assert_eq!(broker.subscriber_count("vid_a").await, 1);

        broker.unsubscribe(&sub).await;
        assert_eq!(broker.subscriber_count("vid_a").await, 0);
    }

    #[tokio::test]
    async fn test_events_delivered_in_emission_order() {
        let broker = ProgressBroker::new();
        broker.register("vid_a").await;
        let mut sub = broker.subscribe("vid_a").await;

        broker
            .change_phase("vid_a", ProcessingPhase::Detecting, "start")
            .await;
        broker.update_progress("vid_a", 10, 30, 300, "").await;
        broker.update_progress("vid_a", 20, 60, 300, "").await;

        match sub.receiver.recv().await.unwrap() {
            ProgressEvent::PhaseChange { phase, .. } => {
                assert_eq!(phase, ProcessingPhase::Detecting)
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match sub.receiver.recv().await.unwrap() {
            ProgressEvent::Progress { progress, .. } => assert_eq!(progress, 10),
            other => panic!("unexpected event: {other:?}"),
        }
        match sub.receiver.recv().await.unwrap() {
            ProgressEvent::Progress { progress, .. } => assert_eq!(progress, 20),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dead_subscriber_dropped_others_survive() {
        let broker = ProgressBroker::with_send_timeout(Duration::from_millis(20));
        broker.register("vid_a").await;

        // Dead subscriber: never consumes, queue fills up.
        let dead = broker.subscribe("vid_a").await;
        let mut live = broker.subscribe("vid_a").await;

        for i in 0..(SUBSCRIBER_QUEUE_CAPACITY as u64 + 4) {
            broker.update_progress("vid_a", 1, i, 100, "").await;
            // Keep the live queue drained.
            while let Ok(_event) = live.receiver.try_recv() {}
        }

        assert_eq!(broker.subscriber_count("vid_a").await, 1);
        drop(dead);
    }

    #[tokio::test]
    async fn test_detection_counts_accumulate() {
        let broker = ProgressBroker::new();
        broker.register("vid_a").await;
        let mut sub = broker.subscribe("vid_a").await;

        broker.report_detection("vid_a", "face", 10, 0.9).await;
        broker.report_detection("vid_a", "face", 20, 0.8).await;
        broker.report_detection("vid_a", "person", 20, 0.7).await;

        let mut last_face_count = 0;
        for _ in 0..3 {
            if let ProgressEvent::Detection {
                detection_type,
                count,
                ..
            } = sub.receiver.recv().await.unwrap()
            {
                if detection_type == "face" {
                    last_face_count = count;
                }
            }
        }
        assert_eq!(last_face_count, 2);

        let state = broker.get_state("vid_a").await.unwrap();
        assert_eq!(state.detections.get("face"), Some(&2));
        assert_eq!(state.detections.get("person"), Some(&1));
    }

    #[tokio::test]
    async fn test_complete_is_terminal_and_sets_progress() {
        let broker = ProgressBroker::new();
        broker.register("vid_a").await;
        let mut sub = broker.subscribe("vid_a").await;

        broker.complete("vid_a", 3, 2, None).await;

        let event = sub.receiver.recv().await.unwrap();
        assert!(event.is_terminal());
        let state = broker.get_state("vid_a").await.unwrap();
        assert_eq!(state.progress, 100);
        assert_eq!(state.phase, ProcessingPhase::Completed);
    }

    #[tokio::test]
    async fn test_cleanup_removes_state() {
        let broker = ProgressBroker::new();
        broker.register("vid_a").await;
        broker.cleanup("vid_a").await;
        assert!(broker.get_state("vid_a").await.is_none());
    }
}
