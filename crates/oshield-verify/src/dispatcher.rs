//! Bounded-concurrency fan-out of verification requests.
//!
//! Requests are grouped by track. Groups run in parallel, but a single
//! semaphore bounds concurrent model calls across every group, so the fan-out
//! of one busy track can never starve the backend. Within a group, result
//! order does not matter; the judge is order-insensitive.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use oshield_models::{DetectionType, TrackVerdict};
use oshield_progress::ProgressBroker;

use crate::agent::{CaptureEvidence, VerificationAgent, VerificationRequest};
use crate::judge::{Judge, LegalContext};

/// Default bound on concurrent model calls.
const DEFAULT_MAX_WORKERS: usize = 4;

/// Judged outcome for one track.
#[derive(Debug, Clone)]
pub struct TrackVerification {
    pub track_id: u64,
    pub detection_id: String,
    pub detection_type: DetectionType,
    pub verdict: TrackVerdict,
}

/// Dispatches capture verification with a global concurrency bound.
pub struct VerificationDispatcher {
    agent: Arc<VerificationAgent>,
    semaphore: Arc<Semaphore>,
}

impl VerificationDispatcher {
    pub fn new(agent: VerificationAgent, max_workers: usize) -> Self {
        let workers = if max_workers == 0 {
            DEFAULT_MAX_WORKERS
        } else {
            max_workers
        };
        Self {
            agent: Arc::new(agent),
            semaphore: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Process all requests for one video and return one verdict per track.
    ///
    /// Cancellation stops new groups from starting; in-flight groups finish.
    pub async fn process_requests(
        &self,
        video_id: &str,
        requests: Vec<VerificationRequest>,
        broker: &ProgressBroker,
        cancel: &watch::Receiver<bool>,
    ) -> Vec<TrackVerification> {
        let mut groups: BTreeMap<u64, Vec<VerificationRequest>> = BTreeMap::new();
        for request in requests {
            groups.entry(request.track_id).or_default().push(request);
        }

        let total_groups = groups.len() as u64;
        let completed = Arc::new(AtomicU64::new(0));
        info!(
            video_id = %video_id,
            tracks = total_groups,
            "Starting verification fan-out"
        );

        let futures = groups.into_iter().map(|(track_id, group)| {
            let agent = Arc::clone(&self.agent);
            let semaphore = Arc::clone(&self.semaphore);
            let completed = Arc::clone(&completed);
            let cancel = cancel.clone();
            let video_id = video_id.to_string();

            async move {
                if *cancel.borrow() {
                    warn!(track_id, "Verification cancelled before group start");
                    return None;
                }

                let result =
                    Self::process_group(agent, semaphore, track_id, group).await;

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                broker
                    .report_verification(
                        &video_id,
                        &format!("track_{track_id}"),
                        "verified",
                        done,
                        total_groups,
                    )
                    .await;
                result
            }
        });

        join_all(futures).await.into_iter().flatten().collect()
    }

    /// Run every capture of one track through the agent, then judge them.
    async fn process_group(
        agent: Arc<VerificationAgent>,
        semaphore: Arc<Semaphore>,
        track_id: u64,
        group: Vec<VerificationRequest>,
    ) -> Option<TrackVerification> {
        let detection_id = group.first()?.detection_id.clone();
        let detection_type = group.first()?.detection_type;

        let evidence_futures = group.iter().map(|request| {
            let agent = Arc::clone(&agent);
            let semaphore = Arc::clone(&semaphore);
            async move {
                // Closed only on process shutdown.
                let _permit = semaphore.acquire_owned().await.ok()?;
                Some(agent.verify_capture(request).await)
            }
        });
        let evidence: Vec<CaptureEvidence> = join_all(evidence_futures)
            .await
            .into_iter()
            .flatten()
            .collect();

        let mut reports = Vec::new();
        let mut verdicts = Vec::new();
        for item in evidence {
            match item {
                CaptureEvidence::Witness(report) => reports.push(report),
                CaptureEvidence::Verdict(verdict) => verdicts.push(verdict),
            }
        }

        let verdict = if !reports.is_empty() {
            let legal = Self::legal_context_for_person(&agent, &reports).await;
            Judge::aggregate_person(&reports, &legal)
        } else {
            Judge::aggregate_verdicts(&verdicts)
        };

        metrics::counter!("oshield_verifications_total").increment(1);
        Some(TrackVerification {
            track_id,
            detection_id,
            detection_type,
            verdict,
        })
    }

    /// Retrieve the legal context the judge enriches person verdicts with.
    async fn legal_context_for_person(
        agent: &VerificationAgent,
        reports: &[oshield_models::WitnessReport],
    ) -> LegalContext {
        let mut objects: Vec<String> = vec!["person".to_string()];
        for report in reports {
            for tag in &report.tags {
                if !objects.contains(tag) {
                    objects.push(tag.clone());
                }
            }
        }

        let query = format!("GDPR violations related to {}", objects.join(", "));
        let snippets = agent.graph().hybrid_search(&query, &objects, 6).await;
        let articles = agent.graph().context_for("person").await;
        LegalContext { articles, snippets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oshield_graph::{GraphClient, GraphConfig};
    use oshield_models::BoundingBox;
    use oshield_witness::{WitnessClient, WitnessConfig};
    use std::time::Duration;

    fn offline_agent() -> VerificationAgent {
        // Both backends point at closed ports; the graph falls back to the
        // static context and the witness falls back to rule/mock responses.
        let graph = GraphClient::new(GraphConfig {
            uri: "http://127.0.0.1:1".to_string(),
            user: "neo4j".to_string(),
            password: "password".to_string(),
            database: "neo4j".to_string(),
            timeout: Duration::from_millis(200),
        })
        .unwrap();
        let witness = WitnessClient::new(WitnessConfig {
            endpoint: "http://127.0.0.1:1/v1/chat/completions".to_string(),
            model_id: "test-model".to_string(),
            timeout: Duration::from_millis(200),
        })
        .unwrap();
        VerificationAgent::new(Arc::new(graph), Arc::new(witness))
    }

    fn request(track_id: u64, ty: DetectionType, frame: u64) -> VerificationRequest {
        VerificationRequest {
            image_path: "/nonexistent/capture.jpg".to_string(),
            detection_id: format!("detection:d{track_id}"),
            track_id,
            detection_type: ty,
            bbox: BoundingBox::new(0.0, 0.0, 40.0, 40.0, 0.9, frame),
            frame,
            timestamp: frame as f64 / 30.0,
        }
    }

    #[tokio::test]
    async fn test_groups_produce_one_verdict_per_track() {
        let dispatcher = VerificationDispatcher::new(offline_agent(), 2);
        let broker = ProgressBroker::new();
        broker.register("vid_a").await;
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let requests = vec![
            request(1, DetectionType::LicensePlate, 10),
            request(1, DetectionType::LicensePlate, 40),
            request(2, DetectionType::Face, 15),
        ];

        let results = dispatcher
            .process_requests("vid_a", requests, &broker, &cancel_rx)
            .await;

        assert_eq!(results.len(), 2);
        let plate = results.iter().find(|r| r.track_id == 1).unwrap();
        assert!(plate.verdict.is_violation);
        // Two violating frames escalate to high.
        assert_eq!(plate.verdict.severity, oshield_models::Severity::High);
    }

    #[tokio::test]
    async fn test_verification_progress_reported_per_group() {
        let dispatcher = VerificationDispatcher::new(offline_agent(), 2);
        let broker = ProgressBroker::new();
        broker.register("vid_a").await;
        let mut sub = broker.subscribe("vid_a").await;
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let requests = vec![
            request(1, DetectionType::LicensePlate, 10),
            request(2, DetectionType::Signature, 20),
        ];
        dispatcher
            .process_requests("vid_a", requests, &broker, &cancel_rx)
            .await;

        let mut seen = Vec::new();
        while let Ok(event) = sub.receiver.try_recv() {
            if let oshield_models::ProgressEvent::Verification {
                agents_completed,
                total_agents,
                ..
            } = event
            {
                seen.push((agents_completed, total_agents));
            }
        }
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&(2, 2)));
    }

    #[tokio::test]
    async fn test_cancel_stops_new_groups() {
        let dispatcher = VerificationDispatcher::new(offline_agent(), 2);
        let broker = ProgressBroker::new();
        broker.register("vid_a").await;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();

        let requests = vec![request(1, DetectionType::LicensePlate, 10)];
        let results = dispatcher
            .process_requests("vid_a", requests, &broker, &cancel_rx)
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_mock_witness_still_produces_person_verdict() {
        // Scenario: LLM down, pipeline still judges persons from mock
        // reports (reduced confidence, unmatched context => normal).
        let dispatcher = VerificationDispatcher::new(offline_agent(), 2);
        let broker = ProgressBroker::new();
        broker.register("vid_a").await;
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let results = dispatcher
            .process_requests(
                "vid_a",
                vec![request(5, DetectionType::Person, 12)],
                &broker,
                &cancel_rx,
            )
            .await;

        assert_eq!(results.len(), 1);
        let verdict = &results[0].verdict;
        assert!(!verdict.is_violation);
        assert!(verdict.confidence <= 0.75);
    }
}
