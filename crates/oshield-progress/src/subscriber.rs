//! Subscriber loop: drives one subscription to a network-facing sink.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use oshield_models::{ProgressEvent, ProgressSnapshot};

use crate::broker::{ProgressBroker, Subscription};

/// Heartbeat cadence while the stream is idle.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Consume a subscription and forward events to `out` until a terminal event
/// arrives or the consumer goes away.
///
/// Contract: the first delivered event is an `initial_state` snapshot; a
/// `heartbeat` is emitted after 15 s without traffic; delivery stops after
/// `complete` or `error`; the subscription is detached on all exit paths.
pub async fn run_subscriber(
    broker: &ProgressBroker,
    mut subscription: Subscription,
    out: mpsc::Sender<ProgressEvent>,
) {
    let video_id = subscription.video_id.clone();

    let initial = broker
        .get_state(&video_id)
        .await
        .unwrap_or_else(|| ProgressSnapshot {
            video_id: video_id.clone(),
            message: "Waiting for processing to start...".to_string(),
            ..Default::default()
        });

    if out
        .send(ProgressEvent::InitialState { state: initial })
        .await
        .is_err()
    {
        broker.unsubscribe(&subscription).await;
        return;
    }

    loop {
        let event = match tokio::time::timeout(HEARTBEAT_INTERVAL, subscription.receiver.recv())
            .await
        {
            Ok(Some(event)) => event,
            // Broker dropped the queue (dead-subscriber eviction or cleanup).
            Ok(None) => break,
            Err(_elapsed) => ProgressEvent::Heartbeat,
        };

        let terminal = event.is_terminal();
        if out.send(event).await.is_err() {
            debug!(video_id = %video_id, "Progress consumer disconnected");
            break;
        }
        if terminal {
            debug!(video_id = %video_id, "Terminal event delivered, closing stream");
            break;
        }
    }

    broker.unsubscribe(&subscription).await;
}
