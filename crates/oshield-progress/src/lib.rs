//! In-memory progress broker.
//!
//! One broker per process fans typed progress events out to the live
//! subscribers of each video. Emitters never block on a slow consumer: each
//! subscriber has a bounded queue and a send deadline, and a subscriber that
//! misses the deadline is dropped.

mod broker;
mod subscriber;

pub use broker::{ProgressBroker, Subscription, SUBSCRIBER_QUEUE_CAPACITY};
pub use subscriber::{run_subscriber, HEARTBEAT_INTERVAL};
