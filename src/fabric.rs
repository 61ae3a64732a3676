//! In-process message fabric: typed pub/sub topics keyed by master id.
//!
//! Delivery is at-most-once and in send order per (sender, topic). A topic
//! with no subscriber drops messages; a lagging subscriber loses the oldest
//! buffered messages rather than blocking the sender.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{Epoch, RescUnit, WorkerId, WorkerStatus};

pub fn heartbeat_ping_topic(master_id: &str) -> String {
    format!("heartbeat-ping-{master_id}")
}

pub fn heartbeat_pong_topic(master_id: &str) -> String {
    format!("heartbeat-pong-{master_id}")
}

pub fn status_update_topic(master_id: &str) -> String {
    format!("status-update-{master_id}")
}

pub fn workload_report_topic(master_id: &str) -> String {
    format!("workload-report-{master_id}")
}

/// Periodic liveness probe from a worker to its master.
///
/// `send_time` is a monotonic duration since the worker started, so the
/// worker can compute a round trip from the echoed value without any clock
/// agreement with the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPing {
    pub send_time: Duration,
    pub from_worker_id: WorkerId,
    pub epoch: Epoch,
}

/// Master's reply to a ping. Carries the master's current epoch; a worker
/// seeing a higher epoch than its own must re-handshake before resuming
/// heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPong {
    /// Echo of the ping's `send_time`.
    pub send_time: Duration,
    pub reply_time: DateTime<Utc>,
    pub epoch: Epoch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadReport {
    pub worker_id: WorkerId,
    pub resc_unit: RescUnit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    HeartbeatPing(HeartbeatPing),
    HeartbeatPong(HeartbeatPong),
    StatusUpdate(StatusUpdate),
    WorkloadReport(WorkloadReport),
}

const TOPIC_BUFFER: usize = 1024;

/// Process-local topic registry. All components of one engine process share
/// a single `Fabric` behind an `Arc`.
#[derive(Default)]
pub struct Fabric {
    topics: Mutex<HashMap<String, broadcast::Sender<Message>>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `topic`. The channel is created on first use, so the
    /// subscription order between publisher and subscriber does not matter.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Message> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
            .subscribe()
    }

    /// Publish `message` on `topic`. A message published before any
    /// subscription, or after all receivers dropped, is discarded.
    pub fn publish(&self, topic: &str, message: Message) {
        let sender = {
            let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            topics.get(topic).cloned()
        };
        if let Some(tx) = sender {
            let _ = tx.send(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_is_in_send_order() {
        let fabric = Fabric::new();
        let mut rx = fabric.subscribe("t");
        for i in 0..5u64 {
            fabric.publish(
                "t",
                Message::WorkloadReport(WorkloadReport {
                    worker_id: "w".into(),
                    resc_unit: i,
                }),
            );
        }
        for i in 0..5u64 {
            match rx.recv().await.expect("message") {
                Message::WorkloadReport(r) => assert_eq!(r.resc_unit, i),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_dropped() {
        let fabric = Fabric::new();
        fabric.publish(
            "empty",
            Message::WorkloadReport(WorkloadReport {
                worker_id: "w".into(),
                resc_unit: 1,
            }),
        );
        // Subscribing afterwards must not replay the dropped message.
        let mut rx = fabric.subscribe("empty");
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
