//! Heartbeat bookkeeping for the server-master.
//!
//! The supervisor records when each worker was last heard from and answers
//! pings with pongs. It never touches the FSM; the manager's check loop
//! reads `timed_out` and drives the transitions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::fabric::{HeartbeatPing, HeartbeatPong};
use crate::model::{Epoch, RescUnit, WorkerId, WorkerStatus};

#[derive(Debug)]
struct WorkerTrack {
    last_ping: Instant,
    last_status: Option<WorkerStatus>,
    workload: RescUnit,
}

impl WorkerTrack {
    fn new() -> Self {
        Self {
            last_ping: Instant::now(),
            last_status: None,
            workload: 0,
        }
    }
}

pub struct HeartbeatSupervisor {
    /// Window after which a silent worker is declared dead.
    timeout: Duration,
    workers: HashMap<WorkerId, WorkerTrack>,
    /// Wall clock can step backwards; pong reply times are kept
    /// non-decreasing per master instead of trusting it blindly.
    last_reply: DateTime<Utc>,
}

impl HeartbeatSupervisor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            workers: HashMap::new(),
            last_reply: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Start the liveness clock for a worker expected to appear: one that
    /// was just dispatched, or one recovered from failover that should
    /// still be heartbeating.
    pub fn expect(&mut self, worker_id: &str) {
        self.workers
            .insert(worker_id.to_string(), WorkerTrack::new());
    }

    /// Record a ping and build the pong reply carrying the master's
    /// current epoch.
    pub fn on_ping(&mut self, ping: &HeartbeatPing, epoch: Epoch) -> HeartbeatPong {
        self.workers
            .entry(ping.from_worker_id.clone())
            .or_insert_with(WorkerTrack::new)
            .last_ping = Instant::now();

        let now = Utc::now();
        let reply_time = if now > self.last_reply {
            now
        } else {
            self.last_reply
        };
        self.last_reply = reply_time;
        HeartbeatPong {
            send_time: ping.send_time,
            reply_time,
            epoch,
        }
    }

    pub fn on_status(&mut self, worker_id: &str, status: WorkerStatus) {
        if let Some(track) = self.workers.get_mut(worker_id) {
            track.last_status = Some(status);
        }
    }

    pub fn on_workload(&mut self, worker_id: &str, resc_unit: RescUnit) {
        if let Some(track) = self.workers.get_mut(worker_id) {
            track.workload = resc_unit;
        }
    }

    pub fn last_status(&self, worker_id: &str) -> Option<&WorkerStatus> {
        self.workers.get(worker_id)?.last_status.as_ref()
    }

    /// Workers whose last ping is older than the timeout window.
    pub fn timed_out(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|(_, track)| track.last_ping.elapsed() > self.timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Stop tracking a worker that went offline.
    pub fn remove(&mut self, worker_id: &str) {
        self.workers.remove(worker_id);
    }
}
