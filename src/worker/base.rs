//! The base worker: composes heartbeats, rate-limited status reports and
//! lifecycle management around a concrete [`WorkerImpl`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fabric::{
    heartbeat_ping_topic, heartbeat_pong_topic, status_update_topic, workload_report_topic,
    Fabric, HeartbeatPing, HeartbeatPong, Message, StatusUpdate, WorkloadReport,
};
use crate::meta::MetaClient;
use crate::model::{Epoch, MasterFailoverReason, MasterId, WorkerId, WorkerStatus};
use crate::worker::limiter::TokenBucket;
use crate::worker::WorkerImpl;

/// Framework half of a running worker.
///
/// Lifecycle: `init_impl` exactly once, then the tick loop with heartbeats
/// alongside, until the worker reports a terminal status, the master goes
/// silent past the timeout, or the executor shuts the worker down.
pub struct BaseWorker {
    worker_id: WorkerId,
    master_id: MasterId,
    /// Epoch of the supervising master as last learned from a pong.
    epoch: Epoch,
    fabric: Arc<Fabric>,
    meta: Arc<dyn MetaClient>,
    cfg: EngineConfig,
    shutdown: CancellationToken,
    /// Monotonic clock base for ping send times.
    start: Instant,
    limiter: TokenBucket,
}

impl BaseWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: WorkerId,
        master_id: MasterId,
        epoch: Epoch,
        fabric: Arc<Fabric>,
        meta: Arc<dyn MetaClient>,
        cfg: EngineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let limiter = TokenBucket::new(cfg.status_rate_interval, cfg.status_rate_burst);
        Self {
            worker_id,
            master_id,
            epoch,
            fabric,
            meta,
            cfg,
            shutdown,
            start: Instant::now(),
            limiter,
        }
    }

    /// Drive `worker` through its full lifecycle. Returns the final
    /// observed status on a clean exit.
    pub async fn run(mut self, mut worker: Box<dyn WorkerImpl>) -> Result<WorkerStatus> {
        let worker_token = self.shutdown.child_token();

        if let Err(e) = worker.init_impl(&worker_token).await {
            tracing::error!(
                worker_id = %self.worker_id,
                error = %e,
                "worker initialization failed"
            );
            let status = WorkerStatus::with_error(e.to_string());
            self.report_status(&status, worker.workload()).await;
            self.close_worker(&mut worker, &worker_token).await;
            return Err(EngineError::WorkerInitFailed(e.to_string()));
        }

        // Heartbeats start only after a successful init.
        let mut pongs = self
            .fabric
            .subscribe(&heartbeat_pong_topic(&self.master_id));
        let mut heartbeat = tokio::time::interval(self.cfg.worker_heartbeat_interval);
        let mut ticks = tokio::time::interval(self.cfg.worker_tick_interval);
        let mut last_pong = Instant::now();
        // First terminal status observation is sticky: once set, `status()`
        // is never consulted again.
        let mut terminal: Option<WorkerStatus> = None;

        loop {
            tokio::select! {
                _ = worker_token.cancelled() => {
                    tracing::info!(worker_id = %self.worker_id, "worker cancelled");
                    self.close_worker(&mut worker, &worker_token).await;
                    return Ok(terminal.unwrap_or_else(|| worker.status()));
                }

                _ = heartbeat.tick() => {
                    if last_pong.elapsed() > self.cfg.worker_timeout {
                        tracing::error!(
                            worker_id = %self.worker_id,
                            master_id = %self.master_id,
                            timeout = ?self.cfg.worker_timeout,
                            "no pong from master, worker exiting"
                        );
                        self.close_worker(&mut worker, &worker_token).await;
                        return Err(EngineError::HeartbeatTimeout(self.cfg.worker_timeout));
                    }
                    self.fabric.publish(
                        &heartbeat_ping_topic(&self.master_id),
                        Message::HeartbeatPing(HeartbeatPing {
                            send_time: self.start.elapsed(),
                            from_worker_id: self.worker_id.clone(),
                            epoch: self.epoch,
                        }),
                    );
                }

                pong = pongs.recv() => {
                    match pong {
                        Ok(Message::HeartbeatPong(pong)) => {
                            match self.handle_pong(&mut worker, pong).await {
                                Ok(true) => last_pong = Instant::now(),
                                Ok(false) => {}
                                Err(e) => {
                                    tracing::error!(
                                        worker_id = %self.worker_id,
                                        error = %e,
                                        "master failover handling failed"
                                    );
                                    self.close_worker(&mut worker, &worker_token).await;
                                    return Err(e);
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(worker_id = %self.worker_id, skipped = n, "pong stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            // No publisher left; the pong timeout will fire.
                        }
                    }
                }

                _ = ticks.tick() => {
                    if let Some(status) = terminal.clone() {
                        // Terminal status was observed last tick; exit now.
                        return self.exit(&mut worker, &worker_token, status).await;
                    }
                    match AssertUnwindSafe(worker.tick()).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            // Transient tick failure; the worker surfaces
                            // real faults through its status.
                            tracing::warn!(worker_id = %self.worker_id, error = %e, "tick failed");
                        }
                        Err(_) => {
                            tracing::error!(worker_id = %self.worker_id, "tick panicked");
                            terminal = Some(WorkerStatus::with_error("worker tick panicked"));
                            continue;
                        }
                    }
                    let status = worker.status();
                    if status.is_terminal() {
                        terminal = Some(status.clone());
                    }
                    // A rate-limited tick skips the report and returns
                    // without error.
                    if self.limiter.allow() {
                        self.report_status(&status, worker.workload()).await;
                    }
                }
            }
        }
    }

    /// Returns whether the pong counts as liveness proof for the current
    /// epoch.
    async fn handle_pong(
        &mut self,
        worker: &mut Box<dyn WorkerImpl>,
        pong: HeartbeatPong,
    ) -> Result<bool> {
        if pong.epoch < self.epoch {
            tracing::debug!(
                worker_id = %self.worker_id,
                pong_epoch = pong.epoch,
                epoch = self.epoch,
                "discarding pong from stale master"
            );
            return Ok(false);
        }
        if pong.epoch > self.epoch {
            tracing::info!(
                worker_id = %self.worker_id,
                old_epoch = self.epoch,
                new_epoch = pong.epoch,
                "master failed over, re-handshaking"
            );
            worker
                .on_master_failover(MasterFailoverReason::timed_out())
                .await?;
            self.epoch = pong.epoch;
        }
        Ok(true)
    }

    /// Publish a final status update (bypassing the limiter), close the
    /// worker and end the loop.
    async fn exit(
        &mut self,
        worker: &mut Box<dyn WorkerImpl>,
        worker_token: &CancellationToken,
        status: WorkerStatus,
    ) -> Result<WorkerStatus> {
        tracing::info!(
            worker_id = %self.worker_id,
            status = %status.code,
            "worker exiting"
        );
        self.report_status(&status, worker.workload()).await;
        self.close_worker(worker, worker_token).await;
        Ok(status)
    }

    async fn close_worker(
        &self,
        worker: &mut Box<dyn WorkerImpl>,
        worker_token: &CancellationToken,
    ) {
        worker_token.cancel();
        if let Err(e) = worker.close_impl().await {
            tracing::warn!(worker_id = %self.worker_id, error = %e, "close failed");
        }
    }

    /// Publish the status update and workload report, and persist the
    /// status mirror. Mirror write failures are logged and retried at the
    /// next report.
    async fn report_status(&self, status: &WorkerStatus, workload: crate::model::RescUnit) {
        self.fabric.publish(
            &status_update_topic(&self.master_id),
            Message::StatusUpdate(StatusUpdate {
                worker_id: self.worker_id.clone(),
                status: status.clone(),
            }),
        );
        self.fabric.publish(
            &workload_report_topic(&self.master_id),
            Message::WorkloadReport(WorkloadReport {
                worker_id: self.worker_id.clone(),
                resc_unit: workload,
            }),
        );

        let key = self
            .cfg
            .worker_status_key(&self.master_id, &self.worker_id);
        let value = match serde_json::to_vec(status) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "status serialization failed");
                return;
            }
        };
        let write = self.meta.put(&key, value);
        match tokio::time::timeout(self.cfg.meta_op_timeout, write).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "status mirror write failed");
            }
            Err(_) => {
                tracing::warn!(worker_id = %self.worker_id, "status mirror write timed out");
            }
        }
    }
}
