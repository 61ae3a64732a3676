//! The server-master job manager.
//!
//! Owns the [`JobFsm`] and the [`HeartbeatSupervisor`], consumes the
//! heartbeat and status topics, and runs the periodic check loop that
//! declares timeouts, dispatches pending jobs and reviews failover
//! entries. All metastore writes happen outside the FSM lock: the FSM
//! mutates in-memory maps and hands back the metas to persist.

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fabric::{
    heartbeat_ping_topic, heartbeat_pong_topic, status_update_topic, workload_report_topic,
    Fabric, HeartbeatPing, Message, StatusUpdate, WorkloadReport,
};
use crate::master::fsm::{DispatchedJob, JobFsm, JobInfo, JobStatus, WorkerHandle};
use crate::master::resource::JobDispatcher;
use crate::master::supervisor::HeartbeatSupervisor;
use crate::meta::{MetaClient, Op};
use crate::model::{Epoch, JobType, MasterId, MasterMeta};

pub struct JobManager {
    id: MasterId,
    epoch: Epoch,
    cfg: EngineConfig,
    fsm: Arc<RwLock<JobFsm>>,
    supervisor: HeartbeatSupervisor,
    dispatcher: Arc<dyn JobDispatcher>,
    meta: Arc<dyn MetaClient>,
    fabric: Arc<Fabric>,
}

/// Cloneable query/submit surface of a running manager.
#[derive(Clone)]
pub struct JobManagerHandle {
    id: MasterId,
    epoch: Epoch,
    cfg: EngineConfig,
    fsm: Arc<RwLock<JobFsm>>,
    meta: Arc<dyn MetaClient>,
}

impl JobManager {
    /// Claim leadership and recover persisted jobs.
    ///
    /// Bumps the cluster epoch, re-stamps every persisted meta with it, and
    /// seeds the FSM: jobs that were online before the failover go to
    /// `wait_ack` with the failover mark, jobs that never came online go
    /// back to `pending`. A metastore failure here refuses to start the
    /// manager.
    pub async fn bootstrap(
        id: impl Into<MasterId>,
        cfg: EngineConfig,
        meta: Arc<dyn MetaClient>,
        fabric: Arc<Fabric>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Result<Self> {
        let id = id.into();
        let epoch = meta.gen_epoch().await?;
        tracing::info!(master_id = %id, epoch, "job manager claimed leadership");

        let mut fsm = JobFsm::new();
        let mut supervisor = HeartbeatSupervisor::new(cfg.master_timeout());

        let recovered = meta.get(&cfg.master_info_prefix).await?;
        for kv in recovered.kvs {
            let mut job: MasterMeta = serde_json::from_slice(&kv.value)
                .map_err(|e| EngineError::MetaOpFail(format!("bad master meta: {e}")))?;
            job.epoch = epoch;
            let value = serde_json::to_vec(&job)
                .map_err(|e| EngineError::MetaOpFail(e.to_string()))?;
            meta.put(&cfg.master_info_key(&job.id), value).await?;

            if job.initialized {
                tracing::info!(job_id = %job.id, "recovered dispatched job, awaiting heartbeat");
                supervisor.expect(&job.id);
                fsm.job_dispatched(job, true);
            } else {
                tracing::info!(job_id = %job.id, "recovered undispatched job");
                // Fresh dispatch; duplicate ids cannot occur in a fresh FSM.
                let _ = fsm.submit_job(job);
            }
        }

        Ok(Self {
            id,
            epoch,
            cfg,
            fsm: Arc::new(RwLock::new(fsm)),
            supervisor,
            dispatcher,
            meta,
            fabric,
        })
    }

    pub fn handle(&self) -> JobManagerHandle {
        JobManagerHandle {
            id: self.id.clone(),
            epoch: self.epoch,
            cfg: self.cfg.clone(),
            fsm: self.fsm.clone(),
            meta: self.meta.clone(),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Consume heartbeats and status updates, and run the check loop,
    /// until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut pings = self.fabric.subscribe(&heartbeat_ping_topic(&self.id));
        let mut statuses = self.fabric.subscribe(&status_update_topic(&self.id));
        let mut workloads = self.fabric.subscribe(&workload_report_topic(&self.id));
        let mut check = tokio::time::interval(self.cfg.master_check_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(master_id = %self.id, "job manager stopping");
                    return Ok(());
                }
                _ = check.tick() => {
                    self.on_check_tick().await;
                }
                ping = pings.recv() => {
                    match ping {
                        Ok(Message::HeartbeatPing(ping)) => self.on_ping(ping).await,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "ping stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                }
                status = statuses.recv() => {
                    if let Ok(Message::StatusUpdate(update)) = status {
                        self.on_status_update(update).await;
                    }
                }
                workload = workloads.recv() => {
                    if let Ok(Message::WorkloadReport(report)) = workload {
                        self.on_workload_report(report);
                    }
                }
            }
        }
    }

    /// One pass of the dispatcher loop: timeouts, pending dispatch,
    /// failover review.
    async fn on_check_tick(&mut self) {
        // 1. Declare silent workers dead.
        for worker_id in self.supervisor.timed_out() {
            let need_failover = !self
                .supervisor
                .last_status(&worker_id)
                .map(|s| s.is_terminal())
                .unwrap_or(false);
            tracing::warn!(
                worker_id = %worker_id,
                need_failover,
                "worker heartbeat timed out"
            );
            self.supervisor.remove(&worker_id);
            let finished = self
                .fsm
                .write()
                .await
                .job_offline(&worker_id, need_failover);
            if let Some(meta) = finished {
                self.delete_job_meta(&meta).await;
            }
        }

        // 2. Dispatch pending jobs.
        let dispatcher = self.dispatcher.clone();
        let dispatched = {
            let mut fsm = self.fsm.write().await;
            fsm.iter_pending_jobs(|job| dispatcher.dispatch(job))
        };
        self.after_dispatch(dispatched).await;

        // 3. Review failover entries whose executor is gone.
        let dispatcher = self.dispatcher.clone();
        let alive = self.dispatcher.clone();
        let dispatched = {
            let mut fsm = self.fsm.write().await;
            fsm.iter_wait_ack_jobs(
                |job| alive.is_alive(&job.node_id),
                |job| dispatcher.dispatch(job),
            )
        };
        self.after_dispatch(dispatched).await;
    }

    /// Persist the outcome of a dispatch iteration: each moved job is
    /// re-keyed atomically, and its liveness clock starts now.
    async fn after_dispatch(&mut self, dispatched: Result<Vec<DispatchedJob>>) {
        let jobs = match dispatched {
            Ok(jobs) => jobs,
            Err(e) => {
                // Retried on the next tick; pending jobs stayed pending.
                tracing::warn!(error = %e, code = e.rfc_code(), "dispatch attempt failed");
                return;
            }
        };
        for job in jobs {
            self.supervisor.expect(&job.meta.id);
            let value = match serde_json::to_vec(&job.meta) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(job_id = %job.meta.id, error = %e, "meta serialization failed");
                    continue;
                }
            };
            let ops = vec![
                Op::Delete {
                    key: self.cfg.master_info_key(&job.old_id),
                },
                Op::Put {
                    key: self.cfg.master_info_key(&job.meta.id),
                    value,
                },
            ];
            let txn = self.meta.txn(ops);
            match tokio::time::timeout(self.cfg.meta_op_timeout, txn).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::error!(job_id = %job.meta.id, error = %e, "meta re-key failed");
                }
                Err(_) => {
                    tracing::error!(job_id = %job.meta.id, "meta re-key timed out");
                }
            }
        }
    }

    /// A ping doubles as the online acknowledgement: the first one moves
    /// the job out of `wait_ack`.
    async fn on_ping(&mut self, ping: HeartbeatPing) {
        let pong = self.supervisor.on_ping(&ping, self.epoch);

        let onlined = {
            let mut fsm = self.fsm.write().await;
            fsm.job_online(
                &ping.from_worker_id,
                WorkerHandle {
                    worker_id: ping.from_worker_id.clone(),
                    last_status: None,
                },
            )
            // Already online, or a late ping after deletion; both fine.
            .ok()
        };
        if let Some(meta) = onlined {
            self.persist_job_meta(&meta).await;
        }

        self.fabric
            .publish(&heartbeat_pong_topic(&self.id), Message::HeartbeatPong(pong));
    }

    /// A terminal status update is the worker's exit confirmation: the job
    /// leaves the FSM and its meta is deleted. Error reports are treated
    /// the same as finishes, without failover.
    async fn on_status_update(&mut self, update: StatusUpdate) {
        tracing::debug!(
            worker_id = %update.worker_id,
            status = %update.status.code,
            "status update"
        );
        self.supervisor
            .on_status(&update.worker_id, update.status.clone());

        let terminal = update.status.is_terminal();
        let mut fsm = self.fsm.write().await;
        fsm.update_worker_status(&update.worker_id, update.status);
        if terminal {
            let finished = fsm.job_offline(&update.worker_id, false);
            drop(fsm);
            self.supervisor.remove(&update.worker_id);
            if let Some(meta) = finished {
                self.delete_job_meta(&meta).await;
            }
        }
    }

    fn on_workload_report(&mut self, report: WorkloadReport) {
        self.supervisor
            .on_workload(&report.worker_id, report.resc_unit);
    }

    async fn persist_job_meta(&self, meta: &MasterMeta) {
        let value = match serde_json::to_vec(meta) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(job_id = %meta.id, error = %e, "meta serialization failed");
                return;
            }
        };
        let key = self.cfg.master_info_key(&meta.id);
        let put = self.meta.put(&key, value);
        match tokio::time::timeout(self.cfg.meta_op_timeout, put).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::error!(job_id = %meta.id, error = %e, "meta write failed")
            }
            Err(_) => tracing::error!(job_id = %meta.id, "meta write timed out"),
        }
    }

    async fn delete_job_meta(&self, meta: &MasterMeta) {
        let ops = vec![
            Op::Delete {
                key: self.cfg.master_info_key(&meta.id),
            },
            // The status mirror goes with the job.
            Op::Delete {
                key: self.cfg.worker_status_key(&self.id, &meta.id),
            },
        ];
        let txn = self.meta.txn(ops);
        match tokio::time::timeout(self.cfg.meta_op_timeout, txn).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::error!(job_id = %meta.id, error = %e, "meta delete failed")
            }
            Err(_) => tracing::error!(job_id = %meta.id, "meta delete timed out"),
        }
    }
}

impl JobManagerHandle {
    pub fn master_id(&self) -> &str {
        &self.id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Submit a new job: persist its meta, then enqueue it for dispatch.
    pub async fn submit_job(&self, job_type: JobType, config: Vec<u8>) -> Result<MasterId> {
        let job_id = format!("job-{}", Uuid::new_v4());
        let meta = MasterMeta::new(job_id.clone(), job_type, self.epoch, config);
        self.submit_job_meta(meta).await?;
        Ok(job_id)
    }

    /// Submit a job with a caller-chosen id. Fails with `DuplicateJob`
    /// when the id is already live, leaving both the FSM and the
    /// metastore unchanged.
    pub async fn submit_job_meta(&self, meta: MasterMeta) -> Result<()> {
        let value = serde_json::to_vec(&meta)
            .map_err(|e| EngineError::MetaOpFail(e.to_string()))?;
        let key = self.cfg.master_info_key(&meta.id);
        let job_id = meta.id.clone();

        // Reserving the id first also serializes duplicate submissions.
        self.fsm.write().await.submit_job(meta)?;

        let put = self.meta.put(&key, value);
        let persisted = match tokio::time::timeout(self.cfg.meta_op_timeout, put).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(EngineError::MetaOpFail(format!("put {key} timed out"))),
        };
        if let Err(e) = persisted {
            // The job never becomes eligible for dispatch without its
            // durable meta.
            self.fsm.write().await.cancel_pending(&job_id);
            return Err(e);
        }
        Ok(())
    }

    pub async fn job_count(&self, status: JobStatus) -> usize {
        self.fsm.read().await.job_count(status)
    }

    pub async fn query_job(&self, job_id: &str) -> Option<JobInfo> {
        self.fsm.read().await.query_job(job_id)
    }

    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        self.fsm.read().await.list_jobs()
    }
}
