//! Job finite-state machine on the server-master.
//!
//! Every live job sits in exactly one of three maps, keyed by master id:
//!
//! | from     | event                               | to       |
//! |----------|-------------------------------------|----------|
//! | (new)    | `submit_job`                        | pending  |
//! | pending  | `iter_pending_jobs`, dispatch ok    | wait_ack |
//! | wait_ack | `job_online` (first heartbeat)      | online   |
//! | wait_ack | `job_dispatch_failed`               | pending  |
//! | online   | `job_offline(need_failover = true)` | pending  |
//! | online   | `job_offline(need_failover = false)`| finished |
//! | wait_ack | `job_offline(need_failover = true)` | pending  |
//! | wait_ack | `job_offline(need_failover = false)`| finished |
//!
//! Transitions are the only way a job moves between maps, so the maps are
//! a disjoint partition of all live jobs at every instant. The FSM holds
//! no lock itself; callers wrap it in one read-write lock and the methods
//! never perform I/O, so nothing blocks under that lock.

use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::model::{
    ExecutorId, MasterId, MasterMeta, MasterStatusCode, WorkerId, WorkerStatus,
};

/// Externally visible phase of a job, one per FSM map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    /// Dispatched to an executor, first heartbeat not yet seen.
    Dispatched,
    Online,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Dispatched => write!(f, "dispatched"),
            JobStatus::Online => write!(f, "online"),
        }
    }
}

/// The master's view of the live worker running a job.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub worker_id: WorkerId,
    pub last_status: Option<WorkerStatus>,
}

/// In-memory FSM entry.
#[derive(Debug, Clone)]
pub struct JobHolder {
    pub meta: MasterMeta,
    pub worker: Option<WorkerHandle>,
    /// Set when the job was loaded from the metastore during server-master
    /// failover rather than added by `submit_job`.
    add_from_failover: bool,
}

/// A job that `iter_pending_jobs`/`iter_wait_ack_jobs` moved under a new
/// worker id. The caller re-keys the persisted meta after releasing the
/// FSM lock.
#[derive(Debug, Clone)]
pub struct DispatchedJob {
    pub old_id: MasterId,
    pub meta: MasterMeta,
}

/// Query result for a single job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub status: JobStatus,
    pub meta: MasterMeta,
    pub worker: Option<WorkerHandle>,
}

#[derive(Default)]
pub struct JobFsm {
    pending: HashMap<MasterId, MasterMeta>,
    wait_ack: HashMap<MasterId, JobHolder>,
    online: HashMap<MasterId, JobHolder>,
}

impl JobFsm {
    pub fn new() -> Self {
        Self::default()
    }

    fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
            || self.wait_ack.contains_key(id)
            || self.online.contains_key(id)
    }

    /// Add a freshly submitted job to `pending`.
    pub fn submit_job(&mut self, meta: MasterMeta) -> Result<()> {
        if self.contains(&meta.id) {
            return Err(EngineError::DuplicateJob(meta.id));
        }
        tracing::info!(job_id = %meta.id, job_type = %meta.job_type, "job submitted");
        self.pending.insert(meta.id.clone(), meta);
        Ok(())
    }

    /// Place a job directly in `wait_ack`; used when recovering jobs that
    /// were already dispatched before a server-master failover.
    pub fn job_dispatched(&mut self, meta: MasterMeta, add_from_failover: bool) {
        self.wait_ack.insert(
            meta.id.clone(),
            JobHolder {
                meta,
                worker: None,
                add_from_failover,
            },
        );
    }

    /// Dispatch every pending job through `dispatch`. A successful dispatch
    /// moves the job to `wait_ack` under the returned worker id; a failed
    /// one leaves it (and the rest of the iteration) in `pending` for the
    /// next tick.
    ///
    /// `dispatch` must not block: it runs under the caller's write lock.
    pub fn iter_pending_jobs<F>(&mut self, mut dispatch: F) -> Result<Vec<DispatchedJob>>
    where
        F: FnMut(&MasterMeta) -> Result<(WorkerId, ExecutorId)>,
    {
        let mut moved = Vec::new();
        let old_ids: Vec<MasterId> = self.pending.keys().cloned().collect();
        for old_id in old_ids {
            let Some(mut meta) = self.pending.remove(&old_id) else {
                continue;
            };
            match dispatch(&meta) {
                Ok((worker_id, executor_id)) => {
                    meta.id = worker_id.clone();
                    meta.node_id = executor_id;
                    tracing::info!(
                        job_id = %old_id,
                        worker_id = %worker_id,
                        executor_id = %meta.node_id,
                        "job dispatched"
                    );
                    moved.push(DispatchedJob {
                        old_id,
                        meta: meta.clone(),
                    });
                    self.wait_ack.insert(
                        worker_id,
                        JobHolder {
                            meta,
                            worker: None,
                            add_from_failover: false,
                        },
                    );
                }
                Err(e) => {
                    self.pending.insert(old_id, meta);
                    return Err(e);
                }
            }
        }
        Ok(moved)
    }

    /// Review `wait_ack` entries recovered from failover. If the executor
    /// that previously hosted the job is still alive, keep waiting for its
    /// heartbeat; otherwise re-dispatch. The failover mark is cleared as
    /// soon as either decision is made, so a job is never re-dispatched
    /// twice.
    pub fn iter_wait_ack_jobs<A, F>(
        &mut self,
        mut previous_alive: A,
        mut dispatch: F,
    ) -> Result<Vec<DispatchedJob>>
    where
        A: FnMut(&MasterMeta) -> bool,
        F: FnMut(&MasterMeta) -> Result<(WorkerId, ExecutorId)>,
    {
        let mut moved = Vec::new();
        let flagged: Vec<MasterId> = self
            .wait_ack
            .iter()
            .filter(|(_, holder)| holder.add_from_failover)
            .map(|(id, _)| id.clone())
            .collect();
        for old_id in flagged {
            if let Some(holder) = self.wait_ack.get_mut(&old_id) {
                if previous_alive(&holder.meta) {
                    holder.add_from_failover = false;
                    tracing::info!(
                        job_id = %old_id,
                        executor_id = %holder.meta.node_id,
                        "previous executor alive, waiting for heartbeat"
                    );
                    continue;
                }
            }
            let Some(mut holder) = self.wait_ack.remove(&old_id) else {
                continue;
            };
            match dispatch(&holder.meta) {
                Ok((worker_id, executor_id)) => {
                    holder.meta.id = worker_id.clone();
                    holder.meta.node_id = executor_id;
                    holder.add_from_failover = false;
                    tracing::info!(
                        job_id = %old_id,
                        worker_id = %worker_id,
                        "job did not survive failover, re-created"
                    );
                    moved.push(DispatchedJob {
                        old_id,
                        meta: holder.meta.clone(),
                    });
                    self.wait_ack.insert(worker_id, holder);
                }
                Err(e) => {
                    self.wait_ack.insert(old_id, holder);
                    return Err(e);
                }
            }
        }
        Ok(moved)
    }

    /// First heartbeat from a dispatched worker: `wait_ack` to `online`.
    /// Marks the meta initialized and returns a copy for persistence.
    pub fn job_online(&mut self, worker_id: &str, handle: WorkerHandle) -> Result<MasterMeta> {
        let Some(mut holder) = self.wait_ack.remove(worker_id) else {
            return Err(EngineError::WorkerNotFound(worker_id.to_string()));
        };
        holder.meta.initialized = true;
        holder.meta.status_code = MasterStatusCode::Init;
        holder.worker = Some(handle);
        holder.add_from_failover = false;
        let meta = holder.meta.clone();
        self.online.insert(worker_id.to_string(), holder);
        tracing::info!(worker_id, "job online");
        Ok(meta)
    }

    /// Drop a pending job whose submission could not be persisted.
    pub fn cancel_pending(&mut self, id: &str) -> Option<MasterMeta> {
        self.pending.remove(id)
    }

    /// Dispatch was acknowledged as failed: `wait_ack` back to `pending`.
    pub fn job_dispatch_failed(&mut self, worker_id: &str) -> Result<()> {
        let Some(holder) = self.wait_ack.remove(worker_id) else {
            return Err(EngineError::WorkerNotFound(worker_id.to_string()));
        };
        self.pending.insert(holder.meta.id.clone(), holder.meta);
        Ok(())
    }

    /// Take a job offline. With `need_failover` it returns to `pending`;
    /// otherwise the job is finished and its meta is handed back so the
    /// caller can delete it from the metastore. An id in neither map is a
    /// late message and is ignored.
    pub fn job_offline(&mut self, worker_id: &str, need_failover: bool) -> Option<MasterMeta> {
        let holder = self
            .online
            .remove(worker_id)
            .or_else(|| self.wait_ack.remove(worker_id));
        let Some(holder) = holder else {
            tracing::warn!(worker_id, "offline event for unknown worker, ignored");
            return None;
        };
        if need_failover {
            tracing::info!(worker_id, "job offline, queued for re-dispatch");
            self.pending.insert(holder.meta.id.clone(), holder.meta);
            None
        } else {
            tracing::info!(worker_id, "job finished");
            Some(holder.meta)
        }
    }

    /// Record the latest status reported by a job's worker.
    pub fn update_worker_status(&mut self, worker_id: &str, status: WorkerStatus) {
        let holder = self
            .online
            .get_mut(worker_id)
            .or_else(|| self.wait_ack.get_mut(worker_id));
        if let Some(holder) = holder {
            match &mut holder.worker {
                Some(worker) => worker.last_status = Some(status),
                None => {
                    holder.worker = Some(WorkerHandle {
                        worker_id: worker_id.to_string(),
                        last_status: Some(status),
                    })
                }
            }
        }
    }

    /// Size of the map backing `status`. Snapshots are not consistent
    /// across calls.
    pub fn job_count(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending.len(),
            JobStatus::Dispatched => self.wait_ack.len(),
            JobStatus::Online => self.online.len(),
        }
    }

    pub fn query_job(&self, id: &str) -> Option<JobInfo> {
        if let Some(meta) = self.pending.get(id) {
            return Some(JobInfo {
                status: JobStatus::Pending,
                meta: meta.clone(),
                worker: None,
            });
        }
        if let Some(holder) = self.wait_ack.get(id) {
            return Some(JobInfo {
                status: JobStatus::Dispatched,
                meta: holder.meta.clone(),
                worker: holder.worker.clone(),
            });
        }
        self.online.get(id).map(|holder| JobInfo {
            status: JobStatus::Online,
            meta: holder.meta.clone(),
            worker: holder.worker.clone(),
        })
    }

    /// Snapshot of every live job. Like `job_count`, not consistent with
    /// any other call.
    pub fn list_jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .pending
            .values()
            .map(|meta| JobInfo {
                status: JobStatus::Pending,
                meta: meta.clone(),
                worker: None,
            })
            .chain(self.wait_ack.values().map(|holder| JobInfo {
                status: JobStatus::Dispatched,
                meta: holder.meta.clone(),
                worker: holder.worker.clone(),
            }))
            .chain(self.online.values().map(|holder| JobInfo {
                status: JobStatus::Online,
                meta: holder.meta.clone(),
                worker: holder.worker.clone(),
            }))
            .collect();
        jobs.sort_by(|a, b| a.meta.id.cmp(&b.meta.id));
        jobs
    }

    /// Whether a recovered job is still waiting for its failover review.
    pub fn is_from_failover(&self, id: &str) -> bool {
        self.wait_ack
            .get(id)
            .map(|holder| holder.add_from_failover)
            .unwrap_or(false)
    }
}
