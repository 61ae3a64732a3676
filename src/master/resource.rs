//! Executor registry and the dispatch interface the resource manager
//! provides to the job manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{Epoch, ExecutorId, JobType, MasterId, MasterMeta, WorkerId};

/// Capacity of each executor's submission inbox.
const SUBMISSION_BUFFER: usize = 64;

/// Ask an executor to create and run a worker.
#[derive(Debug, Clone)]
pub struct CreateWorkerRequest {
    pub worker_id: WorkerId,
    /// Master the worker heartbeats to.
    pub master_id: MasterId,
    pub job_type: JobType,
    pub config: Vec<u8>,
    /// Master epoch at dispatch time.
    pub epoch: Epoch,
}

/// Resource-manager-provided dispatch seam.
///
/// `dispatch` places a worker for `meta` somewhere in the fleet and returns
/// its new stable worker id plus the chosen executor. It is called under
/// the FSM write lock and must not block; handing the request to the
/// executor is a non-blocking channel push.
pub trait JobDispatcher: Send + Sync {
    fn dispatch(&self, meta: &MasterMeta) -> Result<(WorkerId, ExecutorId)>;

    /// Whether `executor_id` is currently registered and alive.
    fn is_alive(&self, executor_id: &str) -> bool;
}

struct ExecutorEntry {
    submission: mpsc::Sender<CreateWorkerRequest>,
    tombstone: bool,
}

/// In-process executor fleet: registration, tombstoning, round-robin
/// dispatch.
pub struct ExecutorPool {
    /// Master id stamped into every dispatched request.
    master_id: MasterId,
    executors: RwLock<HashMap<ExecutorId, ExecutorEntry>>,
    cursor: AtomicUsize,
}

impl ExecutorPool {
    pub fn new(master_id: impl Into<MasterId>) -> Self {
        Self {
            master_id: master_id.into(),
            executors: RwLock::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Register an executor and return the inbox its run loop consumes.
    pub fn register_executor(
        &self,
        executor_id: &str,
    ) -> Result<mpsc::Receiver<CreateWorkerRequest>> {
        let mut executors = self.executors.write().unwrap_or_else(|e| e.into_inner());
        if executors.contains_key(executor_id) {
            return Err(EngineError::ExecutorDupRegister(executor_id.to_string()));
        }
        let (tx, rx) = mpsc::channel(SUBMISSION_BUFFER);
        executors.insert(
            executor_id.to_string(),
            ExecutorEntry {
                submission: tx,
                tombstone: false,
            },
        );
        tracing::info!(executor_id, "executor registered");
        Ok(rx)
    }

    /// Mark an executor dead. Its entry stays so a later dispatch attempt
    /// can distinguish "once known, now dead" from "never heard of".
    pub fn tombstone_executor(&self, executor_id: &str) -> Result<()> {
        let mut executors = self.executors.write().unwrap_or_else(|e| e.into_inner());
        match executors.get_mut(executor_id) {
            Some(entry) => {
                entry.tombstone = true;
                tracing::warn!(executor_id, "executor tombstoned");
                Ok(())
            }
            None => Err(EngineError::UnknownExecutor(executor_id.to_string())),
        }
    }

    fn pick(&self) -> Result<(ExecutorId, mpsc::Sender<CreateWorkerRequest>)> {
        let executors = self.executors.read().unwrap_or_else(|e| e.into_inner());
        let mut alive: Vec<_> = executors
            .iter()
            .filter(|(_, entry)| !entry.tombstone)
            .collect();
        if alive.is_empty() {
            return Err(EngineError::ClusterResourceNotEnough);
        }
        alive.sort_by(|(a, _), (b, _)| a.cmp(b));
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % alive.len();
        let (id, entry) = alive[idx];
        Ok((id.clone(), entry.submission.clone()))
    }
}

impl JobDispatcher for ExecutorPool {
    fn dispatch(&self, meta: &MasterMeta) -> Result<(WorkerId, ExecutorId)> {
        let (executor_id, submission) = self.pick()?;
        let worker_id = format!("worker-{}", Uuid::new_v4());
        let request = CreateWorkerRequest {
            worker_id: worker_id.clone(),
            master_id: self.master_id.clone(),
            job_type: meta.job_type,
            config: meta.config.clone(),
            epoch: meta.epoch,
        };
        match submission.try_send(request) {
            Ok(()) => Ok((worker_id, executor_id)),
            Err(mpsc::error::TrySendError::Full(_)) => Err(EngineError::SubJobFailed {
                executor: executor_id,
                job: meta.id.clone(),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // The executor's run loop is gone; stop routing to it.
                if let Ok(mut executors) = self.executors.write() {
                    if let Some(entry) = executors.get_mut(&executor_id) {
                        entry.tombstone = true;
                    }
                }
                Err(EngineError::TombstoneExecutor(executor_id))
            }
        }
    }

    fn is_alive(&self, executor_id: &str) -> bool {
        let executors = self.executors.read().unwrap_or_else(|e| e.into_inner());
        executors
            .get(executor_id)
            .map(|entry| !entry.tombstone && !entry.submission.is_closed())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str) -> MasterMeta {
        MasterMeta::new(id.to_string(), JobType::Fake, 1, Vec::new())
    }

    #[test]
    fn dispatch_without_executors_is_resource_exhaustion() {
        let pool = ExecutorPool::new("jm");
        match pool.dispatch(&meta("j1")) {
            Err(EngineError::ClusterResourceNotEnough) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_round_robins_over_live_executors() {
        let pool = ExecutorPool::new("jm");
        let mut rx1 = pool.register_executor("exec-1").expect("register");
        let mut rx2 = pool.register_executor("exec-2").expect("register");

        let (_, first) = pool.dispatch(&meta("j1")).expect("dispatch");
        let (_, second) = pool.dispatch(&meta("j2")).expect("dispatch");
        assert_ne!(first, second);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[test]
    fn tombstoned_executor_is_skipped() {
        let pool = ExecutorPool::new("jm");
        let _rx1 = pool.register_executor("exec-1").expect("register");
        let _rx2 = pool.register_executor("exec-2").expect("register");
        pool.tombstone_executor("exec-1").expect("tombstone");

        for i in 0..4 {
            let (_, executor) = pool.dispatch(&meta(&format!("j{i}"))).expect("dispatch");
            assert_eq!(executor, "exec-2");
        }
        assert!(!pool.is_alive("exec-1"));
        assert!(pool.is_alive("exec-2"));
    }

    #[test]
    fn unknown_executor_errors() {
        let pool = ExecutorPool::new("jm");
        match pool.tombstone_executor("ghost") {
            Err(EngineError::UnknownExecutor(id)) => assert_eq!(id, "ghost"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn dropped_inbox_tombstones_on_dispatch() {
        let pool = ExecutorPool::new("jm");
        let rx = pool.register_executor("exec-1").expect("register");
        drop(rx);
        match pool.dispatch(&meta("j1")) {
            Err(EngineError::TombstoneExecutor(id)) => assert_eq!(id, "exec-1"),
            other => panic!("unexpected: {other:?}"),
        }
        // Entry survives as a tombstone, not as an unknown executor.
        match pool.dispatch(&meta("j2")) {
            Err(EngineError::ClusterResourceNotEnough) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
