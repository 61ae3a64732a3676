//! Executor process: builds workers out of creation requests and runs
//! them, and hosts the cooperative task runtime for executor-local work.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::fabric::{status_update_topic, Fabric, Message, StatusUpdate};
use crate::master::CreateWorkerRequest;
use crate::meta::MetaClient;
use crate::model::{ExecutorId, WorkerStatus};
use crate::runtime::{CooperativeTask, Runtime, TaskHandle};
use crate::worker::{BaseWorker, WorkerContext, WorkerRegistry};

pub struct Executor {
    id: ExecutorId,
    registry: Arc<WorkerRegistry>,
    fabric: Arc<Fabric>,
    meta: Arc<dyn MetaClient>,
    cfg: EngineConfig,
    runtime: Arc<Runtime>,
    inbox: mpsc::Receiver<CreateWorkerRequest>,
}

impl Executor {
    pub fn new(
        id: impl Into<ExecutorId>,
        registry: Arc<WorkerRegistry>,
        fabric: Arc<Fabric>,
        meta: Arc<dyn MetaClient>,
        cfg: EngineConfig,
        inbox: mpsc::Receiver<CreateWorkerRequest>,
    ) -> Self {
        Self {
            id: id.into(),
            registry,
            fabric,
            meta,
            cfg,
            runtime: Arc::new(Runtime::new()),
            inbox,
        }
    }

    /// Submit an executor-local cooperative task to this executor's
    /// runtime.
    pub fn submit_task(&self, task: Box<dyn CooperativeTask>) -> TaskHandle {
        self.runtime.submit(task)
    }

    /// Serve worker-creation requests until `shutdown` fires. Cancelling
    /// stops the runtime and every hosted worker.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(executor_id = %self.id, "executor started");
        let runtime = self.runtime.clone();
        let runtime_token = shutdown.child_token();
        tokio::spawn(async move { runtime.run(runtime_token).await });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(executor_id = %self.id, "executor stopping");
                    return;
                }
                request = self.inbox.recv() => {
                    match request {
                        Some(request) => self.spawn_worker(request, &shutdown),
                        None => {
                            tracing::warn!(executor_id = %self.id, "submission channel closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    fn spawn_worker(&self, request: CreateWorkerRequest, shutdown: &CancellationToken) {
        tracing::info!(
            executor_id = %self.id,
            worker_id = %request.worker_id,
            job_type = %request.job_type,
            "creating worker"
        );
        let worker = match self.registry.build(
            request.job_type,
            WorkerContext {
                worker_id: request.worker_id.clone(),
                master_id: request.master_id.clone(),
                config: request.config.clone(),
            },
        ) {
            Ok(worker) => worker,
            Err(e) => {
                tracing::error!(
                    executor_id = %self.id,
                    worker_id = %request.worker_id,
                    error = %e,
                    code = e.rfc_code(),
                    "worker construction failed"
                );
                // Report a terminal error so the master cleans the job up
                // instead of waiting out the heartbeat timeout.
                self.fabric.publish(
                    &status_update_topic(&request.master_id),
                    Message::StatusUpdate(StatusUpdate {
                        worker_id: request.worker_id,
                        status: WorkerStatus::with_error(e.to_string()),
                    }),
                );
                return;
            }
        };

        let base = BaseWorker::new(
            request.worker_id.clone(),
            request.master_id,
            request.epoch,
            self.fabric.clone(),
            self.meta.clone(),
            self.cfg.clone(),
            shutdown.child_token(),
        );
        let worker_id = request.worker_id;
        tokio::spawn(async move {
            match base.run(worker).await {
                Ok(status) => {
                    tracing::info!(worker_id = %worker_id, status = %status.code, "worker done");
                }
                Err(e) => {
                    tracing::error!(worker_id = %worker_id, error = %e, "worker failed");
                }
            }
        });
    }
}
