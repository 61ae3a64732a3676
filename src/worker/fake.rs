//! A trivial worker used by tests and the demo binary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::model::{MasterFailoverReason, RescUnit, WorkerId, WorkerStatus, WorkerStatusCode};
use crate::worker::WorkerImpl;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FakeConfig {
    /// Report `Finished` after this many ticks; `None` runs forever.
    pub finish_after_ticks: Option<u64>,
}

pub struct FakeWorker {
    worker_id: WorkerId,
    config: FakeConfig,
    init: bool,
    closed: bool,
    ticks: u64,
    failovers: u64,
}

impl FakeWorker {
    pub fn new(worker_id: WorkerId, config: FakeConfig) -> Self {
        Self {
            worker_id,
            config,
            init: false,
            closed: false,
            ticks: 0,
            failovers: 0,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn failovers(&self) -> u64 {
        self.failovers
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl WorkerImpl for FakeWorker {
    async fn init_impl(&mut self, _shutdown: &CancellationToken) -> Result<()> {
        if self.init {
            return Err(EngineError::Internal("repeated init".to_string()));
        }
        self.init = true;
        Ok(())
    }

    async fn tick(&mut self) -> Result<()> {
        if !self.init {
            return Err(EngineError::Internal("not yet init".to_string()));
        }
        if self.closed {
            return Ok(());
        }
        self.ticks += 1;
        tracing::debug!(worker_id = %self.worker_id, ticks = self.ticks, "fake worker tick");
        Ok(())
    }

    fn status(&self) -> WorkerStatus {
        if !self.init {
            return WorkerStatus::new(WorkerStatusCode::Created);
        }
        let code = match self.config.finish_after_ticks {
            Some(limit) if self.ticks >= limit => WorkerStatusCode::Finished,
            _ => WorkerStatusCode::Normal,
        };
        WorkerStatus {
            code,
            error_message: String::new(),
            ext_bytes: self.ticks.to_string().into_bytes(),
        }
    }

    fn workload(&self) -> RescUnit {
        10
    }

    async fn on_master_failover(&mut self, _reason: MasterFailoverReason) -> Result<()> {
        self.failovers += 1;
        Ok(())
    }

    async fn close_impl(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
