//! Worker type registry: job type to constructor.
//!
//! The registry is assembled during process initialization, before any
//! worker runs, and never mutated afterwards; executors share it behind an
//! `Arc`.

use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::model::{JobType, MasterId, WorkerId};
use crate::worker::fake::{FakeConfig, FakeWorker};
use crate::worker::relay::{RelayConfig, RelayWorker};
use crate::worker::WorkerImpl;

/// Everything a constructor gets to know about the worker it builds.
pub struct WorkerContext {
    pub worker_id: WorkerId,
    pub master_id: MasterId,
    /// Job-type-specific configuration, as carried in the `MasterMeta`.
    pub config: Vec<u8>,
}

pub type WorkerFactory = Box<dyn Fn(WorkerContext) -> Result<Box<dyn WorkerImpl>> + Send + Sync>;

#[derive(Default)]
pub struct WorkerRegistry {
    factories: HashMap<JobType, WorkerFactory>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `job_type`. Registering the same type
    /// twice is a wiring bug and is rejected.
    pub fn register(&mut self, job_type: JobType, factory: WorkerFactory) -> Result<()> {
        if self.factories.contains_key(&job_type) {
            return Err(EngineError::Internal(format!(
                "worker type {job_type} registered twice"
            )));
        }
        self.factories.insert(job_type, factory);
        Ok(())
    }

    /// Build a worker for `job_type` from `ctx`.
    pub fn build(&self, job_type: JobType, ctx: WorkerContext) -> Result<Box<dyn WorkerImpl>> {
        let factory = self.factories.get(&job_type).ok_or_else(|| {
            EngineError::BuildJobFailed(format!("no worker registered for job type {job_type}"))
        })?;
        factory(ctx)
    }
}

/// Registry with the built-in worker types.
pub fn default_registry() -> Result<WorkerRegistry> {
    let mut registry = WorkerRegistry::new();
    registry.register(
        JobType::Fake,
        Box::new(|ctx| {
            let config: FakeConfig = decode_config(&ctx.config)?;
            Ok(Box::new(FakeWorker::new(ctx.worker_id, config)) as Box<dyn WorkerImpl>)
        }),
    )?;
    registry.register(
        JobType::Relay,
        Box::new(|ctx| {
            let config: RelayConfig = decode_config(&ctx.config)?;
            Ok(Box::new(RelayWorker::from_config(config)) as Box<dyn WorkerImpl>)
        }),
    )?;
    Ok(registry)
}

fn decode_config<T: serde::de::DeserializeOwned + Default>(raw: &[u8]) -> Result<T> {
    if raw.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(raw)
        .map_err(|e| EngineError::BuildJobFailed(format!("bad worker config: {e}")))
}
