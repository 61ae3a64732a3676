//! A worker that relays records from a source stage to a sink stage.
//!
//! This is the reference shape for data-moving workers: two independently
//! cancellable stages share a bounded channel, backpressure comes from the
//! channel filling up, and both stages stop through the worker's
//! cancellation token. The tick loop only observes; the stages run on
//! their own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::model::{MasterFailoverReason, RescUnit, WorkerStatus, WorkerStatusCode};
use crate::worker::WorkerImpl;

/// Capacity of the queue between the producer and consumer stages.
pub const RELAY_BUFFER: usize = 1024;

/// Upstream of a relay. `None` signals end of input.
#[async_trait]
pub trait RecordSource: Send {
    async fn next(&mut self) -> Result<Option<String>>;
}

/// Downstream of a relay.
#[async_trait]
pub trait RecordSink: Send {
    async fn write(&mut self, record: String) -> Result<()>;
}

/// Source that replays a fixed list of records. Built from [`RelayConfig`].
pub struct VecSource {
    records: std::collections::VecDeque<String>,
}

impl VecSource {
    pub fn new(records: Vec<String>) -> Self {
        Self {
            records: records.into(),
        }
    }
}

#[async_trait]
impl RecordSource for VecSource {
    async fn next(&mut self) -> Result<Option<String>> {
        Ok(self.records.pop_front())
    }
}

/// Sink that collects records into shared memory, for tests and demos.
#[derive(Clone, Default)]
pub struct CollectSink {
    pub records: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RecordSink for CollectSink {
    async fn write(&mut self, record: String) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    pub records: Vec<String>,
}

/// Shared view of the relay's progress, written by the stages and read by
/// the tick loop. Status and error sit behind separate locks so the tick
/// loop's reads never contend with the other field's writer.
#[derive(Clone, Default)]
struct StageState {
    status_code: Arc<RwLock<Option<WorkerStatusCode>>>,
    run_error: Arc<RwLock<Option<String>>>,
    relayed: Arc<AtomicU64>,
}

impl StageState {
    fn code(&self) -> Option<WorkerStatusCode> {
        *self.status_code.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_code(&self, code: WorkerStatusCode) {
        let mut guard = self.status_code.write().unwrap_or_else(|e| e.into_inner());
        // Error is never downgraded: if both stages report in the same
        // window, Error dominates Finished.
        if *guard == Some(WorkerStatusCode::Error) && code != WorkerStatusCode::Error {
            return;
        }
        *guard = Some(code);
    }

    fn error(&self) -> Option<String> {
        self.run_error
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_error(&self, message: String) {
        let mut guard = self.run_error.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(message);
    }
}

pub struct RelayWorker {
    source: Option<Box<dyn RecordSource>>,
    sink: Option<Box<dyn RecordSink>>,
    state: StageState,
    cancel: Option<CancellationToken>,
}

impl RelayWorker {
    pub fn new(source: Box<dyn RecordSource>, sink: Box<dyn RecordSink>) -> Self {
        Self {
            source: Some(source),
            sink: Some(sink),
            state: StageState::default(),
            cancel: None,
        }
    }

    pub fn from_config(config: RelayConfig) -> Self {
        Self::new(
            Box::new(VecSource::new(config.records)),
            Box::new(CollectSink::default()),
        )
    }

    pub fn relayed(&self) -> u64 {
        self.state.relayed.load(Ordering::Relaxed)
    }

    async fn produce(
        mut source: Box<dyn RecordSource>,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let record = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                record = source.next() => record?,
            };
            let Some(record) = record else {
                // End of input; dropping the sender closes the queue.
                return Ok(());
            };
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                sent = tx.send(record) => {
                    if sent.is_err() {
                        // Consumer is gone; it owns the error reporting.
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns `true` when the whole input was drained, `false` when the
    /// stage was cancelled mid-stream.
    async fn consume(
        mut sink: Box<dyn RecordSink>,
        mut rx: mpsc::Receiver<String>,
        cancel: CancellationToken,
        relayed: Arc<AtomicU64>,
    ) -> Result<bool> {
        loop {
            let record = tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                record = rx.recv() => record,
            };
            let Some(record) = record else {
                return Ok(true);
            };
            sink.write(record).await?;
            relayed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl WorkerImpl for RelayWorker {
    async fn init_impl(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let source = self
            .source
            .take()
            .ok_or_else(|| EngineError::Internal("relay worker initialized twice".to_string()))?;
        let sink = self
            .sink
            .take()
            .ok_or_else(|| EngineError::Internal("relay worker initialized twice".to_string()))?;

        self.state.set_code(WorkerStatusCode::Normal);
        let cancel = shutdown.child_token();
        self.cancel = Some(cancel.clone());

        let (tx, rx) = mpsc::channel(RELAY_BUFFER);

        let state = self.state.clone();
        let producer_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::produce(source, tx, producer_cancel.clone()).await {
                tracing::error!(error = %e, "relay source failed");
                state.set_error(e.to_string());
                state.set_code(WorkerStatusCode::Error);
                // Stop the consumer too; the run error is already recorded.
                producer_cancel.cancel();
            }
        });

        let state = self.state.clone();
        let relayed = self.state.relayed.clone();
        tokio::spawn(async move {
            match Self::consume(sink, rx, cancel.clone(), relayed).await {
                Ok(true) => state.set_code(WorkerStatusCode::Finished),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(error = %e, "relay sink failed");
                    state.set_error(e.to_string());
                    state.set_code(WorkerStatusCode::Error);
                    cancel.cancel();
                }
            }
        });

        Ok(())
    }

    async fn tick(&mut self) -> Result<()> {
        // The stages drive themselves; ticks only trigger status reports.
        Ok(())
    }

    fn status(&self) -> WorkerStatus {
        let code = self.state.code().unwrap_or(WorkerStatusCode::Created);
        WorkerStatus {
            code,
            error_message: self.state.error().unwrap_or_default(),
            ext_bytes: self.relayed().to_string().into_bytes(),
        }
    }

    fn workload(&self) -> RescUnit {
        1
    }

    async fn on_master_failover(&mut self, reason: MasterFailoverReason) -> Result<()> {
        tracing::info!(reason = ?reason.code, "relay worker observed master failover");
        Ok(())
    }

    async fn close_impl(&mut self) -> Result<()> {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        Ok(())
    }
}
