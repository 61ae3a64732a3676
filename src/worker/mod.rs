//! Worker-side framework.
//!
//! A concrete worker supplies the capability set in [`WorkerImpl`]; the
//! framework ([`base::BaseWorker`]) composes a fixed base around it:
//! one-shot initialization, the tick loop, the heartbeat loop with
//! master-failover handling, rate-limited status reports, and exit.

pub mod base;
pub mod fake;
pub mod limiter;
pub mod registry;
pub mod relay;

pub use base::BaseWorker;
pub use registry::{WorkerContext, WorkerRegistry};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{MasterFailoverReason, RescUnit, WorkerStatus};

/// Behaviour a concrete worker plugs into the framework.
///
/// Variants (fake worker, relay worker, ...) differ only in these six
/// operations.
#[async_trait]
pub trait WorkerImpl: Send {
    /// One-shot initialization; failing once is fatal. Background stages
    /// the worker spawns must be children of `shutdown` so closing the
    /// worker cancels them.
    async fn init_impl(&mut self, shutdown: &CancellationToken) -> Result<()>;

    /// Called on a fixed cadence. Must be idempotent with respect to being
    /// called faster or slower than configured, and must not block longer
    /// than one cadence tick.
    async fn tick(&mut self) -> Result<()>;

    /// Current status snapshot.
    fn status(&self) -> WorkerStatus;

    /// Resource units this worker occupies on its executor.
    fn workload(&self) -> RescUnit;

    /// Called when the supervising master failed over to a new epoch,
    /// before heartbeats resume with that epoch.
    async fn on_master_failover(&mut self, reason: MasterFailoverReason) -> Result<()>;

    /// Release all owned resources. Must be idempotent.
    async fn close_impl(&mut self) -> Result<()>;
}
