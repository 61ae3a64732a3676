//! Identifiers and durable descriptors shared by the server-master,
//! executors and workers.

use serde::{Deserialize, Serialize};

pub type MasterId = String;
pub type WorkerId = String;
pub type ExecutorId = String;

/// Monotonically increasing integer identifying a server-master
/// incarnation. Both sides of the heartbeat protocol use it to reject
/// stale messages from a prior master.
pub type Epoch = i64;

/// Abstract resource units a worker occupies on its executor.
pub type RescUnit = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    Fake,
    Relay,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Fake => write!(f, "fake"),
            JobType::Relay => write!(f, "relay"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterStatusCode {
    Uninit,
    Init,
    Finished,
}

/// Durable descriptor of a job, persisted as JSON under
/// `<master_info_prefix>/<master_id>`.
///
/// Mutated only by the owning server-master, and only after that master has
/// claimed leadership and bumped `epoch`. Destroyed on explicit deletion
/// when the job finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterMeta {
    pub id: MasterId,
    pub job_type: JobType,
    /// Executor currently hosting the job's worker; empty until the first
    /// dispatch.
    pub node_id: ExecutorId,
    pub addr: String,
    pub epoch: Epoch,
    /// Set once the job has come online for the first time. Failover
    /// recovery uses it to tell mid-flight jobs from never-dispatched ones.
    pub initialized: bool,
    /// Opaque, job-type-specific configuration.
    #[serde(default)]
    pub config: Vec<u8>,
    pub status_code: MasterStatusCode,
}

impl MasterMeta {
    pub fn new(id: MasterId, job_type: JobType, epoch: Epoch, config: Vec<u8>) -> Self {
        Self {
            id,
            job_type,
            node_id: String::new(),
            addr: String::new(),
            epoch,
            initialized: false,
            config,
            status_code: MasterStatusCode::Uninit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatusCode {
    Created,
    Init,
    Normal,
    Error,
    Finished,
}

impl std::fmt::Display for WorkerStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatusCode::Created => write!(f, "created"),
            WorkerStatusCode::Init => write!(f, "init"),
            WorkerStatusCode::Normal => write!(f, "normal"),
            WorkerStatusCode::Error => write!(f, "error"),
            WorkerStatusCode::Finished => write!(f, "finished"),
        }
    }
}

/// Point-in-time status a worker reports to its master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub code: WorkerStatusCode,
    #[serde(default)]
    pub error_message: String,
    /// Job-specific progress payload, opaque to the framework.
    #[serde(default)]
    pub ext_bytes: Vec<u8>,
}

impl WorkerStatus {
    pub fn new(code: WorkerStatusCode) -> Self {
        Self {
            code,
            error_message: String::new(),
            ext_bytes: Vec::new(),
        }
    }

    pub fn with_error(message: impl Into<String>) -> Self {
        Self {
            code: WorkerStatusCode::Error,
            error_message: message.into(),
            ext_bytes: Vec::new(),
        }
    }

    /// Whether this status ends the worker's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.code,
            WorkerStatusCode::Error | WorkerStatusCode::Finished
        )
    }
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self::new(WorkerStatusCode::Created)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterFailoverReasonCode {
    MasterTimedOut,
    MasterReportedError,
}

/// Why a worker is being told its master changed.
#[derive(Debug, Clone)]
pub struct MasterFailoverReason {
    pub code: MasterFailoverReasonCode,
    pub error_message: String,
}

impl MasterFailoverReason {
    pub fn timed_out() -> Self {
        Self {
            code: MasterFailoverReasonCode::MasterTimedOut,
            error_message: String::new(),
        }
    }
}
