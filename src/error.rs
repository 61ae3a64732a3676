use thiserror::Error;

/// Engine-wide error type.
///
/// Every variant carries an operator-facing RFC code, retrievable through
/// [`EngineError::rfc_code`], so a failure surfaced in a log line or an API
/// response can be looked up without parsing the message text.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("cannot find executor {0}")]
    UnknownExecutor(String),

    #[error("executor {0} has been dead")]
    TombstoneExecutor(String),

    #[error("executor {0} has already been registered")]
    ExecutorDupRegister(String),

    #[error("executor {executor} failed to accept job {job}")]
    SubJobFailed { executor: String, job: String },

    #[error("cluster resource is not enough, please scale out the cluster")]
    ClusterResourceNotEnough,

    #[error("build job failed: {0}")]
    BuildJobFailed(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("job {0} already exists")]
    DuplicateJob(String),

    #[error("meta operation failed: {0}")]
    MetaOpFail(String),

    #[error("meta entry not found: {0}")]
    MetaEntryNotFound(String),

    #[error("no heartbeat response within {0:?}, master considered unreachable")]
    HeartbeatTimeout(std::time::Duration),

    #[error("worker initialization failed: {0}")]
    WorkerInitFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable code for operator lookup. Codes never change once released.
    pub fn rfc_code(&self) -> &'static str {
        match self {
            EngineError::UnknownExecutor(_) => "JFLOW:ErrUnknownExecutorID",
            EngineError::TombstoneExecutor(_) => "JFLOW:ErrTombstoneExecutor",
            EngineError::ExecutorDupRegister(_) => "JFLOW:ErrExecutorDupRegister",
            EngineError::SubJobFailed { .. } => "JFLOW:ErrSubJobFailed",
            EngineError::ClusterResourceNotEnough => "JFLOW:ErrClusterResourceNotEnough",
            EngineError::BuildJobFailed(_) => "JFLOW:ErrBuildJobFailed",
            EngineError::WorkerNotFound(_) => "JFLOW:ErrWorkerNotFound",
            EngineError::DuplicateJob(_) => "JFLOW:ErrDuplicateJob",
            EngineError::MetaOpFail(_) => "JFLOW:ErrMetaOpFail",
            EngineError::MetaEntryNotFound(_) => "JFLOW:ErrMetaEntryNotFound",
            EngineError::HeartbeatTimeout(_) => "JFLOW:ErrHeartbeat",
            EngineError::WorkerInitFailed(_) => "JFLOW:ErrWorkerInitFailed",
            EngineError::Internal(_) => "JFLOW:ErrInternal",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
