//! Server-master side: job FSM, heartbeat supervision, executor fleet and
//! the job manager tying them together.

pub mod fsm;
pub mod manager;
pub mod resource;
pub mod supervisor;

pub use fsm::{JobFsm, JobInfo, JobStatus, WorkerHandle};
pub use manager::{JobManager, JobManagerHandle};
pub use resource::{CreateWorkerRequest, ExecutorPool, JobDispatcher};
pub use supervisor::HeartbeatSupervisor;
