use std::time::Duration;

/// Timing and keyspace knobs shared by the server-master, executors and
/// workers.
///
/// Defaults are production values. Tests shrink the durations so a full
/// dispatch / timeout / re-dispatch cycle completes in milliseconds.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between worker heartbeat pings.
    pub worker_heartbeat_interval: Duration,
    /// If no pong matching the current epoch arrives within this window,
    /// the worker concludes the master is unreachable and closes itself.
    pub worker_timeout: Duration,
    /// Extra grace the master grants on top of `worker_timeout` before
    /// declaring a worker dead, so a worker's own exit can race ahead.
    pub worker_timeout_graceful: Duration,
    /// Nominal cadence of worker status reports. Reports ride on ticks;
    /// the status token bucket is what paces them.
    pub worker_report_status_interval: Duration,
    /// Cadence of the framework-driven `tick` calls on a worker.
    pub worker_tick_interval: Duration,
    /// Cadence of the server-master check loop (timeouts, dispatch,
    /// failover retries).
    pub master_check_interval: Duration,
    /// Refill interval of the token bucket pacing tick-driven status
    /// reports.
    pub status_rate_interval: Duration,
    /// Burst size of the status-report token bucket.
    pub status_rate_burst: u32,
    /// Per-call deadline for metastore operations.
    pub meta_op_timeout: Duration,
    /// Key prefix for persisted master metadata.
    pub master_info_prefix: String,
    /// Key prefix for worker status mirrors.
    pub worker_status_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_heartbeat_interval: Duration::from_secs(3),
            worker_timeout: Duration::from_secs(15),
            worker_timeout_graceful: Duration::from_secs(5),
            worker_report_status_interval: Duration::from_secs(3),
            worker_tick_interval: Duration::from_millis(100),
            master_check_interval: Duration::from_secs(1),
            status_rate_interval: Duration::from_secs(1),
            status_rate_burst: 1,
            meta_op_timeout: Duration::from_secs(1),
            master_info_prefix: "/jobflow/master-meta".to_string(),
            worker_status_prefix: "/jobflow/worker-status".to_string(),
        }
    }
}

impl EngineConfig {
    /// Window after which the master declares a silent worker dead.
    pub fn master_timeout(&self) -> Duration {
        self.worker_timeout + self.worker_timeout_graceful
    }

    /// Key under which a job's `MasterMeta` is persisted.
    pub fn master_info_key(&self, master_id: &str) -> String {
        format!("{}/{}", self.master_info_prefix, master_id)
    }

    /// Key under which a worker's status mirror is persisted.
    pub fn worker_status_key(&self, master_id: &str, worker_id: &str) -> String {
        format!("{}/{}/{}", self.worker_status_prefix, master_id, worker_id)
    }
}
