use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use jobflow::config::EngineConfig;
use jobflow::executor::Executor;
use jobflow::master::{ExecutorPool, JobManager, JobStatus};
use jobflow::meta::memory::MemMetaClient;
use jobflow::meta::MetaClient;
use jobflow::model::JobType;
use jobflow::fabric::Fabric;
use jobflow::shutdown::install_shutdown_handler;
use jobflow::worker::fake::FakeConfig;
use jobflow::worker::registry::default_registry;

#[derive(Parser, Debug)]
#[command(name = "jobflow")]
#[command(about = "Single-process jobflow engine: server-master plus executors")]
struct Args {
    /// Number of in-process executors to start
    #[arg(long, default_value = "2")]
    executors: usize,

    /// Number of fake jobs to submit
    #[arg(long, default_value = "2")]
    jobs: usize,

    /// Ticks each fake job runs before finishing
    #[arg(long, default_value = "50")]
    job_ticks: u64,

    /// How long to run before shutting down, in seconds
    #[arg(long, default_value = "30")]
    run_for: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let cfg = EngineConfig::default();
    let fabric = Arc::new(Fabric::new());
    let meta: Arc<dyn MetaClient> = Arc::new(MemMetaClient::default());
    let registry = Arc::new(default_registry()?);
    let pool = Arc::new(ExecutorPool::new("job-manager"));

    let shutdown = install_shutdown_handler()?;

    for i in 0..args.executors {
        let executor_id = format!("executor-{i}");
        let inbox = pool.register_executor(&executor_id)?;
        let executor = Executor::new(
            executor_id,
            registry.clone(),
            fabric.clone(),
            meta.clone(),
            cfg.clone(),
            inbox,
        );
        let token = shutdown.clone();
        tokio::spawn(async move { executor.run(token).await });
    }

    let manager = JobManager::bootstrap(
        "job-manager",
        cfg.clone(),
        meta.clone(),
        fabric.clone(),
        pool.clone(),
    )
    .await?;
    let handle = manager.handle();
    let manager_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = manager.run(manager_token).await {
            tracing::error!(error = %e, "job manager failed");
        }
    });

    for _ in 0..args.jobs {
        let config = serde_json::to_vec(&FakeConfig {
            finish_after_ticks: Some(args.job_ticks),
        })?;
        let job_id = handle.submit_job(JobType::Fake, config).await?;
        tracing::info!(job_id = %job_id, "submitted fake job");
    }

    let deadline = tokio::time::sleep(Duration::from_secs(args.run_for));
    tokio::pin!(deadline);
    let mut report = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = &mut deadline => {
                tracing::info!("run window elapsed, shutting down");
                shutdown.cancel();
                break;
            }
            _ = report.tick() => {
                tracing::info!(
                    pending = handle.job_count(JobStatus::Pending).await,
                    dispatched = handle.job_count(JobStatus::Dispatched).await,
                    online = handle.job_count(JobStatus::Online).await,
                    "job counts"
                );
            }
        }
    }

    // Give workers a moment to observe cancellation and close.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
