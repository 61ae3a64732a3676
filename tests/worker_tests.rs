
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use jobflow::error::{EngineError, Result};
use jobflow::fabric::{status_update_topic, Fabric, Message};
use jobflow::meta::memory::MemMetaClient;
use jobflow::meta::MetaClient;
use jobflow::model::{
    MasterFailoverReason, RescUnit, WorkerStatus, WorkerStatusCode,
};
use jobflow::worker::base::BaseWorker;
use jobflow::worker::fake::{FakeConfig, FakeWorker};
use jobflow::worker::relay::{CollectSink, RelayWorker, VecSource};
use jobflow::worker::WorkerImpl;

use test_harness::{fast_config, spawn_pong_responder, MASTER_ID};

struct TestBed {
    fabric: Arc<Fabric>,
    meta: Arc<dyn MetaClient>,
}

impl TestBed {
    fn new() -> Self {
        Self {
            fabric: Arc::new(Fabric::new()),
            meta: Arc::new(MemMetaClient::default()),
        }
    }

    fn base_worker(&self, worker_id: &str, shutdown: CancellationToken) -> BaseWorker {
        BaseWorker::new(
            worker_id.to_string(),
            MASTER_ID.to_string(),
            1,
            self.fabric.clone(),
            self.meta.clone(),
            fast_config(),
            shutdown,
        )
    }
}

/// Worker whose one-shot init always fails.
struct InitFailWorker;

#[async_trait]
impl WorkerImpl for InitFailWorker {
    async fn init_impl(&mut self, _shutdown: &CancellationToken) -> Result<()> {
        Err(EngineError::Internal("broken".to_string()))
    }

    async fn tick(&mut self) -> Result<()> {
        panic!("tick must never run after a failed init");
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus::new(WorkerStatusCode::Created)
    }

    fn workload(&self) -> RescUnit {
        0
    }

    async fn on_master_failover(&mut self, _reason: MasterFailoverReason) -> Result<()> {
        Ok(())
    }

    async fn close_impl(&mut self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn finished_worker_publishes_final_status_and_exits() {
    let bed = TestBed::new();
    let responder = spawn_pong_responder(bed.fabric.clone(), MASTER_ID, 1);
    let mut updates = bed.fabric.subscribe(&status_update_topic(MASTER_ID));

    let worker = FakeWorker::new(
        "w1".to_string(),
        FakeConfig {
            finish_after_ticks: Some(3),
        },
    );
    let base = bed.base_worker("w1", CancellationToken::new());
    let status = tokio::time::timeout(Duration::from_secs(2), base.run(Box::new(worker)))
        .await
        .expect("worker must exit on its own")
        .expect("clean exit");
    assert_eq!(status.code, WorkerStatusCode::Finished);

    // The last published update is the terminal one.
    let mut last = None;
    while let Ok(msg) = updates.try_recv() {
        if let Message::StatusUpdate(update) = msg {
            last = Some(update);
        }
    }
    let last = last.expect("at least one status update");
    assert_eq!(last.worker_id, "w1");
    assert_eq!(last.status.code, WorkerStatusCode::Finished);
    responder.cancel();
}

#[tokio::test]
async fn failed_init_reports_terminal_error() {
    let bed = TestBed::new();
    let mut updates = bed.fabric.subscribe(&status_update_topic(MASTER_ID));

    let base = bed.base_worker("w1", CancellationToken::new());
    let result = base.run(Box::new(InitFailWorker)).await;
    match result {
        Err(EngineError::WorkerInitFailed(_)) => {}
        other => panic!("unexpected: {other:?}"),
    }

    let msg = updates.recv().await.expect("status update");
    match msg {
        Message::StatusUpdate(update) => {
            assert_eq!(update.status.code, WorkerStatusCode::Error);
            assert!(!update.status.error_message.is_empty());
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn worker_without_master_commits_suicide() {
    let bed = TestBed::new();
    // No pong responder: the master stays silent.
    let worker = FakeWorker::new("w1".to_string(), FakeConfig::default());
    let base = bed.base_worker("w1", CancellationToken::new());

    let result = tokio::time::timeout(Duration::from_secs(2), base.run(Box::new(worker)))
        .await
        .expect("worker must give up in time");
    match result {
        Err(EngineError::HeartbeatTimeout(_)) => {}
        other => panic!("unexpected: {other:?}"),
    }
}

/// The worker ticks 100 times per second against a bucket of burst 1
/// refilling once per scaled second; over ten scaled seconds at most
/// burst + 10 refills = 11 status updates go out. Report attempts are
/// driven by the ticks themselves, so the tick frequency is what the
/// bucket throttles.
#[tokio::test]
async fn status_reports_are_rate_limited() {
    let bed = TestBed::new();
    let responder = spawn_pong_responder(bed.fabric.clone(), MASTER_ID, 1);
    let mut updates = bed.fabric.subscribe(&status_update_topic(MASTER_ID));

    // Time axis scaled 10:1: the spec's 1 s refill becomes 100ms, its
    // 10 s window becomes 1 s. Ticks stay at 100 per second.
    let mut cfg = fast_config();
    cfg.worker_tick_interval = Duration::from_millis(10);
    cfg.status_rate_interval = Duration::from_millis(100);
    cfg.status_rate_burst = 1;
    cfg.worker_timeout = Duration::from_secs(5);
    let shutdown = CancellationToken::new();
    let base = BaseWorker::new(
        "w1".to_string(),
        MASTER_ID.to_string(),
        1,
        bed.fabric.clone(),
        bed.meta.clone(),
        cfg,
        shutdown.clone(),
    );

    // Never finishes on its own; the observation window ends the run, so
    // every published update was a rate-limited tick-driven report.
    let worker = FakeWorker::new("w1".to_string(), FakeConfig::default());
    let run = tokio::spawn(base.run(Box::new(worker)));

    tokio::time::sleep(Duration::from_millis(950)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), run)
        .await
        .expect("worker must stop on cancel")
        .expect("join")
        .expect("clean exit");

    let mut published = 0;
    while let Ok(msg) = updates.try_recv() {
        if matches!(msg, Message::StatusUpdate(_)) {
            published += 1;
        }
    }
    assert!(
        published <= 11,
        "published {published} updates over ~95 ticks, expected <= 11"
    );
    assert!(published >= 4, "published {published} updates, expected >= 4");
    responder.cancel();
}

#[tokio::test]
async fn status_mirror_is_persisted() {
    let bed = TestBed::new();
    let responder = spawn_pong_responder(bed.fabric.clone(), MASTER_ID, 1);

    let worker = FakeWorker::new(
        "w1".to_string(),
        FakeConfig {
            finish_after_ticks: Some(3),
        },
    );
    let base = bed.base_worker("w1", CancellationToken::new());
    base.run(Box::new(worker)).await.expect("clean exit");

    let key = fast_config().worker_status_key(MASTER_ID, "w1");
    let resp = bed.meta.get(&key).await.expect("get");
    assert_eq!(resp.kvs.len(), 1);
    let mirrored: WorkerStatus = serde_json::from_slice(&resp.kvs[0].value).expect("decode");
    assert_eq!(mirrored.code, WorkerStatusCode::Finished);
    responder.cancel();
}

#[tokio::test]
async fn cancelled_worker_closes_quietly() {
    let bed = TestBed::new();
    let responder = spawn_pong_responder(bed.fabric.clone(), MASTER_ID, 1);
    let shutdown = CancellationToken::new();

    let worker = FakeWorker::new("w1".to_string(), FakeConfig::default());
    let base = bed.base_worker("w1", shutdown.clone());
    let run = tokio::spawn(base.run(Box::new(worker)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(1), run)
        .await
        .expect("worker must stop on cancel")
        .expect("join");
    assert!(result.is_ok());
    responder.cancel();
}

#[tokio::test]
async fn close_impl_is_idempotent() {
    let mut worker = FakeWorker::new("w1".to_string(), FakeConfig::default());
    let token = CancellationToken::new();
    worker.init_impl(&token).await.expect("init");
    for _ in 0..3 {
        worker.close_impl().await.expect("close");
        assert!(worker.is_closed());
    }

    let mut relay = RelayWorker::new(
        Box::new(VecSource::new(Vec::new())),
        Box::new(CollectSink::default()),
    );
    relay.init_impl(&token).await.expect("init");
    for _ in 0..3 {
        relay.close_impl().await.expect("close");
    }
}

#[tokio::test]
async fn repeated_init_is_rejected() {
    let token = CancellationToken::new();
    let mut worker = FakeWorker::new("w1".to_string(), FakeConfig::default());
    worker.init_impl(&token).await.expect("first init");
    assert!(worker.init_impl(&token).await.is_err());
}

#[tokio::test]
async fn relay_worker_moves_records_and_finishes() {
    let records: Vec<String> = (0..100).map(|i| format!("record-{i}")).collect();
    let sink = CollectSink::default();
    let mut relay = RelayWorker::new(
        Box::new(VecSource::new(records.clone())),
        Box::new(sink.clone()),
    );

    let token = CancellationToken::new();
    relay.init_impl(&token).await.expect("init");

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while relay.status().code != WorkerStatusCode::Finished {
        assert!(std::time::Instant::now() < deadline, "relay did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(relay.relayed(), 100);
    assert_eq!(
        *sink.records.lock().expect("sink records"),
        records,
        "records must arrive complete and in order"
    );
    relay.close_impl().await.expect("close");
}

/// A failing sink turns the relay's status into a terminal error, and the
/// error wins over the producer finishing cleanly.
#[tokio::test]
async fn relay_sink_error_dominates() {
    struct FailingSink;

    #[async_trait]
    impl jobflow::worker::relay::RecordSink for FailingSink {
        async fn write(&mut self, _record: String) -> Result<()> {
            Err(EngineError::Internal("disk full".to_string()))
        }
    }

    let mut relay = RelayWorker::new(
        Box::new(VecSource::new(vec!["r1".to_string(), "r2".to_string()])),
        Box::new(FailingSink),
    );
    let token = CancellationToken::new();
    relay.init_impl(&token).await.expect("init");

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let status = relay.status();
        if status.is_terminal() {
            assert_eq!(status.code, WorkerStatusCode::Error);
            assert!(status.error_message.contains("disk full"));
            break;
        }
        assert!(std::time::Instant::now() < deadline, "relay never errored");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    relay.close_impl().await.expect("close");
}
