
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use jobflow::error::EngineError;
use jobflow::fabric::{
    heartbeat_ping_topic, heartbeat_pong_topic, Fabric, HeartbeatPong, Message,
};
use jobflow::meta::memory::MemMetaClient;
use jobflow::meta::MetaClient;
use jobflow::worker::base::BaseWorker;
use jobflow::worker::fake::{FakeConfig, FakeWorker};

use test_harness::{fast_config, spawn_pong_responder, MASTER_ID};

fn start_worker(fabric: &Arc<Fabric>, epoch: i64) -> CancellationToken {
    let meta: Arc<dyn MetaClient> = Arc::new(MemMetaClient::default());
    let shutdown = CancellationToken::new();
    let base = BaseWorker::new(
        "w1".to_string(),
        MASTER_ID.to_string(),
        epoch,
        fabric.clone(),
        meta,
        fast_config(),
        shutdown.clone(),
    );
    let worker = FakeWorker::new("w1".to_string(), FakeConfig::default());
    tokio::spawn(async move {
        let _ = base.run(Box::new(worker)).await;
    });
    shutdown
}

#[tokio::test]
async fn pings_carry_monotonic_send_times() {
    let fabric = Arc::new(Fabric::new());
    let responder = spawn_pong_responder(fabric.clone(), MASTER_ID, 1);
    let mut pings = fabric.subscribe(&heartbeat_ping_topic(MASTER_ID));
    let shutdown = start_worker(&fabric, 1);

    let mut last = Duration::ZERO;
    for i in 0..3 {
        let msg = tokio::time::timeout(Duration::from_secs(1), pings.recv())
            .await
            .expect("ping in time")
            .expect("ping");
        let Message::HeartbeatPing(ping) = msg else {
            panic!("unexpected message");
        };
        assert_eq!(ping.from_worker_id, "w1");
        assert_eq!(ping.epoch, 1);
        if i > 0 {
            assert!(ping.send_time > last, "send times must move forward");
        }
        last = ping.send_time;
    }

    shutdown.cancel();
    responder.cancel();
}

/// Pongs from a previous master incarnation are no liveness proof: a
/// worker fed only stale epochs gives up exactly as if it heard nothing.
#[tokio::test]
async fn stale_pongs_are_discarded() {
    let fabric = Arc::new(Fabric::new());
    // Worker believes the master is at epoch 5; responder is stuck at 3.
    let responder = spawn_pong_responder(fabric.clone(), MASTER_ID, 3);

    let meta: Arc<dyn MetaClient> = Arc::new(MemMetaClient::default());
    let base = BaseWorker::new(
        "w1".to_string(),
        MASTER_ID.to_string(),
        5,
        fabric.clone(),
        meta,
        fast_config(),
        CancellationToken::new(),
    );
    let worker = FakeWorker::new("w1".to_string(), FakeConfig::default());
    let result = tokio::time::timeout(Duration::from_secs(2), base.run(Box::new(worker)))
        .await
        .expect("worker must give up in time");
    match result {
        Err(EngineError::HeartbeatTimeout(_)) => {}
        other => panic!("unexpected: {other:?}"),
    }
    responder.cancel();
}

/// When the master comes back with a higher epoch, the worker re-handshakes
/// and resumes heartbeating with the new epoch.
#[tokio::test]
async fn worker_adopts_new_epoch_after_failover() {
    let fabric = Arc::new(Fabric::new());
    let mut pings = fabric.subscribe(&heartbeat_ping_topic(MASTER_ID));
    let shutdown = start_worker(&fabric, 1);

    // Master at epoch 1 first, then failed over to epoch 2.
    let mut replied = 0;
    let pong_topic = heartbeat_pong_topic(MASTER_ID);
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        assert!(
            std::time::Instant::now() < deadline,
            "worker never adopted the new epoch"
        );
        let msg = tokio::time::timeout(Duration::from_secs(1), pings.recv())
            .await
            .expect("ping in time")
            .expect("ping");
        let Message::HeartbeatPing(ping) = msg else {
            continue;
        };
        if replied >= 2 && ping.epoch == 2 {
            break; // re-handshake done
        }
        let epoch = if replied < 2 { 1 } else { 2 };
        fabric.publish(
            &pong_topic,
            Message::HeartbeatPong(HeartbeatPong {
                send_time: ping.send_time,
                reply_time: chrono::Utc::now(),
                epoch,
            }),
        );
        replied += 1;
    }

    shutdown.cancel();
}
