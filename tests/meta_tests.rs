use jobflow::meta::memory::MemMetaClient;
use jobflow::meta::{MetaClient, Op, OpResponse};
use jobflow::model::{JobType, MasterMeta, MasterStatusCode};

#[tokio::test]
async fn put_get_delete_roundtrip() {
    let store = MemMetaClient::new("test-cluster");
    store.put("/a/k1", b"v1".to_vec()).await.expect("put");

    let resp = store.get("/a/k1").await.expect("get");
    assert_eq!(resp.header.cluster_id, "test-cluster");
    assert_eq!(resp.kvs.len(), 1);
    assert_eq!(resp.kvs[0].value, b"v1");

    store.delete("/a/k1").await.expect("delete");
    let resp = store.get("/a/k1").await.expect("get");
    assert!(resp.kvs.is_empty());
}

#[tokio::test]
async fn get_scans_by_prefix_in_key_order() {
    let store = MemMetaClient::default();
    store.put("/jobs/b", b"2".to_vec()).await.expect("put");
    store.put("/jobs/a", b"1".to_vec()).await.expect("put");
    store.put("/other/c", b"3".to_vec()).await.expect("put");

    let resp = store.get("/jobs/").await.expect("scan");
    let keys: Vec<&str> = resp.kvs.iter().map(|kv| kv.key.as_str()).collect();
    assert_eq!(keys, vec!["/jobs/a", "/jobs/b"]);
}

#[tokio::test]
async fn revision_is_monotonic_across_mutations() {
    let store = MemMetaClient::default();
    let r1 = store.put("/k", b"1".to_vec()).await.expect("put").header.revision;
    let r2 = store.put("/k", b"2".to_vec()).await.expect("put").header.revision;
    let r3 = store.delete("/k").await.expect("delete").header.revision;
    assert!(r1 < r2 && r2 < r3);
}

#[tokio::test]
async fn txn_applies_all_ops_with_per_op_responses() {
    let store = MemMetaClient::default();
    store.put("/old", b"x".to_vec()).await.expect("put");

    let resp = store
        .txn(vec![
            Op::Delete {
                key: "/old".to_string(),
            },
            Op::Put {
                key: "/new".to_string(),
                value: b"y".to_vec(),
            },
            Op::Get {
                key: "/new".to_string(),
            },
        ])
        .await
        .expect("txn");

    assert_eq!(resp.responses.len(), 3);
    match &resp.responses[2] {
        OpResponse::Get(get) => {
            assert_eq!(get.kvs.len(), 1);
            assert_eq!(get.kvs[0].value, b"y");
        }
        other => panic!("unexpected response: {other:?}"),
    }
    assert!(store.get("/old").await.expect("get").kvs.is_empty());
    assert_eq!(store.get("/new").await.expect("get").kvs.len(), 1);
}

#[tokio::test]
async fn gen_epoch_is_strictly_increasing() {
    let store = MemMetaClient::default();
    let mut last = 0;
    for _ in 0..5 {
        let epoch = store.gen_epoch().await.expect("epoch");
        assert!(epoch > last);
        last = epoch;
    }
}

#[tokio::test]
async fn master_meta_survives_persistence_bit_for_bit() {
    let store = MemMetaClient::default();
    let mut meta = MasterMeta::new("job-1".to_string(), JobType::Relay, 7, b"{}".to_vec());
    meta.node_id = "exec-3".to_string();
    meta.addr = "10.0.0.1:9100".to_string();
    meta.initialized = true;
    meta.status_code = MasterStatusCode::Init;

    let encoded = serde_json::to_vec(&meta).expect("encode");
    store
        .put("/jobflow/master-meta/job-1", encoded.clone())
        .await
        .expect("put");

    let resp = store.get("/jobflow/master-meta/job-1").await.expect("get");
    assert_eq!(resp.kvs[0].value, encoded);
    let decoded: MasterMeta = serde_json::from_slice(&resp.kvs[0].value).expect("decode");
    assert_eq!(decoded, meta);
}
