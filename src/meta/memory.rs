//! In-memory metastore, used by tests and single-process deployments.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;
use crate::meta::{
    DeleteResponse, GetResponse, KeyValue, MetaClient, Op, OpResponse, PutResponse,
    ResponseHeader, TxnResponse,
};
use crate::model::Epoch;

/// Reserved key backing [`MetaClient::gen_epoch`].
const EPOCH_KEY: &str = "/jobflow/meta/epoch";

#[derive(Default)]
struct Inner {
    /// key -> (value, mod revision)
    store: BTreeMap<String, (Vec<u8>, i64)>,
    revision: i64,
}

impl Inner {
    fn scan(&self, prefix: &str) -> Vec<KeyValue> {
        self.store
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, rev))| KeyValue {
                key: k.clone(),
                value: v.clone(),
                revision: *rev,
            })
            .collect()
    }

    fn apply(&mut self, op: &Op) -> OpResponse {
        match op {
            Op::Get { key } => OpResponse::Get(GetResponse {
                header: ResponseHeader {
                    cluster_id: String::new(),
                    revision: self.revision,
                },
                kvs: self.scan(key),
            }),
            Op::Put { key, value } => {
                self.store.insert(key.clone(), (value.clone(), self.revision));
                OpResponse::Put(PutResponse {
                    header: ResponseHeader {
                        cluster_id: String::new(),
                        revision: self.revision,
                    },
                })
            }
            Op::Delete { key } => {
                self.store.remove(key);
                OpResponse::Delete(DeleteResponse {
                    header: ResponseHeader {
                        cluster_id: String::new(),
                        revision: self.revision,
                    },
                })
            }
        }
    }
}

pub struct MemMetaClient {
    cluster_id: String,
    inner: Mutex<Inner>,
}

impl MemMetaClient {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn header(&self, revision: i64) -> ResponseHeader {
        ResponseHeader {
            cluster_id: self.cluster_id.clone(),
            revision,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemMetaClient {
    fn default() -> Self {
        Self::new("mem-cluster")
    }
}

#[async_trait]
impl MetaClient for MemMetaClient {
    async fn get(&self, key: &str) -> Result<GetResponse> {
        let inner = self.lock();
        Ok(GetResponse {
            header: self.header(inner.revision),
            kvs: inner.scan(key),
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<PutResponse> {
        let mut inner = self.lock();
        inner.revision += 1;
        let revision = inner.revision;
        inner.store.insert(key.to_string(), (value, revision));
        Ok(PutResponse {
            header: self.header(revision),
        })
    }

    async fn delete(&self, key: &str) -> Result<DeleteResponse> {
        let mut inner = self.lock();
        inner.revision += 1;
        let revision = inner.revision;
        inner.store.remove(key);
        Ok(DeleteResponse {
            header: self.header(revision),
        })
    }

    async fn txn(&self, ops: Vec<Op>) -> Result<TxnResponse> {
        let mut inner = self.lock();
        // One revision per transaction, like the etcd-style stores this
        // adapter mimics.
        inner.revision += 1;
        let revision = inner.revision;
        let responses = ops.iter().map(|op| inner.apply(op)).collect();
        Ok(TxnResponse {
            header: self.header(revision),
            responses,
        })
    }

    async fn gen_epoch(&self) -> Result<Epoch> {
        let mut inner = self.lock();
        inner.revision += 1;
        let revision = inner.revision;
        let current = inner
            .store
            .get(EPOCH_KEY)
            .and_then(|(v, _)| std::str::from_utf8(v).ok()?.parse::<Epoch>().ok())
            .unwrap_or(0);
        let next = current + 1;
        inner
            .store
            .insert(EPOCH_KEY.to_string(), (next.to_string().into_bytes(), revision));
        Ok(next)
    }
}
