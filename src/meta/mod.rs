//! Metastore adapter: atomic get/put/delete, multi-op transactions and a
//! monotonically increasing epoch generator.
//!
//! Keys are UTF-8 strings with caller-defined prefixes; values are opaque
//! bytes. Every response carries the cluster id and a monotonic revision.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::Epoch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub cluster_id: String,
    pub revision: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which this key was last modified.
    pub revision: i64,
}

#[derive(Debug, Clone)]
pub struct GetResponse {
    pub header: ResponseHeader,
    pub kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone)]
pub struct PutResponse {
    pub header: ResponseHeader,
}

#[derive(Debug, Clone)]
pub struct DeleteResponse {
    pub header: ResponseHeader,
}

/// A single operation inside a transaction.
#[derive(Debug, Clone)]
pub enum Op {
    Get { key: String },
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

#[derive(Debug, Clone)]
pub enum OpResponse {
    Get(GetResponse),
    Put(PutResponse),
    Delete(DeleteResponse),
}

#[derive(Debug, Clone)]
pub struct TxnResponse {
    pub header: ResponseHeader,
    pub responses: Vec<OpResponse>,
}

/// Key/value + transaction interface the engine core persists through.
///
/// Implementations must apply `txn` atomically: an aborted transaction
/// leaves no partial state behind.
#[async_trait]
pub trait MetaClient: Send + Sync {
    /// Prefix lookup: returns every key starting with `key`, in key order.
    /// A point read is a prefix lookup that matches one key.
    async fn get(&self, key: &str) -> Result<GetResponse>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<PutResponse>;

    async fn delete(&self, key: &str) -> Result<DeleteResponse>;

    /// Apply `ops` in order as one atomic unit.
    async fn txn(&self, ops: Vec<Op>) -> Result<TxnResponse>;

    /// Bump and return the cluster-wide epoch counter
    /// (`UPDATE epoch = epoch + 1; SELECT epoch` semantics).
    async fn gen_epoch(&self) -> Result<Epoch>;
}
