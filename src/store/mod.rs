mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use tokio::sync::mpsc;

pub use memory::MemoryStore;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    NotFound(String),
    TxAborted,
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(path) => write!(f, "document not found: {path}"),
            StoreError::TxAborted => write!(f, "transaction aborted"),
            StoreError::Backend(msg) => write!(f, "store backend error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Field value replaced by the store's own clock at commit time. This is the
/// only way a document acquires a server-authoritative timestamp.
pub const SERVER_TIMESTAMP_SENTINEL: &str = "$serverTimestamp";

pub fn server_timestamp() -> Value {
    let mut map = Map::new();
    map.insert(SERVER_TIMESTAMP_SENTINEL.to_string(), Value::Bool(true));
    Value::Object(map)
}

pub(crate) fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .map(|map| map.len() == 1 && map.get(SERVER_TIMESTAMP_SENTINEL) == Some(&Value::Bool(true)))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct Document {
    pub path: String,
    pub data: Value,
    pub update_time: DateTime<Utc>,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.data.clone())
            .map_err(|error| StoreError::Backend(format!("decode {}: {error}", self.path)))
    }

    /// Final path segment, the document id within its collection.
    pub fn id(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub equals: Value,
}

#[derive(Debug, Clone)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, SortDirection)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(path: impl Into<String>) -> Self {
        Self {
            collection: path.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, equals: Value) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            equals,
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Full-snapshot stream. Dropping the receiver unsubscribes; the store
/// prunes the closed watcher on its next notification pass.
pub type SnapshotReceiver = mpsc::UnboundedReceiver<Vec<Document>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxDecision {
    Commit,
    Abort,
}

/// Read-modify-write view inside `run_transaction`. Reads observe earlier
/// buffered writes; nothing is visible outside until commit.
pub trait TransactionOps {
    fn get(&mut self, path: &str) -> Result<Option<Document>, StoreError>;
    fn set(&mut self, path: &str, data: Value) -> Result<(), StoreError>;
    fn update(&mut self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError>;
    fn delete(&mut self, path: &str) -> Result<(), StoreError>;
}

pub type TransactionFn<'a> =
    Box<dyn FnMut(&mut dyn TransactionOps) -> Result<TxDecision, StoreError> + Send + 'a>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError>;

    /// Replaces the document. Server-timestamp sentinels in the value are
    /// resolved against the store clock at commit time.
    async fn set(&self, path: &str, data: Value) -> Result<(), StoreError>;

    /// Merges the named top-level fields into an existing document.
    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError>;

    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Delivers the current snapshot immediately, then a fresh full snapshot
    /// after every commit touching the queried collection.
    async fn subscribe(&self, query: Query) -> Result<SnapshotReceiver, StoreError>;

    async fn run_transaction(&self, f: TransactionFn<'_>) -> Result<TxDecision, StoreError>;
}

pub(crate) fn parent_collection(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}
