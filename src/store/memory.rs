use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::{mpsc, RwLock};

use super::{
    is_server_timestamp, parent_collection, Document, DocumentStore, Query, SnapshotReceiver,
    SortDirection, StoreError, TransactionFn, TransactionOps, TxDecision,
};

#[derive(Debug, Clone)]
struct StoredDoc {
    data: Value,
    update_time: DateTime<Utc>,
}

struct Watcher {
    query: Query,
    tx: mpsc::UnboundedSender<Vec<Document>>,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, StoredDoc>,
    watchers: Vec<Watcher>,
}

/// In-memory document store. Single-process reference semantics for the
/// abstract store contract: full-snapshot subscriptions, merge updates,
/// serialized transactions behind the write lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn resolve_server_timestamps(value: &mut Value, now: DateTime<Utc>) {
    if is_server_timestamp(value) {
        *value = Value::String(now.to_rfc3339_opts(chrono::SecondsFormat::Micros, true));
        return;
    }

    match value {
        Value::Object(map) => {
            for field in map.values_mut() {
                resolve_server_timestamps(field, now);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                resolve_server_timestamps(item, now);
            }
        }
        _ => {}
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

fn matches(query: &Query, path: &str, doc: &StoredDoc) -> bool {
    if parent_collection(path) != query.collection {
        return false;
    }

    query.filters.iter().all(|filter| {
        doc.data
            .get(&filter.field)
            .map(|value| *value == filter.equals)
            .unwrap_or(false)
    })
}

fn evaluate(query: &Query, docs: &BTreeMap<String, StoredDoc>) -> Vec<Document> {
    let mut results: Vec<Document> = docs
        .iter()
        .filter(|(path, doc)| matches(query, path, doc))
        .map(|(path, doc)| Document {
            path: path.clone(),
            data: doc.data.clone(),
            update_time: doc.update_time,
        })
        .collect();

    if let Some((field, direction)) = &query.order_by {
        results.sort_by(|a, b| {
            let left = a.data.get(field).filter(|v| !v.is_null());
            let right = b.data.get(field).filter(|v| !v.is_null());
            // A document missing the ordering field sorts after every
            // document that has it, regardless of direction.
            match (left, right) {
                (Some(x), Some(y)) => {
                    let ordering = compare_values(x, y);
                    match direction {
                        SortDirection::Ascending => ordering,
                        SortDirection::Descending => ordering.reverse(),
                    }
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
    }

    if let Some(limit) = query.limit {
        results.truncate(limit);
    }

    results
}

/// Re-deliver snapshots to watchers of the touched collections and drop
/// watchers whose receiver has gone away.
fn notify(inner: &mut Inner, changed_collections: &HashSet<String>) {
    let mut stale = Vec::new();

    for (index, watcher) in inner.watchers.iter().enumerate() {
        if !changed_collections.contains(&watcher.query.collection) {
            continue;
        }

        let snapshot = evaluate(&watcher.query, &inner.docs);
        if watcher.tx.send(snapshot).is_err() {
            stale.push(index);
        }
    }

    for index in stale.into_iter().rev() {
        inner.watchers.swap_remove(index);
    }
}

struct MemoryTx<'a> {
    inner: &'a mut Inner,
    // None marks a buffered delete.
    overlay: BTreeMap<String, Option<StoredDoc>>,
    now: DateTime<Utc>,
}

impl MemoryTx<'_> {
    fn read(&self, path: &str) -> Option<StoredDoc> {
        match self.overlay.get(path) {
            Some(Some(doc)) => Some(doc.clone()),
            Some(None) => None,
            None => self.inner.docs.get(path).cloned(),
        }
    }
}

impl TransactionOps for MemoryTx<'_> {
    fn get(&mut self, path: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.read(path).map(|doc| Document {
            path: path.to_string(),
            data: doc.data,
            update_time: doc.update_time,
        }))
    }

    fn set(&mut self, path: &str, mut data: Value) -> Result<(), StoreError> {
        resolve_server_timestamps(&mut data, self.now);
        self.overlay.insert(
            path.to_string(),
            Some(StoredDoc {
                data,
                update_time: self.now,
            }),
        );
        Ok(())
    }

    fn update(&mut self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let mut doc = self
            .read(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        let Value::Object(ref mut map) = doc.data else {
            return Err(StoreError::Backend(format!(
                "document {path} is not an object"
            )));
        };
        for (field, mut value) in fields {
            resolve_server_timestamps(&mut value, self.now);
            map.insert(field, value);
        }
        doc.update_time = self.now;
        self.overlay.insert(path.to_string(), Some(doc));
        Ok(())
    }

    fn delete(&mut self, path: &str) -> Result<(), StoreError> {
        self.overlay.insert(path.to_string(), None);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.docs.get(path).map(|doc| Document {
            path: path.to_string(),
            data: doc.data.clone(),
            update_time: doc.update_time,
        }))
    }

    async fn set(&self, path: &str, mut data: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        resolve_server_timestamps(&mut data, now);
        inner.docs.insert(
            path.to_string(),
            StoredDoc {
                data,
                update_time: now,
            },
        );

        let changed = HashSet::from([parent_collection(path).to_string()]);
        notify(&mut inner, &changed);
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let doc = inner
            .docs
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        let Value::Object(ref mut map) = doc.data else {
            return Err(StoreError::Backend(format!(
                "document {path} is not an object"
            )));
        };
        for (field, mut value) in fields {
            resolve_server_timestamps(&mut value, now);
            map.insert(field, value);
        }
        doc.update_time = now;

        let changed = HashSet::from([parent_collection(path).to_string()]);
        notify(&mut inner, &changed);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.docs.remove(path).is_none() {
            return Ok(());
        }

        let changed = HashSet::from([parent_collection(path).to_string()]);
        notify(&mut inner, &changed);
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let inner = self.inner.read().await;
        Ok(evaluate(query, &inner.docs))
    }

    async fn subscribe(&self, query: Query) -> Result<SnapshotReceiver, StoreError> {
        let mut inner = self.inner.write().await;
        let (tx, rx) = mpsc::unbounded_channel();

        let initial = evaluate(&query, &inner.docs);
        let _ = tx.send(initial);

        inner.watchers.push(Watcher { query, tx });
        Ok(rx)
    }

    async fn run_transaction(&self, mut f: TransactionFn<'_>) -> Result<TxDecision, StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let mut tx = MemoryTx {
            inner: &mut *inner,
            overlay: BTreeMap::new(),
            now,
        };

        let decision = f(&mut tx)?;
        let overlay = tx.overlay;

        if decision == TxDecision::Abort {
            return Ok(TxDecision::Abort);
        }

        let mut changed = HashSet::new();
        for (path, entry) in overlay {
            changed.insert(parent_collection(&path).to_string());
            match entry {
                Some(doc) => {
                    inner.docs.insert(path, doc);
                }
                None => {
                    inner.docs.remove(&path);
                }
            }
        }

        if !changed.is_empty() {
            notify(&mut inner, &changed);
        }
        Ok(TxDecision::Commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::server_timestamp;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = MemoryStore::new();
        store
            .set("users/u1", json!({"display_name": "ada"}))
            .await
            .expect("set");

        let doc = store.get("users/u1").await.expect("get").expect("exists");
        assert_eq!(doc.data["display_name"], "ada");
        assert_eq!(doc.id(), "u1");
    }

    #[tokio::test]
    async fn server_timestamp_sentinel_resolves_on_commit() {
        let store = MemoryStore::new();
        store
            .set("rooms/r1", json!({"created_at": server_timestamp()}))
            .await
            .expect("set");

        let doc = store.get("rooms/r1").await.expect("get").expect("exists");
        let created_at = doc.data["created_at"].as_str().expect("string timestamp");
        assert!(created_at.parse::<DateTime<Utc>>().is_ok());
    }

    #[tokio::test]
    async fn update_merges_fields_and_requires_existence() {
        let store = MemoryStore::new();
        store
            .set("rooms/r1", json!({"a": 1, "b": 1}))
            .await
            .expect("set");

        let mut fields = Map::new();
        fields.insert("b".to_string(), json!(2));
        store.update("rooms/r1", fields).await.expect("update");

        let doc = store.get("rooms/r1").await.expect("get").expect("exists");
        assert_eq!(doc.data, json!({"a": 1, "b": 2}));

        let mut fields = Map::new();
        fields.insert("b".to_string(), json!(3));
        let err = store.update("rooms/missing", fields).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn query_filters_and_orders_with_missing_field_last() {
        let store = MemoryStore::new();
        store
            .set("msgs/a", json!({"room": "r1", "seq": 2}))
            .await
            .expect("set");
        store
            .set("msgs/b", json!({"room": "r1", "seq": 1}))
            .await
            .expect("set");
        store
            .set("msgs/c", json!({"room": "r1"}))
            .await
            .expect("set");
        store
            .set("msgs/d", json!({"room": "r2", "seq": 0}))
            .await
            .expect("set");

        let query = Query::collection("msgs")
            .filter("room", json!("r1"))
            .order_by("seq", SortDirection::Ascending);
        let results = store.query(&query).await.expect("query");

        let ids: Vec<&str> = results.iter().map(|doc| doc.id()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn subscribe_delivers_initial_and_change_snapshots() {
        let store = MemoryStore::new();
        store.set("msgs/a", json!({"n": 1})).await.expect("set");

        let mut rx = store
            .subscribe(Query::collection("msgs"))
            .await
            .expect("subscribe");

        let initial = rx.recv().await.expect("initial snapshot");
        assert_eq!(initial.len(), 1);

        store.set("msgs/b", json!({"n": 2})).await.expect("set");
        let next = rx.recv().await.expect("change snapshot");
        assert_eq!(next.len(), 2);

        // Writes to other collections do not wake this watcher.
        store.set("other/x", json!({})).await.expect("set");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let store = MemoryStore::new();
        let rx = store
            .subscribe(Query::collection("msgs"))
            .await
            .expect("subscribe");
        drop(rx);

        store.set("msgs/a", json!({})).await.expect("set");
        let inner = store.inner.read().await;
        assert!(inner.watchers.is_empty());
    }

    #[tokio::test]
    async fn transaction_commit_is_atomic_and_abort_discards() {
        let store = MemoryStore::new();
        store.set("rooms/r1", json!({"n": 0})).await.expect("set");

        let decision = store
            .run_transaction(Box::new(|tx| {
                let doc = tx.get("rooms/r1")?.expect("exists");
                let n = doc.data["n"].as_i64().unwrap_or(0);
                tx.set("rooms/r1", json!({"n": n + 1}))?;
                tx.set("rooms/r2", json!({"n": 100}))?;
                Ok(TxDecision::Commit)
            }))
            .await
            .expect("transaction");
        assert_eq!(decision, TxDecision::Commit);
        assert_eq!(
            store.get("rooms/r1").await.unwrap().unwrap().data["n"],
            json!(1)
        );
        assert!(store.get("rooms/r2").await.unwrap().is_some());

        let decision = store
            .run_transaction(Box::new(|tx| {
                tx.set("rooms/r1", json!({"n": 999}))?;
                Ok(TxDecision::Abort)
            }))
            .await
            .expect("transaction");
        assert_eq!(decision, TxDecision::Abort);
        assert_eq!(
            store.get("rooms/r1").await.unwrap().unwrap().data["n"],
            json!(1)
        );
    }

    #[tokio::test]
    async fn transaction_reads_observe_buffered_writes() {
        let store = MemoryStore::new();
        store
            .run_transaction(Box::new(|tx| {
                tx.set("rooms/r1", json!({"n": 5}))?;
                let doc = tx.get("rooms/r1")?.expect("buffered write visible");
                assert_eq!(doc.data["n"], json!(5));
                tx.delete("rooms/r1")?;
                assert!(tx.get("rooms/r1")?.is_none());
                Ok(TxDecision::Commit)
            }))
            .await
            .expect("transaction");

        assert!(store.get("rooms/r1").await.unwrap().is_none());
    }
}
