//! A small indexed document store layered over a single `opendal::Operator`.
//!
//! `Persistable` only knows how to save and load one object at a time by key. The agent pool's
//! `Repository` needs unique and secondary indexes plus simple filter/sort/limit queries, which
//! no `opendal` backend provides on its own. This module is new plumbing grounded in the same
//! operator-backed-cache shape `Persistable` uses: documents live in an in-memory index keyed by
//! collection, written through to the operator for durability.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::{Error, Result, StoreBackend};

#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub field: String,
    pub unique: bool,
}

impl IndexSpec {
    pub fn unique(field: impl Into<String>) -> Self {
        Self { field: field.into(), unique: true }
    }

    pub fn secondary(field: impl Into<String>) -> Self {
        Self { field: field.into(), unique: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filter: Option<(String, Value)>,
    pub sort: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filter = Some((field.into(), value));
        self
    }

    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort = Some((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A document-store client: put/get/remove by key, plus indexed queries within a collection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ensure_collection(&self, collection: &str, indexes: &[IndexSpec]) -> Result<()>;
    async fn put(&self, collection: &str, key: &str, doc: Value) -> Result<()>;
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;
    async fn remove(&self, collection: &str, key: &str) -> Result<()>;
    async fn query(&self, collection: &str, query: Query) -> Result<Vec<Value>>;
}

#[derive(Default)]
struct CollectionState {
    indexes: Vec<IndexSpec>,
    documents: HashMap<String, Value>,
    /// field -> value (stringified) -> key
    unique_indexes: HashMap<String, HashMap<String, String>>,
    /// field -> value (stringified) -> keys
    secondary_indexes: HashMap<String, HashMap<String, HashSet<String>>>,
}

/// A `DocumentStore` backed by an in-memory index over an `opendal::Operator` for durability.
///
/// Suitable for the `memory` and `dashmap` profiles this workspace ships; any other backend
/// chosen via `PoolSettings` is reachable through the underlying operator directly but not
/// through the indexed query path, since index state here is process-local.
pub struct MemoryIndexedStore {
    collections: RwLock<HashMap<String, CollectionState>>,
    operator: opendal::Operator,
}

impl MemoryIndexedStore {
    pub async fn new() -> Result<Self> {
        let backend = StoreBackend::instance().await?;
        Ok(Self {
            collections: RwLock::new(HashMap::new()),
            operator: backend.fastest_op.clone(),
        })
    }

    pub async fn new_memory_only() -> Result<Self> {
        let backend = StoreBackend::init_memory_only().await?;
        Ok(Self {
            collections: RwLock::new(HashMap::new()),
            operator: backend.fastest_op.clone(),
        })
    }

    fn operator_key(collection: &str, key: &str) -> String {
        format!("collection/{collection}/{key}")
    }

    fn field_value(doc: &Value, field: &str) -> Option<String> {
        doc.get(field).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    fn remove_from_indexes(state: &mut CollectionState, key: &str, doc: &Value) {
        for index in &state.indexes {
            let Some(value) = Self::field_value(doc, &index.field) else { continue };
            if index.unique {
                state.unique_indexes.entry(index.field.clone()).or_default().remove(&value);
            } else if let Some(keys) = state.secondary_indexes.get_mut(&index.field) {
                if let Some(set) = keys.get_mut(&value) {
                    set.remove(key);
                }
            }
        }
    }

    fn insert_into_indexes(state: &mut CollectionState, key: &str, doc: &Value) -> Result<()> {
        for index in state.indexes.clone() {
            let Some(value) = Self::field_value(doc, &index.field) else { continue };
            if index.unique {
                let table = state.unique_indexes.entry(index.field.clone()).or_default();
                if let Some(existing) = table.get(&value) {
                    if existing != key {
                        return Err(Error::Profile(format!(
                            "unique index violation on field '{}' for value '{}'",
                            index.field, value
                        )));
                    }
                }
                table.insert(value, key.to_string());
            } else {
                state
                    .secondary_indexes
                    .entry(index.field.clone())
                    .or_default()
                    .entry(value)
                    .or_default()
                    .insert(key.to_string());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryIndexedStore {
    async fn ensure_collection(&self, collection: &str, indexes: &[IndexSpec]) -> Result<()> {
        let mut collections = self.collections.write().expect("collection lock poisoned");
        let state = collections.entry(collection.to_string()).or_default();
        for spec in indexes {
            if !state.indexes.iter().any(|existing| existing.field == spec.field) {
                state.indexes.push(spec.clone());
                if spec.unique {
                    state.unique_indexes.entry(spec.field.clone()).or_default();
                } else {
                    state.secondary_indexes.entry(spec.field.clone()).or_default();
                }
            }
        }
        Ok(())
    }

    async fn put(&self, collection: &str, key: &str, doc: Value) -> Result<()> {
        let serialized = serde_json::to_vec(&doc)?;
        self.operator.write(&Self::operator_key(collection, key), serialized).await?;

        let mut collections = self.collections.write().expect("collection lock poisoned");
        let state = collections.entry(collection.to_string()).or_default();

        if let Some(previous) = state.documents.get(key).cloned() {
            Self::remove_from_indexes(state, key, &previous);
        }
        Self::insert_into_indexes(state, key, &doc)?;
        state.documents.insert(key.to_string(), doc);
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        {
            let collections = self.collections.read().expect("collection lock poisoned");
            if let Some(state) = collections.get(collection) {
                if let Some(doc) = state.documents.get(key) {
                    return Ok(Some(doc.clone()));
                }
            }
        }

        match self.operator.read(&Self::operator_key(collection, key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes.to_vec())?)),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, collection: &str, key: &str) -> Result<()> {
        let _ = self.operator.delete(&Self::operator_key(collection, key)).await;

        let mut collections = self.collections.write().expect("collection lock poisoned");
        if let Some(state) = collections.get_mut(collection) {
            if let Some(doc) = state.documents.remove(key) {
                Self::remove_from_indexes(state, key, &doc);
            }
        }
        Ok(())
    }

    async fn query(&self, collection: &str, query: Query) -> Result<Vec<Value>> {
        let collections = self.collections.read().expect("collection lock poisoned");
        let Some(state) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut results: Vec<Value> = if let Some((field, value)) = &query.filter {
            let target = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };

            if let Some(table) = state.unique_indexes.get(field) {
                table
                    .get(&target)
                    .and_then(|key| state.documents.get(key))
                    .cloned()
                    .into_iter()
                    .collect()
            } else if let Some(table) = state.secondary_indexes.get(field) {
                table
                    .get(&target)
                    .map(|keys| {
                        keys.iter()
                            .filter_map(|key| state.documents.get(key))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            } else {
                state
                    .documents
                    .values()
                    .filter(|doc| Self::field_value(doc, field).as_deref() == Some(target.as_str()))
                    .cloned()
                    .collect()
            }
        } else {
            state.documents.values().cloned().collect()
        };

        if let Some((field, order)) = &query.sort {
            results.sort_by(|a, b| {
                let av = Self::field_value(a, field).unwrap_or_default();
                let bv = Self::field_value(b, field).unwrap_or_default();
                match order {
                    SortOrder::Asc => av.cmp(&bv),
                    SortOrder::Desc => bv.cmp(&av),
                }
            });
        }

        if let Some(limit) = query.limit {
            results.truncate(limit);
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> MemoryIndexedStore {
        MemoryIndexedStore::new_memory_only().await.unwrap()
    }

    #[tokio::test]
    async fn put_get_remove_round_trip() {
        let store = store().await;
        store.ensure_collection("pools", &[]).await.unwrap();
        store.put("pools", "p1", json!({"id": "p1", "name": "default"})).await.unwrap();

        let loaded = store.get("pools", "p1").await.unwrap().unwrap();
        assert_eq!(loaded["name"], "default");

        store.remove("pools", "p1").await.unwrap();
        assert!(store.get("pools", "p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicate_value() {
        let store = store().await;
        store
            .ensure_collection("pools", &[IndexSpec::unique("name")])
            .await
            .unwrap();

        store.put("pools", "p1", json!({"id": "p1", "name": "default"})).await.unwrap();
        let err = store
            .put("pools", "p2", json!({"id": "p2", "name": "default"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Profile(_)));
    }

    #[tokio::test]
    async fn secondary_index_query_filters() {
        let store = store().await;
        store
            .ensure_collection("memberships", &[IndexSpec::secondary("pool_id")])
            .await
            .unwrap();

        store
            .put("memberships", "m1", json!({"pool_id": "p1", "agent_id": "a1"}))
            .await
            .unwrap();
        store
            .put("memberships", "m2", json!({"pool_id": "p1", "agent_id": "a2"}))
            .await
            .unwrap();
        store
            .put("memberships", "m3", json!({"pool_id": "p2", "agent_id": "a3"}))
            .await
            .unwrap();

        let results = store
            .query("memberships", Query::new().filter("pool_id", json!("p1")))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn query_sorts_and_limits() {
        let store = store().await;
        store.ensure_collection("metrics", &[]).await.unwrap();

        for (key, ts) in [("m1", 3), ("m2", 1), ("m3", 2)] {
            store.put("metrics", key, json!({"timestamp": ts})).await.unwrap();
        }

        let results = store
            .query(
                "metrics",
                Query::new().sort("timestamp", SortOrder::Desc).limit(2),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["timestamp"], 3);
        assert_eq!(results[1]["timestamp"], 2);
    }
}
