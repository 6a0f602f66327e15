//! In-memory store with optimistic concurrency on documents
//!
//! Documents are JSON objects carrying `_id` and `version`. An update or
//! delete that names a `version` other than the stored one is rejected and
//! the stored document is returned as server data, which is exactly the
//! shape the sync ledger turns into a conflict.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{ForecastRecord, Mutation, MutationFailure, Query, RemoteStore};
use crate::error::{AirqError, Result};

#[derive(Default)]
pub struct MemoryStore {
    /// collection -> id -> document
    documents: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    forecasts: RwLock<Vec<ForecastRecord>>,
    /// Number of upcoming mutations to reject as transport failures
    fail_next: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document directly, bypassing version checks.
    /// Missing `version` defaults to 1.
    pub async fn insert(&self, collection: &str, id: &str, data: Value) {
        let mut doc = as_object(data);
        doc.insert("_id".to_string(), json!(id));
        doc.entry("version").or_insert(json!(1));
        self.documents
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), Value::Object(doc));
    }

    pub async fn document(&self, collection: &str, id: &str) -> Option<Value> {
        self.documents
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    pub async fn forecasts(&self) -> Vec<ForecastRecord> {
        self.forecasts.read().await.clone()
    }

    /// Reject the next `count` mutations without server data
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn create(&self, collection: String, data: Value) -> std::result::Result<Value, MutationFailure> {
        let mut doc = as_object(data);
        let id = doc
            .get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut documents = self.documents.write().await;
        let docs = documents.entry(collection).or_default();
        if let Some(existing) = docs.get(&id) {
            return Err(MutationFailure::with_server_data(
                format!("Document {} already exists", id),
                existing.clone(),
            ));
        }

        doc.insert("_id".to_string(), json!(id));
        doc.insert("version".to_string(), json!(1));
        let doc = Value::Object(doc);
        docs.insert(id, doc.clone());
        Ok(doc)
    }

    async fn update(
        &self,
        collection: String,
        id: String,
        data: Value,
    ) -> std::result::Result<Value, MutationFailure> {
        let mut documents = self.documents.write().await;
        let stored = documents
            .get_mut(&collection)
            .and_then(|docs| docs.get_mut(&id))
            .ok_or_else(|| MutationFailure::new(format!("Document {} not found", id)))?;

        let stored_version = version_of(stored);
        let fields = as_object(data);
        if let Some(expected) = fields.get("version").and_then(Value::as_u64) {
            if expected != stored_version {
                return Err(MutationFailure::with_server_data(
                    format!("Version conflict on {}: expected {}, stored {}", id, expected, stored_version),
                    stored.clone(),
                ));
            }
        }

        if let Value::Object(target) = &mut *stored {
            for (key, value) in fields {
                target.insert(key, value);
            }
            target.insert("_id".to_string(), json!(id));
            target.insert("version".to_string(), json!(stored_version + 1));
        }
        Ok(stored.clone())
    }

    async fn delete(
        &self,
        collection: String,
        id: String,
        expected_version: Option<u64>,
    ) -> std::result::Result<Value, MutationFailure> {
        let mut documents = self.documents.write().await;
        let docs = documents
            .get_mut(&collection)
            .ok_or_else(|| MutationFailure::new(format!("Document {} not found", id)))?;
        let stored = docs
            .get(&id)
            .ok_or_else(|| MutationFailure::new(format!("Document {} not found", id)))?;

        if let Some(expected) = expected_version {
            let stored_version = version_of(stored);
            if expected != stored_version {
                return Err(MutationFailure::with_server_data(
                    format!("Version conflict on {}: expected {}, stored {}", id, expected, stored_version),
                    stored.clone(),
                ));
            }
        }

        Ok(docs.remove(&id).unwrap_or(Value::Null))
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn query(&self, query: Query) -> Result<Value> {
        match query {
            Query::GetDocument { collection, id } => {
                Ok(self.document(&collection, &id).await.unwrap_or(Value::Null))
            }
            Query::ListDocuments { collection } => {
                let documents = self.documents.read().await;
                let list = documents
                    .get(&collection)
                    .map(|docs| docs.values().cloned().collect())
                    .unwrap_or_default();
                Ok(Value::Array(list))
            }
            Query::LatestForecasts { zone_id } => {
                let forecasts = self.forecasts.read().await;
                let matching: Vec<&ForecastRecord> =
                    forecasts.iter().filter(|f| f.zone_id == zone_id).collect();
                serde_json::to_value(matching).map_err(AirqError::from)
            }
        }
    }

    async fn mutate(&self, mutation: Mutation) -> std::result::Result<Value, MutationFailure> {
        if self.take_injected_failure() {
            return Err(MutationFailure::new("Injected transport failure"));
        }
        debug!("[Store] memory mutation {}", mutation.path());

        match mutation {
            Mutation::CreateDocument { collection, data } => self.create(collection, data).await,
            Mutation::UpdateDocument { collection, id, data } => self.update(collection, id, data).await,
            Mutation::DeleteDocument {
                collection,
                id,
                expected_version,
            } => self.delete(collection, id, expected_version).await,
            Mutation::StoreForecast(record) => {
                let mut forecasts = self.forecasts.write().await;
                forecasts.push(record);
                Ok(json!({ "stored": forecasts.len() }))
            }
        }
    }
}

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

fn version_of(doc: &Value) -> u64 {
    doc.get("version").and_then(Value::as_u64).unwrap_or(0)
}
