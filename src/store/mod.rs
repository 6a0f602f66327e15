//! Remote store boundary
//!
//! The hosted backend exposes named query and mutation functions. Callers
//! in this crate never pass function names around: they build a typed
//! [`Query`] or [`Mutation`] and the adapter maps it to the wire.
//!
//! - `http`: JSON function-call API over HTTPS
//! - `memory`: versioned in-process store for tests and offline demos

pub mod http;
pub mod memory;

pub use http::HttpStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::error::Result;
use crate::ml::EnsembleResult;

/// Read operations supported by the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    GetDocument { collection: String, id: String },
    ListDocuments { collection: String },
    LatestForecasts { zone_id: String },
}

impl Query {
    /// Backend function name
    pub fn path(&self) -> &'static str {
        match self {
            Query::GetDocument { .. } => "documents:get",
            Query::ListDocuments { .. } => "documents:list",
            Query::LatestForecasts { .. } => "predictions:latest",
        }
    }

    pub fn args(&self) -> Value {
        match self {
            Query::GetDocument { collection, id } => json!({ "collection": collection, "id": id }),
            Query::ListDocuments { collection } => json!({ "collection": collection }),
            Query::LatestForecasts { zone_id } => json!({ "zoneId": zone_id }),
        }
    }
}

/// Write operations supported by the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateDocument {
        collection: String,
        data: Value,
    },
    UpdateDocument {
        collection: String,
        id: String,
        data: Value,
    },
    DeleteDocument {
        collection: String,
        id: String,
        /// Reject the delete if the stored version differs
        expected_version: Option<u64>,
    },
    StoreForecast(ForecastRecord),
}

impl Mutation {
    /// Backend function name
    pub fn path(&self) -> &'static str {
        match self {
            Mutation::CreateDocument { .. } => "documents:create",
            Mutation::UpdateDocument { .. } => "documents:update",
            Mutation::DeleteDocument { .. } => "documents:remove",
            Mutation::StoreForecast(_) => "predictions:store",
        }
    }

    pub fn args(&self) -> Value {
        match self {
            Mutation::CreateDocument { collection, data } => {
                json!({ "collection": collection, "data": data })
            }
            Mutation::UpdateDocument { collection, id, data } => {
                json!({ "collection": collection, "id": id, "data": data })
            }
            Mutation::DeleteDocument {
                collection,
                id,
                expected_version,
            } => json!({ "collection": collection, "id": id, "expectedVersion": expected_version }),
            Mutation::StoreForecast(record) => json!(record),
        }
    }
}

/// One persisted hourly forecast
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastRecord {
    pub zone_id: String,
    pub hour_offset: u32,
    pub target_time: DateTime<Utc>,
    pub result: EnsembleResult,
}

/// A rejected mutation.
///
/// When the backend refused because it holds different data (stale
/// version, duplicate id) it returns that data in `server_data`.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct MutationFailure {
    pub message: String,
    pub server_data: Option<Value>,
}

impl MutationFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            server_data: None,
        }
    }

    pub fn with_server_data(message: impl Into<String>, server_data: Value) -> Self {
        Self {
            message: message.into(),
            server_data: Some(server_data),
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn query(&self, query: Query) -> Result<Value>;

    async fn mutate(&self, mutation: Mutation) -> std::result::Result<Value, MutationFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_paths_and_args() {
        let q = Query::GetDocument {
            collection: "annotations".to_string(),
            id: "a1".to_string(),
        };
        assert_eq!(q.path(), "documents:get");
        assert_eq!(q.args(), json!({ "collection": "annotations", "id": "a1" }));

        let q = Query::LatestForecasts { zone_id: "z9".to_string() };
        assert_eq!(q.args()["zoneId"], "z9");
    }

    #[test]
    fn test_delete_args_carry_expected_version() {
        let m = Mutation::DeleteDocument {
            collection: "annotations".to_string(),
            id: "a1".to_string(),
            expected_version: Some(4),
        };
        assert_eq!(m.path(), "documents:remove");
        assert_eq!(m.args()["expectedVersion"], 4);
    }

    #[test]
    fn test_failure_display() {
        let f = MutationFailure::with_server_data("version conflict", json!({ "version": 3 }));
        assert_eq!(f.to_string(), "version conflict");
        assert!(f.server_data.is_some());
        assert!(MutationFailure::new("offline").server_data.is_none());
    }
}
