//! Conflict records and resolution strategies
//!
//! A conflict pairs a failed optimistic update with the data the server
//! actually holds. Strategies decide the value both sides should converge
//! on; applying that value is the caller's job.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;

use super::ledger::OptimisticUpdate;
use super::ConflictId;

/// Caller-supplied merge, called with `(local, remote)`
#[derive(Clone)]
pub struct MergeFn(Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>);

impl MergeFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, local: &Value, remote: &Value) -> Value {
        (self.0)(local, remote)
    }
}

impl fmt::Debug for MergeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MergeFn(..)")
    }
}

/// How a conflict is settled
#[derive(Debug, Clone)]
pub enum ResolutionStrategy {
    /// Local payload wins unconditionally
    LastWriterWins,
    /// Remote fields overridden by local fields, or a custom merge
    Merge(Option<MergeFn>),
    /// Higher version wins in full; the local version is supplied here,
    /// the remote one is read from `remote.version`. Missing versions count as 0.
    VersionBased { local_version: Option<u64> },
    /// Leave the conflict for a human decision
    Manual,
}

impl ResolutionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ResolutionStrategy::LastWriterWins => "last-writer-wins",
            ResolutionStrategy::Merge(_) => "merge",
            ResolutionStrategy::VersionBased { .. } => "version-based",
            ResolutionStrategy::Manual => "manual",
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, ResolutionStrategy::Manual)
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for ResolutionStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    /// Parses the strategy names; `version-based` parses without a local version
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "last-writer-wins" | "lww" => Ok(ResolutionStrategy::LastWriterWins),
            "merge" => Ok(ResolutionStrategy::Merge(None)),
            "version-based" | "version" => Ok(ResolutionStrategy::VersionBased { local_version: None }),
            "manual" => Ok(ResolutionStrategy::Manual),
            other => Err(format!("unknown resolution strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    /// Awaiting a strategy
    Pending,
    /// Settled; only seen on the `Resolution` handed back to the caller
    Resolved,
    /// Parked for a human decision
    Manual,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    pub id: ConflictId,
    /// The update that failed; owned here until the conflict is resolved
    pub update: OptimisticUpdate,
    /// What the server holds instead
    pub remote_data: Value,
    pub status: ConflictStatus,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an automatic resolution
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub conflict_id: ConflictId,
    pub update: OptimisticUpdate,
    /// Data the remote side held when the conflict was raised
    pub remote_data: Value,
    /// Value to apply locally and re-submit
    pub data: Value,
    pub strategy: ResolutionStrategy,
    pub resolved_at: DateTime<Utc>,
}

/// Compute the resolved value for `local` vs `remote`.
///
/// Returns `None` for [`ResolutionStrategy::Manual`].
pub fn resolve_data(local: &Value, remote: &Value, strategy: &ResolutionStrategy) -> Option<Value> {
    match strategy {
        ResolutionStrategy::LastWriterWins => Some(local.clone()),
        ResolutionStrategy::Merge(Some(merge)) => Some(merge.call(local, remote)),
        ResolutionStrategy::Merge(None) => Some(shallow_merge(remote, local)),
        ResolutionStrategy::VersionBased { local_version } => {
            let local_version = local_version.unwrap_or(0);
            let remote_version = remote.get("version").and_then(Value::as_u64).unwrap_or(0);
            // Ties go to the server
            if local_version > remote_version {
                Some(local.clone())
            } else {
                Some(remote.clone())
            }
        }
        ResolutionStrategy::Manual => None,
    }
}

/// Top-level fields of `overlay` replace those of `base`.
///
/// If either side is not an object, `overlay` wins whole.
pub fn shallow_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}
