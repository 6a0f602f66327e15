//! Drives optimistic updates through the remote store
//!
//! The ledger never touches the network. The engine records the update,
//! issues the matching mutation, and reports the result back to the ledger.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::conflict::{Resolution, ResolutionStrategy};
use super::ledger::{MutationKind, OptimisticLedger, UpdateDraft, UpdateOutcome};
use crate::error::Result;
use crate::store::{Mutation, MutationFailure, RemoteStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Updates allowed in flight before `apply_update` refuses (default: 256)
    pub max_pending: usize,
    /// Per-attempt mutation timeout (default: 10s)
    pub mutation_timeout_ms: u64,
    /// Retries for failures without server data (default: 2)
    pub max_retries: u32,
    /// First retry delay, doubled each attempt (default: 200ms)
    pub retry_base_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_pending: 256,
            mutation_timeout_ms: 10_000,
            max_retries: 2,
            retry_base_delay_ms: 200,
        }
    }
}

impl SyncConfig {
    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_millis(self.mutation_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

pub struct SyncEngine {
    ledger: Arc<OptimisticLedger>,
    store: Arc<dyn RemoteStore>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        let ledger = Arc::new(OptimisticLedger::new(config.max_pending));
        Self::with_ledger(ledger, store, config)
    }

    /// Share an existing ledger, e.g. one the UI already subscribes to
    pub fn with_ledger(ledger: Arc<OptimisticLedger>, store: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        Self { ledger, store, config }
    }

    pub fn ledger(&self) -> &Arc<OptimisticLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Apply `draft` locally, then push it to the store.
    ///
    /// Failures without server data (including timeouts) are retried with
    /// exponential backoff; once retries run out the update is dropped.
    /// A failure with server data is handed to the ledger as a conflict
    /// straight away.
    pub async fn submit(&self, draft: UpdateDraft) -> Result<UpdateOutcome> {
        let mutation = to_mutation(&draft.kind, &draft.collection, &draft.data);
        let update_id = self.ledger.apply_update(draft)?;
        debug!("[Sync] Submitting {} as {}", update_id, mutation.path());

        let mut attempt = 0u32;
        let mut delay = self.config.retry_base_delay();
        loop {
            let failure = match timeout(self.config.mutation_timeout(), self.store.mutate(mutation.clone())).await {
                Ok(Ok(_)) => {
                    debug!("[Sync] {} confirmed after {} retries", update_id, attempt);
                    return Ok(self.ledger.resolve_update(&update_id, true, None));
                }
                Ok(Err(failure)) => failure,
                Err(_) => MutationFailure::new(format!(
                    "Timed out after {}ms",
                    self.config.mutation_timeout_ms
                )),
            };

            let MutationFailure { message, server_data } = failure;
            if let Some(server_data) = server_data {
                info!("[Sync] {} rejected with server data: {}", update_id, message);
                return Ok(self.ledger.resolve_update(&update_id, false, Some(server_data)));
            }

            if attempt >= self.config.max_retries {
                warn!(
                    "[Sync] {} failed after {} attempts, giving up: {}",
                    update_id,
                    attempt + 1,
                    message
                );
                return Ok(self.ledger.resolve_update(&update_id, false, None));
            }

            attempt += 1;
            warn!(
                "[Sync] {} failed ({}), retry {}/{} in {:?}",
                update_id, message, attempt, self.config.max_retries, delay
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    /// Push a resolved value back to the store as a fresh update.
    ///
    /// The data is rebased onto the remote version and a conflicting create
    /// becomes an update of the document the server already has. The new
    /// update carries no strategy, so a second conflict is left to the
    /// caller. If the server already holds the resolved value nothing is sent.
    pub async fn reapply(&self, resolution: &Resolution) -> Result<UpdateOutcome> {
        if resolution.data == resolution.remote_data {
            debug!(
                "[Sync] Conflict {} resolved to the server copy, nothing to send",
                resolution.conflict_id
            );
            return Ok(UpdateOutcome::Confirmed);
        }

        let update = &resolution.update;
        let remote_id = resolution.remote_data.get("_id").and_then(Value::as_str);
        let kind = match (&update.kind, remote_id) {
            (MutationKind::Create, Some(id)) => MutationKind::Update {
                document_id: id.to_string(),
            },
            (kind, _) => kind.clone(),
        };

        let mut data = resolution.data.clone();
        if let Some(version) = resolution.remote_data.get("version").and_then(Value::as_u64) {
            rebase_version(&mut data, version);
        }

        info!(
            "[Sync] Reapplying conflict {} ({}) on {}",
            resolution.conflict_id, resolution.strategy, update.collection
        );
        let draft = UpdateDraft {
            kind,
            collection: update.collection.clone(),
            data,
            previous_data: Some(resolution.remote_data.clone()),
            user_id: update.user_id.clone(),
            strategy: None,
        };
        self.submit(draft).await
    }

    /// Resolve a conflict on the ledger and push the result.
    ///
    /// `None` when nothing was resolved: unknown id, or `Manual`.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<Option<UpdateOutcome>> {
        match self.ledger.resolve_conflict(conflict_id, strategy) {
            Some(resolution) => self.reapply(&resolution).await.map(Some),
            None => Ok(None),
        }
    }
}

/// Store mutation for an update. Deletes check the `version` in `data`, if any.
pub fn to_mutation(kind: &MutationKind, collection: &str, data: &Value) -> Mutation {
    match kind {
        MutationKind::Create => Mutation::CreateDocument {
            collection: collection.to_string(),
            data: data.clone(),
        },
        MutationKind::Update { document_id } => Mutation::UpdateDocument {
            collection: collection.to_string(),
            id: document_id.clone(),
            data: data.clone(),
        },
        MutationKind::Delete { document_id } => Mutation::DeleteDocument {
            collection: collection.to_string(),
            id: document_id.clone(),
            expected_version: data.get("version").and_then(Value::as_u64),
        },
    }
}

fn rebase_version(data: &mut Value, version: u64) {
    match data {
        Value::Object(map) => {
            map.insert("version".to_string(), json!(version));
        }
        Value::Null => *data = json!({ "version": version }),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.max_pending, 256);
        assert_eq!(config.mutation_timeout(), Duration::from_secs(10));
        assert_eq!(config.retry_base_delay(), Duration::from_millis(200));
    }

    #[test]
    fn test_to_mutation() {
        let m = to_mutation(&MutationKind::Create, "notes", &json!({ "text": "a" }));
        assert_eq!(m.path(), "documents:create");

        let m = to_mutation(
            &MutationKind::Update { document_id: "n1".to_string() },
            "notes",
            &json!({ "text": "a" }),
        );
        assert!(matches!(m, Mutation::UpdateDocument { ref id, .. } if id == "n1"));

        let m = to_mutation(
            &MutationKind::Delete { document_id: "n1".to_string() },
            "notes",
            &json!({ "version": 3 }),
        );
        assert_eq!(m.args()["expectedVersion"], 3);

        let m = to_mutation(&MutationKind::Delete { document_id: "n1".to_string() }, "notes", &Value::Null);
        assert!(m.args()["expectedVersion"].is_null());
    }

    #[test]
    fn test_rebase_version() {
        let mut data = json!({ "text": "a", "version": 1 });
        rebase_version(&mut data, 5);
        assert_eq!(data, json!({ "text": "a", "version": 5 }));

        let mut data = Value::Null;
        rebase_version(&mut data, 2);
        assert_eq!(data, json!({ "version": 2 }));
    }
}
