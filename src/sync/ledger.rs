//! Optimistic update ledger
//!
//! Tracks mutations that have been applied locally but not yet confirmed
//! by the remote store, plus the conflicts raised when the store rejects
//! one with data of its own. Each outstanding update lives in exactly one
//! place: the pending list or the conflict that took it over.
//!
//! Subscribers are called in registration order, once per state change,
//! with a snapshot taken under the same lock as the change. Snapshots are
//! queued in the order the changes happened and delivered by one thread at
//! a time, so no subscriber ever sees an older list after a newer one. No
//! lock is held while a subscriber runs; a subscriber may call back into
//! the ledger, and the notifications its calls cause are delivered once it
//! returns. A call made while another thread is delivering may return
//! before its own notification has been handed out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::conflict::{resolve_data, Conflict, ConflictStatus, Resolution, ResolutionStrategy};
use super::{ConflictId, UpdateId};
use crate::error::{AirqError, Result};

/// Kind of remote mutation an update stands for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update { document_id: String },
    Delete { document_id: String },
}

/// A UI action about to be applied optimistically
#[derive(Debug, Clone)]
pub struct UpdateDraft {
    pub kind: MutationKind,
    pub collection: String,
    pub data: Value,
    pub previous_data: Option<Value>,
    pub user_id: String,
    pub strategy: Option<ResolutionStrategy>,
}

impl UpdateDraft {
    fn new(kind: MutationKind, collection: &str, data: Value) -> Self {
        Self {
            kind,
            collection: collection.to_string(),
            data,
            previous_data: None,
            user_id: "local".to_string(),
            strategy: None,
        }
    }

    pub fn create(collection: &str, data: Value) -> Self {
        Self::new(MutationKind::Create, collection, data)
    }

    pub fn update(collection: &str, document_id: &str, data: Value) -> Self {
        Self::new(
            MutationKind::Update {
                document_id: document_id.to_string(),
            },
            collection,
            data,
        )
    }

    pub fn delete(collection: &str, document_id: &str) -> Self {
        Self::new(
            MutationKind::Delete {
                document_id: document_id.to_string(),
            },
            collection,
            Value::Null,
        )
    }

    /// Data this update replaces, kept for rollback display
    pub fn with_previous(mut self, previous: Value) -> Self {
        self.previous_data = Some(previous);
        self
    }

    pub fn by_user(mut self, user_id: &str) -> Self {
        self.user_id = user_id.to_string();
        self
    }

    /// Strategy applied automatically if this update conflicts
    pub fn with_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// An update applied locally and awaiting server confirmation.
///
/// Handed to subscribers as part of read-only snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct OptimisticUpdate {
    pub id: UpdateId,
    pub kind: MutationKind,
    pub collection: String,
    pub data: Value,
    pub previous_data: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub strategy: Option<ResolutionStrategy>,
}

/// What `resolve_update` did with an update
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// Id unknown or no longer pending
    NotFound,
    /// Server accepted; entry removed
    Confirmed,
    /// Server rejected without data; entry discarded
    Dropped,
    /// Server rejected with its own data; a conflict now holds the update
    Conflicted(ConflictId),
    /// Conflict raised and settled by the update's own strategy
    AutoResolved(Resolution),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub applied: u64,
    pub confirmed: u64,
    pub dropped: u64,
    pub conflicted: u64,
    pub resolved: u64,
    pub pending: usize,
    pub open_conflicts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type UpdateListener = Arc<dyn Fn(&[OptimisticUpdate]) + Send + Sync>;
type ConflictListener = Arc<dyn Fn(&[Conflict]) + Send + Sync>;

enum Notice {
    Updates(Vec<OptimisticUpdate>),
    Conflicts(Vec<Conflict>),
}

#[derive(Default)]
struct LedgerState {
    pending: Vec<OptimisticUpdate>,
    conflicts: Vec<Conflict>,
    stats: LedgerStats,
}

pub struct OptimisticLedger {
    max_pending: usize,
    state: RwLock<LedgerState>,
    update_listeners: RwLock<Vec<(SubscriptionId, UpdateListener)>>,
    conflict_listeners: RwLock<Vec<(SubscriptionId, ConflictListener)>>,
    next_subscription: AtomicU64,
    /// Snapshots waiting for delivery, in state-change order
    outbox: Mutex<VecDeque<Notice>>,
    delivering: AtomicBool,
}

impl OptimisticLedger {
    pub fn new(max_pending: usize) -> Self {
        Self {
            max_pending,
            state: RwLock::new(LedgerState::default()),
            update_listeners: RwLock::new(Vec::new()),
            conflict_listeners: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            outbox: Mutex::new(VecDeque::new()),
            delivering: AtomicBool::new(false),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(256)
    }

    /// Called with the pending list after every change to it
    pub fn subscribe_updates<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&[OptimisticUpdate]) + Send + Sync + 'static,
    {
        let id = self.next_subscription_id();
        write_lock(&self.update_listeners).push((id, Arc::new(listener)));
        id
    }

    /// Called with the conflict list after every change to it
    pub fn subscribe_conflicts<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&[Conflict]) + Send + Sync + 'static,
    {
        let id = self.next_subscription_id();
        write_lock(&self.conflict_listeners).push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut found = false;
        write_lock(&self.update_listeners).retain(|(sid, _)| {
            let keep = *sid != id;
            found |= !keep;
            keep
        });
        write_lock(&self.conflict_listeners).retain(|(sid, _)| {
            let keep = *sid != id;
            found |= !keep;
            keep
        });
        found
    }

    /// Record an update as locally applied and return its id.
    ///
    /// Never waits on the network; the caller issues the remote mutation
    /// and reports back through [`resolve_update`](Self::resolve_update).
    pub fn apply_update(&self, draft: UpdateDraft) -> Result<UpdateId> {
        let update = OptimisticUpdate {
            id: Uuid::new_v4().to_string(),
            kind: draft.kind,
            collection: draft.collection,
            data: draft.data,
            previous_data: draft.previous_data,
            timestamp: Utc::now(),
            user_id: draft.user_id,
            strategy: draft.strategy,
        };
        let id = update.id.clone();

        {
            let mut state = write_lock(&self.state);
            if state.pending.len() >= self.max_pending {
                warn!(
                    "[Ledger] Rejecting update on {}: {} already pending",
                    update.collection,
                    state.pending.len()
                );
                return Err(AirqError::LedgerFull(state.pending.len()));
            }
            debug!("[Ledger] Applied {} on {} ({:?})", id, update.collection, update.kind);
            state.pending.push(update);
            state.stats.applied += 1;
            self.enqueue(Notice::Updates(state.pending.clone()));
        }

        self.flush();
        Ok(id)
    }

    /// Settle a pending update once the remote call has finished.
    ///
    /// - success: the entry is removed
    /// - failure without `server_data`: the entry is discarded
    /// - failure with `server_data`: the entry moves into a new conflict
    ///   in the same critical section, resolved right away if the update
    ///   carries a non-manual strategy
    pub fn resolve_update(&self, update_id: &str, success: bool, server_data: Option<Value>) -> UpdateOutcome {
        let raised = {
            let mut state = write_lock(&self.state);
            let Some(pos) = state.pending.iter().position(|u| u.id == update_id) else {
                debug!("[Ledger] resolve_update for unknown id {}", update_id);
                return UpdateOutcome::NotFound;
            };
            let update = state.pending.remove(pos);

            let raised = match (success, server_data) {
                (true, _) => {
                    state.stats.confirmed += 1;
                    debug!("[Ledger] Confirmed {}", update_id);
                    None
                }
                (false, None) => {
                    state.stats.dropped += 1;
                    warn!(
                        "[Ledger] Dropped {} on {}: server rejected without data",
                        update_id, update.collection
                    );
                    None
                }
                (false, Some(remote_data)) => {
                    state.stats.conflicted += 1;
                    let strategy = update.strategy.clone();
                    let status = match &strategy {
                        Some(s) if s.is_manual() => ConflictStatus::Manual,
                        _ => ConflictStatus::Pending,
                    };
                    let conflict = Conflict {
                        id: Uuid::new_v4().to_string(),
                        update,
                        remote_data,
                        status,
                        created_at: Utc::now(),
                    };
                    info!(
                        "[Ledger] Conflict {} raised for update {} on {} ({:?})",
                        conflict.id, update_id, conflict.update.collection, status
                    );
                    let conflict_id = conflict.id.clone();
                    state.conflicts.push(conflict);
                    Some((conflict_id, strategy))
                }
            };

            self.enqueue(Notice::Updates(state.pending.clone()));
            if raised.is_some() {
                self.enqueue(Notice::Conflicts(state.conflicts.clone()));
            }
            raised
        };
        self.flush();

        let Some((conflict_id, strategy)) = raised else {
            return if success {
                UpdateOutcome::Confirmed
            } else {
                UpdateOutcome::Dropped
            };
        };

        match strategy {
            Some(strategy) if !strategy.is_manual() => match self.resolve_conflict(&conflict_id, strategy) {
                Some(resolution) => UpdateOutcome::AutoResolved(resolution),
                None => UpdateOutcome::Conflicted(conflict_id),
            },
            _ => UpdateOutcome::Conflicted(conflict_id),
        }
    }

    /// Settle a conflict with `strategy`.
    ///
    /// Automatic strategies remove the conflict (and the update it holds)
    /// and return the value to apply. `Manual` parks the conflict and
    /// returns `None`. Unknown or already settled ids are a no-op.
    pub fn resolve_conflict(&self, conflict_id: &str, strategy: ResolutionStrategy) -> Option<Resolution> {
        let resolution = {
            let mut state = write_lock(&self.state);
            let pos = state.conflicts.iter().position(|c| c.id == conflict_id)?;

            let resolution = if strategy.is_manual() {
                let conflict = &mut state.conflicts[pos];
                if conflict.status == ConflictStatus::Manual {
                    return None;
                }
                conflict.status = ConflictStatus::Manual;
                info!("[Ledger] Conflict {} parked for manual resolution", conflict_id);
                None
            } else {
                let data = {
                    let conflict = &state.conflicts[pos];
                    resolve_data(&conflict.update.data, &conflict.remote_data, &strategy)?
                };
                let conflict = state.conflicts.remove(pos);
                state.stats.resolved += 1;
                info!(
                    "[Ledger] Conflict {} resolved with {} (update {})",
                    conflict_id, strategy, conflict.update.id
                );
                Some(Resolution {
                    conflict_id: conflict.id,
                    update: conflict.update,
                    remote_data: conflict.remote_data,
                    data,
                    strategy,
                    resolved_at: Utc::now(),
                })
            };
            self.enqueue(Notice::Conflicts(state.conflicts.clone()));
            resolution
        };

        self.flush();
        resolution
    }

    pub fn pending_updates(&self) -> Vec<OptimisticUpdate> {
        read_lock(&self.state).pending.clone()
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        read_lock(&self.state).conflicts.clone()
    }

    pub fn get_update(&self, update_id: &str) -> Option<OptimisticUpdate> {
        read_lock(&self.state)
            .pending
            .iter()
            .find(|u| u.id == update_id)
            .cloned()
    }

    pub fn get_conflict(&self, conflict_id: &str) -> Option<Conflict> {
        read_lock(&self.state)
            .conflicts
            .iter()
            .find(|c| c.id == conflict_id)
            .cloned()
    }

    pub fn stats(&self) -> LedgerStats {
        let state = read_lock(&self.state);
        LedgerStats {
            pending: state.pending.len(),
            open_conflicts: state.conflicts.len(),
            ..state.stats
        }
    }

    fn next_subscription_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    /// Called with the state write lock held, so queue order is change order
    fn enqueue(&self, notice: Notice) {
        lock(&self.outbox).push_back(notice);
    }

    /// Deliver queued snapshots unless another call is already doing so.
    fn flush(&self) {
        loop {
            if self
                .delivering
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                return;
            }
            {
                let _delivering = DeliveryGuard(&self.delivering);
                loop {
                    let next = lock(&self.outbox).pop_front();
                    match next {
                        Some(notice) => self.deliver(&notice),
                        None => break,
                    }
                }
            }
            // A notice queued after the last pop but before the flag cleared
            // would otherwise wait for the next change.
            if lock(&self.outbox).is_empty() {
                return;
            }
        }
    }

    fn deliver(&self, notice: &Notice) {
        match notice {
            Notice::Updates(snapshot) => {
                let listeners: Vec<UpdateListener> = read_lock(&self.update_listeners)
                    .iter()
                    .map(|(_, l)| Arc::clone(l))
                    .collect();
                for listener in listeners {
                    listener(snapshot);
                }
            }
            Notice::Conflicts(snapshot) => {
                let listeners: Vec<ConflictListener> = read_lock(&self.conflict_listeners)
                    .iter()
                    .map(|(_, l)| Arc::clone(l))
                    .collect();
                for listener in listeners {
                    listener(snapshot);
                }
            }
        }
    }
}

/// Clears the delivery flag even if a subscriber panics
struct DeliveryGuard<'a>(&'a AtomicBool);

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for OptimisticLedger {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// A panicking subscriber never runs under these locks, so poisoned
// state is still consistent.
fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
