//! Optimistic synchronisation
//!
//! - `ledger`: locally applied updates awaiting confirmation, plus open conflicts
//! - `conflict`: strategies for settling a rejected update against server data
//! - `engine`: pushes updates to a [`RemoteStore`](crate::store::RemoteStore) and feeds results back

pub mod conflict;
pub mod engine;
pub mod ledger;


pub use conflict::{resolve_data, shallow_merge, Conflict, ConflictStatus, MergeFn, Resolution, ResolutionStrategy};
pub use engine::{SyncConfig, SyncEngine};
pub use ledger::{
    LedgerStats, MutationKind, OptimisticLedger, OptimisticUpdate, SubscriptionId, UpdateDraft, UpdateOutcome,
};

pub type UpdateId = String;
pub type ConflictId = String;
