//! Optimistic mutation coordinator.
//!
//! A mutation is begun before its network request is sent: the coordinator
//! snapshots every affected entry, cancels in-flight fetches for them and
//! applies the speculative update right away. When the request completes, the
//! driver settles the mutation exactly once:
//!
//! - `Commit`: the affected entries are invalidated so the server's version
//!   replaces the speculative one on the next refetch.
//! - `Rollback`: every entry the speculative update wrote is put back to its
//!   snapshot, then every affected entry is invalidated, and one
//!   [`FailureNotice`] is produced for the user. An entry the write created
//!   is removed again, unless a fetch replaced it while the write was
//!   pending.
//!
//! # State Machine
//!
//! ```text
//!            settle(Commit)     ┌───────────┐
//!         ┌───────────────────> │ Committed │
//! ┌─────────┐                   └───────────┘
//! │ Pending │
//! └─────────┘                   ┌────────────┐
//!         └───────────────────> │ RolledBack │
//!            settle(Rollback)   └────────────┘
//! ```
//!
//! Settling a mutation that is no longer pending (or was never begun) returns
//! [`Settlement::AlreadySettled`] and does not touch the cache.

use std::{collections::BTreeMap, fmt};

use serde_json::Value;
use tracing::{debug, warn};

use crate::{CacheKey, cache::CacheEntry, reconciler::Reconciler};

/// Identifier of a mutation, unique per coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

impl MutationId {
    /// Raw id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Lifecycle of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    /// Speculative value visible, request in flight
    Pending,
    /// Server accepted the write
    Committed,
    /// Server rejected the write, snapshots restored
    RolledBack,
}

/// How the network request of a mutation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 2xx
    Commit,
    /// Anything else
    Rollback {
        /// Server-provided explanation, if any
        message: Option<String>,
    },
}

/// User-facing notification of a rolled back mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureNotice {
    /// Mutation that failed
    pub mutation: MutationId,
    /// Entity the mutation targeted
    pub target: String,
    /// Message shown to the user
    pub message: String,
    /// Server-provided explanation, if any
    pub detail: Option<String>,
}

impl fmt::Display for FailureNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.message, detail),
            None => f.write_str(&self.message),
        }
    }
}

/// Result of [`MutationCoordinator::settle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Mutation committed, these keys were invalidated
    Committed {
        /// Invalidated keys
        invalidated: Vec<CacheKey>,
    },
    /// Mutation rolled back, snapshots restored and these keys invalidated
    RolledBack {
        /// The single notice for this failure
        notice: FailureNotice,
        /// Invalidated keys
        invalidated: Vec<CacheKey>,
    },
    /// Mutation was not pending. Nothing happened.
    AlreadySettled,
}

/// What a mutation is about to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRequest {
    /// Entity id, for logs and the failure notice
    pub target: String,
    /// Entries the speculative update may touch
    pub affected: Vec<CacheKey>,
    /// Message shown to the user if the write is rejected
    pub failure_notice: String,
}

impl MutationRequest {
    /// Request targeting `target`, touching no entries yet.
    pub fn new(target: impl Into<String>, failure_notice: impl Into<String>) -> Self {
        Self { target: target.into(), affected: Vec::new(), failure_notice: failure_notice.into() }
    }

    /// Add an affected entry.
    #[must_use]
    pub fn affecting(mut self, key: CacheKey) -> Self {
        if !self.affected.contains(&key) {
            self.affected.push(key);
        }
        self
    }
}

/// An entry the speculative update wrote.
#[derive(Debug, Clone)]
struct SpeculativeWrite {
    key: CacheKey,
    snapshot: Option<CacheEntry>,
    value: Value,
}

#[derive(Debug, Clone)]
struct PendingMutation {
    target: String,
    failure_notice: String,
    affected: Vec<CacheKey>,
    writes: Vec<SpeculativeWrite>,
    state: MutationState,
}

/// Tracks pending mutations and their snapshots.
#[derive(Debug, Clone, Default)]
pub struct MutationCoordinator {
    next_id: u64,
    mutations: BTreeMap<MutationId, PendingMutation>,
}

impl MutationCoordinator {
    /// Coordinator with no mutations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a mutation.
    ///
    /// For every affected key, in order: cancel in-flight fetches, then call
    /// `update` with the current value. `Some` snapshots the entry and writes
    /// the speculative value, `None` leaves the entry untouched.
    pub fn begin<F>(
        &mut self,
        reconciler: &mut Reconciler,
        request: MutationRequest,
        mut update: F,
    ) -> MutationId
    where
        F: FnMut(&CacheKey, Option<&Value>) -> Option<Value>,
    {
        self.next_id += 1;
        let id = MutationId(self.next_id);

        let mut writes = Vec::with_capacity(request.affected.len());
        for key in &request.affected {
            let snapshot = reconciler.snapshot(key);
            reconciler.cancel_fetches(key);

            if let Some(value) = update(key, snapshot.as_ref().map(CacheEntry::value)) {
                reconciler.write(key, value.clone());
                writes.push(SpeculativeWrite { key: key.clone(), snapshot, value });
            }
        }

        debug!(
            mutation = %id,
            target = %request.target,
            keys = request.affected.len(),
            written = writes.len(),
            "mutation begun"
        );
        self.mutations.insert(id, PendingMutation {
            target: request.target,
            failure_notice: request.failure_notice,
            affected: request.affected,
            writes,
            state: MutationState::Pending,
        });

        id
    }

    /// Settle a mutation. Only the first call for a given id has an effect.
    pub fn settle(
        &mut self,
        reconciler: &mut Reconciler,
        id: MutationId,
        outcome: Outcome,
    ) -> Settlement {
        let Some(mutation) = self.mutations.get_mut(&id) else {
            debug!(mutation = %id, "settle of unknown mutation");
            return Settlement::AlreadySettled;
        };

        if mutation.state != MutationState::Pending {
            debug!(mutation = %id, state = ?mutation.state, "mutation already settled");
            return Settlement::AlreadySettled;
        }

        let writes = std::mem::take(&mut mutation.writes);
        let affected = std::mem::take(&mut mutation.affected);
        match outcome {
            Outcome::Commit => {
                mutation.state = MutationState::Committed;
                let invalidated = invalidate_all(reconciler, &affected);

                debug!(mutation = %id, target = %mutation.target, "mutation committed");
                Settlement::Committed { invalidated }
            },
            Outcome::Rollback { message } => {
                mutation.state = MutationState::RolledBack;

                for write in writes.into_iter().rev() {
                    undo(reconciler, write);
                }
                let invalidated = invalidate_all(reconciler, &affected);

                warn!(
                    mutation = %id,
                    target = %mutation.target,
                    detail = message.as_deref().unwrap_or(""),
                    "mutation rolled back"
                );
                Settlement::RolledBack {
                    notice: FailureNotice {
                        mutation: id,
                        target: mutation.target.clone(),
                        message: mutation.failure_notice.clone(),
                        detail: message,
                    },
                    invalidated,
                }
            },
        }
    }

    /// State of a mutation. `None` if it was never begun.
    pub fn state(&self, id: MutationId) -> Option<MutationState> {
        self.mutations.get(&id).map(|m| m.state)
    }

    /// Ids of all pending mutations, oldest first.
    pub fn pending(&self) -> Vec<MutationId> {
        self.mutations
            .iter()
            .filter(|(_, m)| m.state == MutationState::Pending)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Snapshot a pending mutation holds for `key`.
    ///
    /// Outer `None`: no such pending mutation, or the mutation did not write
    /// `key`. Inner `None`: the entry did not exist when the mutation began.
    pub fn snapshot(&self, id: MutationId, key: &CacheKey) -> Option<Option<&Value>> {
        self.mutations
            .get(&id)?
            .writes
            .iter()
            .find(|write| &write.key == key)
            .map(|write| write.snapshot.as_ref().map(CacheEntry::value))
    }
}

fn invalidate_all(reconciler: &mut Reconciler, keys: &[CacheKey]) -> Vec<CacheKey> {
    let mut invalidated = Vec::new();
    for key in keys {
        for stale in reconciler.invalidate(key) {
            if !invalidated.contains(&stale) {
                invalidated.push(stale);
            }
        }
    }
    invalidated
}

/// Put one speculative write back.
///
/// An entry the write created is only removed while it still holds the
/// speculative value. Anything else got there from the server.
fn undo(reconciler: &mut Reconciler, write: SpeculativeWrite) {
    match write.snapshot {
        Some(snapshot) => reconciler.restore(&write.key, Some(snapshot)),
        None if reconciler.cache().get(&write.key) == Some(&write.value) => {
            reconciler.restore(&write.key, None);
        },
        None => debug!(key = %write.key, "keeping entry stored while the write was pending"),
    }
}
