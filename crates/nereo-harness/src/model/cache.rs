//! Reference cache.
//!
//! The simplest implementation of the cache rules that could work: a map of
//! `(value, stale)` pairs, a per-key generation counter, a log of every
//! invalidated prefix and a list of snapshots per pending write. No routing
//! tables, no coordinator state machine. Model-based tests run the same
//! operations against [`ModelCache`] and `SyncCore` and compare
//! [`ModelCache::observable`] after every step.

use std::collections::BTreeMap;

use nereo_core::{CacheKey, ReconcilePlan, SpeculativeUpdate, SyncCore};
use serde_json::Value;

/// Cache contents as tests compare them: value and staleness per key.
pub type Observable = BTreeMap<CacheKey, (Value, bool)>;

/// A refetch in flight: key, generation and length of the invalidation log
/// when it started.
pub type ModelTicket = (CacheKey, u64, usize);

#[derive(Debug, Clone)]
struct ModelWrite {
    affected: Vec<CacheKey>,
    written: Vec<(CacheKey, Option<(Value, bool)>, Value)>,
}

/// Reference implementation of the cache, fetch tickets and write rollback.
#[derive(Debug, Clone, Default)]
pub struct ModelCache {
    entries: Observable,
    generations: BTreeMap<CacheKey, u64>,
    invalidated: Vec<CacheKey>,
    pending: BTreeMap<u64, ModelWrite>,
    next_write: u64,
}

impl ModelCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Authoritative data, fresh.
    pub fn store(&mut self, key: CacheKey, value: Value) {
        self.entries.insert(key, (value, false));
    }

    /// Apply a routed plan.
    pub fn apply(&mut self, plan: &ReconcilePlan) {
        match plan {
            ReconcilePlan::Merge { key, partial } => {
                if let Some((Value::Object(object), _)) = self.entries.get_mut(key) {
                    for (field, value) in partial {
                        object.insert(field.clone(), value.clone());
                    }
                }
            },
            ReconcilePlan::Invalidate { keys } => {
                for key in keys {
                    self.invalidate(key);
                }
            },
            ReconcilePlan::InvalidateFamily { family } => self.invalidate(family),
        }
    }

    /// Mark everything under `prefix` stale.
    pub fn invalidate(&mut self, prefix: &CacheKey) {
        for (key, (_, stale)) in &mut self.entries {
            if key.starts_with(prefix) {
                *stale = true;
            }
        }
        self.invalidated.push(prefix.clone());
    }

    /// Ticket for a refetch of `key`.
    pub fn begin_fetch(&self, key: &CacheKey) -> ModelTicket {
        (key.clone(), self.generation(key), self.invalidated.len())
    }

    /// Land a refetch. `None` if a write hit the key since the ticket,
    /// otherwise whether the stored entry is stale.
    pub fn complete_fetch(&mut self, ticket: ModelTicket, value: Value) -> Option<bool> {
        let (key, generation, since) = ticket;
        if self.generation(&key) != generation {
            return None;
        }
        let stale = self.invalidated[since..].iter().any(|prefix| key.starts_with(prefix));
        self.entries.insert(key, (value, stale));
        Some(stale)
    }

    /// Begin a write. Returns its sequence number.
    pub fn begin(&mut self, update: &SpeculativeUpdate) -> u64 {
        self.next_write += 1;
        let affected = update.affected();
        let mut written = Vec::new();

        for key in &affected {
            let snapshot = self.entries.get(key).cloned();
            *self.generations.entry(key.clone()).or_default() += 1;

            if let Some(value) = update.apply(key, snapshot.as_ref().map(|(v, _)| v)) {
                let stale = snapshot.as_ref().is_some_and(|(_, stale)| *stale);
                self.entries.insert(key.clone(), (value.clone(), stale));
                written.push((key.clone(), snapshot, value));
            }
        }

        self.pending.insert(self.next_write, ModelWrite { affected, written });
        self.next_write
    }

    /// Settle write `id`. False if it was not pending.
    pub fn settle(&mut self, id: u64, commit: bool) -> bool {
        let Some(write) = self.pending.remove(&id) else {
            return false;
        };

        if !commit {
            for (key, snapshot, speculative) in write.written.into_iter().rev() {
                match snapshot {
                    Some((value, was_stale)) => {
                        let stale = was_stale || self.entries.get(&key).is_some_and(|(_, s)| *s);
                        self.entries.insert(key, (value, stale));
                    },
                    None => {
                        if self.entries.get(&key).map(|(v, _)| v) == Some(&speculative) {
                            self.entries.remove(&key);
                        }
                    },
                }
            }
        }

        for key in &write.affected {
            self.invalidate(key);
        }
        true
    }

    /// Keys of stale entries.
    pub fn stale_keys(&self) -> Vec<CacheKey> {
        self.entries.iter().filter(|(_, (_, stale))| *stale).map(|(k, _)| k.clone()).collect()
    }

    /// Current contents.
    pub fn observable(&self) -> &Observable {
        &self.entries
    }

    fn generation(&self, key: &CacheKey) -> u64 {
        self.generations.get(key).copied().unwrap_or(0)
    }
}

/// Contents of a real cache in the same shape as [`ModelCache::observable`].
pub fn observe(core: &SyncCore) -> Observable {
    let cache = core.cache();
    cache
        .keys()
        .filter_map(|key| {
            let entry = cache.entry(key)?;
            Some((key.clone(), (entry.value().clone(), entry.is_stale())))
        })
        .collect()
}
