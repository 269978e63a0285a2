//! Cache reconciler.
//!
//! Single entry point for every write to the [`QueryCache`]: push-driven
//! merges and invalidations, refetch results, and the speculative writes and
//! restores of the mutation coordinator.
//!
//! # Fetch tickets
//!
//! A refetch is a round trip: the driver calls [`Reconciler::begin_fetch`],
//! performs the GET without holding any lock, then hands the body to
//! [`Reconciler::complete_fetch`]. Each key carries a generation that is bumped
//! whenever a fetch in flight must not land, which is what starting an
//! optimistic mutation does for the keys it touches. A ticket whose generation
//! no longer matches is dropped, so a response requested before the
//! speculative write cannot overwrite it.
//!
//! Invalidations do not cancel a fetch. A ticket also records how many
//! invalidations had covered its key when it was issued. If another one
//! arrives while the GET is in flight, the response still lands (it is the
//! newest server data there is) but the entry stays stale, so the next
//! refetch round picks up whatever the push event announced.
//!
//! # Invariants
//!
//! - A merge never creates an entry.
//! - A merge only touches the live entry. Snapshots held by pending mutations
//!   are owned copies.
//! - `complete_fetch` stores only if no cancellation happened since
//!   `begin_fetch`.
//! - An entry invalidated after `begin_fetch` is still stale after
//!   `complete_fetch`.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    CacheKey, ReconcilePlan,
    cache::{CacheEntry, MergeOutcome, QueryCache},
};

/// An in-flight refetch of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    key: CacheKey,
    generation: u64,
    invalidations: u64,
}

impl FetchTicket {
    /// Key being fetched.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Generation of the key when the fetch started.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Result of [`Reconciler::complete_fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Response stored, entry is fresh
    Stored,
    /// Response stored, but the key was invalidated while the fetch was in
    /// flight. The entry stays stale.
    StoredStale,
    /// Fetch was cancelled while in flight. Response dropped.
    Superseded,
}

/// Result of [`Reconciler::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A merge plan was applied
    Merged(MergeOutcome),
    /// An invalidation plan marked these keys stale
    Invalidated(Vec<CacheKey>),
}

/// Owner of the query cache.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    cache: QueryCache,
    generations: BTreeMap<CacheKey, u64>,
    invalidations: BTreeMap<CacheKey, u64>,
}

impl Reconciler {
    /// Reconciler over an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access to the cache.
    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Shallow field merge into the entry under `key`.
    ///
    /// No-op if the entry is absent or not a JSON object.
    pub fn merge(&mut self, key: &CacheKey, partial: &Map<String, Value>) -> MergeOutcome {
        let outcome = self.cache.merge_fields(key, partial);
        match outcome {
            MergeOutcome::Applied { fields } => debug!(%key, fields, "merged fields"),
            MergeOutcome::Missing => debug!(%key, "merge skipped, entry not cached"),
            MergeOutcome::NotAnObject => debug!(%key, "merge skipped, entry not an object"),
        }
        outcome
    }

    /// Mark every entry under `prefix` stale. Returns the affected keys.
    ///
    /// Fetches in flight for keys under `prefix` keep their entry stale when
    /// they land, whether or not the entry exists yet.
    pub fn invalidate(&mut self, prefix: &CacheKey) -> Vec<CacheKey> {
        let keys = self.cache.mark_stale(prefix);

        let mut in_flight = 0;
        for (key, count) in self.invalidations.range_mut(prefix.clone()..) {
            if !key.starts_with(prefix) {
                break;
            }
            *count = count.wrapping_add(1);
            in_flight += 1;
        }

        debug!(%prefix, count = keys.len(), in_flight, "invalidated");
        keys
    }

    /// Execute a routed plan.
    pub fn apply(&mut self, plan: &ReconcilePlan) -> ApplyOutcome {
        match plan {
            ReconcilePlan::Merge { key, partial } => ApplyOutcome::Merged(self.merge(key, partial)),
            ReconcilePlan::Invalidate { keys } => {
                let mut stale = Vec::new();
                for key in keys {
                    stale.extend(self.invalidate(key));
                }
                ApplyOutcome::Invalidated(stale)
            },
            ReconcilePlan::InvalidateFamily { family } => {
                ApplyOutcome::Invalidated(self.invalidate(family))
            },
        }
    }

    /// Store authoritative server data under `key`, fresh.
    ///
    /// For data loaded outside the ticket protocol (initial loads, tests).
    pub fn store(&mut self, key: CacheKey, value: Value) {
        self.cache.put_fresh(key, value);
    }

    /// Start a refetch of `key`.
    pub fn begin_fetch(&mut self, key: &CacheKey) -> FetchTicket {
        let invalidations = *self.invalidations.entry(key.clone()).or_insert(0);
        FetchTicket { key: key.clone(), generation: self.generation(key), invalidations }
    }

    /// Land a refetch.
    ///
    /// Dropped if the key's fetches were cancelled meanwhile. Stored but left
    /// stale if the key was invalidated meanwhile.
    pub fn complete_fetch(&mut self, ticket: FetchTicket, value: Value) -> FetchOutcome {
        if self.generation(&ticket.key) != ticket.generation {
            debug!(key = %ticket.key, "dropping superseded fetch");
            return FetchOutcome::Superseded;
        }

        let invalidated = self.invalidations.get(&ticket.key).copied().unwrap_or(0);
        if invalidated != ticket.invalidations {
            debug!(key = %ticket.key, "fetch landed after an invalidation, keeping it stale");
            self.cache.put_stale(ticket.key, value);
            return FetchOutcome::StoredStale;
        }

        self.cache.put_fresh(ticket.key, value);
        FetchOutcome::Stored
    }

    /// Entries that need a refetch.
    pub fn stale_keys(&self) -> Vec<CacheKey> {
        self.cache.stale_keys()
    }

    /// Current fetch generation of `key`.
    pub fn generation(&self, key: &CacheKey) -> u64 {
        self.generations.get(key).copied().unwrap_or(0)
    }

    /// Invalidate every outstanding ticket for `key`.
    pub(crate) fn cancel_fetches(&mut self, key: &CacheKey) {
        let generation = self.generations.entry(key.clone()).or_insert(0);
        *generation = generation.wrapping_add(1);
    }

    /// Owned copy of the entry under `key`.
    pub(crate) fn snapshot(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.cache.entry(key).cloned()
    }

    /// Speculative write. Keeps the entry's staleness.
    pub(crate) fn write(&mut self, key: &CacheKey, value: Value) {
        self.cache.write(key, value);
    }

    /// Put `key` back to a snapshot taken by [`Reconciler::snapshot`].
    pub(crate) fn restore(&mut self, key: &CacheKey, snapshot: Option<CacheEntry>) {
        self.cache.restore(key, snapshot);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::scope::keys;

    fn partial(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn kpi_merge_keeps_other_fields() {
        let mut rec = Reconciler::new();
        let kpis = keys::kpis("tenant-1");
        rec.store(kpis.clone(), json!({"monthlyRevenue": 400, "churnRate": 2}));

        let outcome = rec.apply(&ReconcilePlan::Merge {
            key: kpis.clone(),
            partial: partial(json!({"monthlyRevenue": 500})),
        });

        assert_eq!(outcome, ApplyOutcome::Merged(MergeOutcome::Applied { fields: 1 }));
        assert_eq!(rec.cache().get(&kpis), Some(&json!({"monthlyRevenue": 500, "churnRate": 2})));
        assert_eq!(rec.cache().is_stale(&kpis), Some(false));
    }

    #[test]
    fn merge_never_materializes() {
        let mut rec = Reconciler::new();
        let kpis = keys::kpis("tenant-1");

        let outcome = rec.merge(&kpis, &partial(json!({"monthlyRevenue": 500})));
        assert_eq!(outcome, MergeOutcome::Missing);
        assert!(rec.cache().is_empty());
    }

    #[test]
    fn family_invalidation_covers_all_entries() {
        let mut rec = Reconciler::new();
        rec.store(keys::kpis("t1"), json!({}));
        rec.store(keys::revenue("t1").child("month"), json!([]));
        rec.store(keys::kpis("t2"), json!({}));

        let plan = ReconcilePlan::InvalidateFamily {
            family: keys::family(nereo_proto::Topic::Analytics, "t1"),
        };
        let ApplyOutcome::Invalidated(stale) = rec.apply(&plan) else {
            panic!("expected invalidation");
        };

        assert_eq!(stale.len(), 2);
        assert_eq!(rec.cache().is_stale(&keys::kpis("t2")), Some(false));
    }

    #[test]
    fn fetch_lands_and_clears_staleness() {
        let mut rec = Reconciler::new();
        let list = keys::bookings("t1");
        rec.store(list.clone(), json!([]));
        rec.invalidate(&list);
        assert_eq!(rec.stale_keys(), vec![list.clone()]);

        let ticket = rec.begin_fetch(&list);
        assert_eq!(rec.complete_fetch(ticket, json!([{"id": "b-1"}])), FetchOutcome::Stored);
        assert!(rec.stale_keys().is_empty());
        assert_eq!(rec.cache().get(&list), Some(&json!([{"id": "b-1"}])));
    }

    #[test]
    fn cancelled_fetch_is_dropped() {
        let mut rec = Reconciler::new();
        let list = keys::subscriber_list("t1", Some("b1"));
        rec.store(list.clone(), json!([{"id": "s1", "status": "active"}]));

        let ticket = rec.begin_fetch(&list);
        rec.cancel_fetches(&list);
        rec.write(&list, json!([{"id": "s1", "status": "paused"}]));

        let stale_body = json!([{"id": "s1", "status": "active"}]);
        assert_eq!(rec.complete_fetch(ticket, stale_body), FetchOutcome::Superseded);
        assert_eq!(rec.cache().get(&list), Some(&json!([{"id": "s1", "status": "paused"}])));

        let ticket = rec.begin_fetch(&list);
        assert_eq!(ticket.generation(), 1);
        assert_eq!(rec.complete_fetch(ticket, json!([])), FetchOutcome::Stored);
    }

    #[test]
    fn invalidation_during_fetch_keeps_entry_stale() {
        let mut rec = Reconciler::new();
        let board = keys::booking_board("t1", None);
        let before = json!([{"id": "b1", "status": "waiting"}]);
        rec.store(board.clone(), before.clone());

        let ticket = rec.begin_fetch(&board);
        rec.invalidate(&keys::bookings("t1"));

        assert_eq!(rec.complete_fetch(ticket, before.clone()), FetchOutcome::StoredStale);
        assert_eq!(rec.cache().get(&board), Some(&before));
        assert_eq!(rec.cache().is_stale(&board), Some(true));
        assert_eq!(rec.stale_keys(), vec![board.clone()]);

        let ticket = rec.begin_fetch(&board);
        let after = json!([{"id": "b1", "status": "ready"}]);
        assert_eq!(rec.complete_fetch(ticket, after), FetchOutcome::Stored);
        assert!(rec.stale_keys().is_empty());
    }

    #[test]
    fn invalidation_during_first_load_keeps_entry_stale() {
        let mut rec = Reconciler::new();
        let kpis = keys::kpis("t1");

        let ticket = rec.begin_fetch(&kpis);
        assert!(rec.invalidate(&keys::family(nereo_proto::Topic::Analytics, "t1")).is_empty());

        let outcome = rec.complete_fetch(ticket, json!({"monthlyRevenue": 400}));
        assert_eq!(outcome, FetchOutcome::StoredStale);
        assert_eq!(rec.stale_keys(), vec![kpis]);
    }

    #[test]
    fn invalidation_of_another_family_leaves_fetch_fresh() {
        let mut rec = Reconciler::new();
        let kpis = keys::kpis("t1");

        let ticket = rec.begin_fetch(&kpis);
        rec.invalidate(&keys::kpis("t2"));

        assert_eq!(rec.complete_fetch(ticket, json!({})), FetchOutcome::Stored);
        assert_eq!(rec.cache().is_stale(&kpis), Some(false));
    }
}
