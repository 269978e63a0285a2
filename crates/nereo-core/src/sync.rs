//! Owner of the shared cache state.
//!
//! [`SyncCore`] bundles the reconciler (and through it the query cache) with
//! the mutation coordinator. Both write paths, push events and optimistic
//! mutations, go through it, so a driver needs exactly one lock around one
//! value.

use serde_json::Value;

use crate::{
    ApplyOutcome, CacheKey, EventRouter, FetchOutcome, FetchTicket, MutationCoordinator,
    MutationId, MutationRequest, Outcome, QueryCache, Reconciler, Routed, Settlement,
    SpeculativeUpdate,
};

/// Cache plus pending mutations.
#[derive(Debug, Clone, Default)]
pub struct SyncCore {
    reconciler: Reconciler,
    mutations: MutationCoordinator,
}

impl SyncCore {
    /// Empty cache, no mutations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access to the cache.
    pub fn cache(&self) -> &QueryCache {
        self.reconciler.cache()
    }

    /// Read access to the reconciler.
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Read access to the mutation coordinator.
    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    /// Route one raw push payload and apply the resulting plan.
    pub fn ingest(&mut self, router: &EventRouter, raw: &str) -> (Routed, ApplyOutcome) {
        let routed = router.route(raw);
        let outcome = self.reconciler.apply(routed.plan());
        (routed, outcome)
    }

    /// Mark every entry under `prefix` stale.
    pub fn invalidate(&mut self, prefix: &CacheKey) -> Vec<CacheKey> {
        self.reconciler.invalidate(prefix)
    }

    /// Store authoritative data under `key`.
    pub fn store(&mut self, key: CacheKey, value: Value) {
        self.reconciler.store(key, value);
    }

    /// Start a refetch of `key`.
    pub fn begin_fetch(&mut self, key: &CacheKey) -> FetchTicket {
        self.reconciler.begin_fetch(key)
    }

    /// Land a refetch.
    pub fn complete_fetch(&mut self, ticket: FetchTicket, value: Value) -> FetchOutcome {
        self.reconciler.complete_fetch(ticket, value)
    }

    /// Entries that need a refetch.
    pub fn stale_keys(&self) -> Vec<CacheKey> {
        self.reconciler.stale_keys()
    }

    /// Begin a mutation with a custom update.
    pub fn begin<F>(&mut self, request: MutationRequest, update: F) -> MutationId
    where
        F: FnMut(&CacheKey, Option<&Value>) -> Option<Value>,
    {
        self.mutations.begin(&mut self.reconciler, request, update)
    }

    /// Begin one of the domain updates.
    pub fn begin_update(&mut self, update: &SpeculativeUpdate) -> MutationId {
        self.mutations.begin(&mut self.reconciler, update.request(), |key, current| {
            update.apply(key, current)
        })
    }

    /// Settle a mutation.
    pub fn settle(&mut self, id: MutationId, outcome: Outcome) -> Settlement {
        self.mutations.settle(&mut self.reconciler, id, outcome)
    }
}

#[cfg(test)]
mod tests {
    use nereo_proto::{SubscriberAction, Topic};
    use serde_json::json;

    use super::*;
    use crate::{Scope, Subscription, scope::keys};

    #[test]
    fn ingest_merges_kpis() {
        let mut core = SyncCore::new();
        let subscription = Subscription::new(Topic::Analytics, Scope::tenant("tenant-1"));
        let router = EventRouter::new(subscription);
        core.store(keys::kpis("tenant-1"), json!({"monthlyRevenue": 400, "churnRate": 2}));

        let (routed, _) =
            core.ingest(&router, r#"{"type":"kpi_updated","payload":{"monthlyRevenue":500}}"#);

        assert!(routed.is_classified());
        assert_eq!(
            core.cache().get(&keys::kpis("tenant-1")),
            Some(&json!({"monthlyRevenue": 500, "churnRate": 2}))
        );
    }

    #[test]
    fn failed_pause_restores_status() {
        let mut core = SyncCore::new();
        let scope = Scope::tenant("t1").with_branch("b1");
        let list = keys::subscriber_list("t1", Some("b1"));
        let detail = keys::subscriber("s");
        core.store(list.clone(), json!([{"id": "s", "status": "active"}]));
        core.store(detail.clone(), json!({"id": "s", "status": "active"}));

        let update = SpeculativeUpdate::subscriber_status(scope, "s", SubscriberAction::Pause);
        let id = core.begin_update(&update);
        assert_eq!(core.cache().get(&detail).map(|v| &v["status"]), Some(&json!("paused")));

        let settlement = core.settle(id, Outcome::Rollback { message: None });
        assert!(matches!(settlement, Settlement::RolledBack { .. }));
        assert_eq!(core.cache().get(&list), Some(&json!([{"id": "s", "status": "active"}])));
        assert_eq!(core.cache().get(&detail), Some(&json!({"id": "s", "status": "active"})));
        assert_eq!(core.settle(id, Outcome::Commit), Settlement::AlreadySettled);
    }
}
