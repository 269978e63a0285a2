//! Subscription scopes and the cache key layout derived from them.
//!
//! Every cache key starts with a resource name and is then narrowed by tenant
//! and, where the data is branch-specific, by branch. The tenant always comes
//! second so that `{resource}/{tenant}` selects a tenant's whole family.
//! Detail entries (`subscriber/{id}`, `booking/{id}`) are keyed by record id
//! only, since ids are globally unique.

use std::fmt;

use nereo_proto::{Topic, paths};

use crate::CacheKey;

/// Tenant (and optionally branch) a view is looking at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    /// Tenant id, taken from the decoded session token.
    pub tenant_id: String,
    /// Selected branch, if any.
    pub branch_id: Option<String>,
}

impl Scope {
    /// Tenant-wide scope.
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self { tenant_id: tenant_id.into(), branch_id: None }
    }

    /// Scope narrowed to one branch.
    #[must_use]
    pub fn with_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }
}

/// A push stream for one topic of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    /// Stream topic.
    pub topic: Topic,
    /// Tenant and branch the stream serves.
    pub scope: Scope,
}

impl Subscription {
    /// Create a subscription.
    pub fn new(topic: Topic, scope: Scope) -> Self {
        Self { topic, scope }
    }

    /// Stable topic key, e.g. `bookings/tenant-1`.
    ///
    /// Two subscriptions with the same key share one connection. A branch
    /// change does not change the key, the stream is tenant-wide.
    pub fn key(&self) -> String {
        format!("{}/{}", self.topic, self.scope.tenant_id)
    }

    /// SSE path of the stream.
    pub fn path(&self) -> String {
        paths::sse(self.topic, &self.scope.tenant_id)
    }

    /// Cache family invalidated when an event cannot be classified.
    pub fn family(&self) -> CacheKey {
        keys::family(self.topic, &self.scope.tenant_id)
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Cache key layout.
pub mod keys {
    use nereo_proto::Topic;

    use crate::CacheKey;

    /// Everything a topic stream can affect for a tenant: `{topic}/{tenant}`.
    pub fn family(topic: Topic, tenant_id: &str) -> CacheKey {
        CacheKey::new([topic.as_str(), tenant_id])
    }

    /// Dashboard KPI snapshot: `analytics/{tenant}/kpis`.
    pub fn kpis(tenant_id: &str) -> CacheKey {
        family(Topic::Analytics, tenant_id).child("kpis")
    }

    /// Revenue series family: `analytics/{tenant}/revenue`.
    pub fn revenue(tenant_id: &str) -> CacheKey {
        family(Topic::Analytics, tenant_id).child("revenue")
    }

    /// All subscriber lists of a tenant: `subscribers/{tenant}`.
    pub fn subscribers(tenant_id: &str) -> CacheKey {
        CacheKey::new(["subscribers", tenant_id])
    }

    /// Subscriber list of one branch: `subscribers/{tenant}/{branch}`.
    pub fn subscriber_list(tenant_id: &str, branch_id: Option<&str>) -> CacheKey {
        let family = subscribers(tenant_id);
        match branch_id {
            Some(branch) => family.child(branch),
            None => family,
        }
    }

    /// One subscriber's detail: `subscriber/{id}`.
    pub fn subscriber(subscriber_id: &str) -> CacheKey {
        CacheKey::new(["subscriber", subscriber_id])
    }

    /// All kanban boards of a tenant: `bookings/{tenant}`.
    pub fn bookings(tenant_id: &str) -> CacheKey {
        family(Topic::Bookings, tenant_id)
    }

    /// Kanban board of one branch: `bookings/{tenant}/{branch}`.
    pub fn booking_board(tenant_id: &str, branch_id: Option<&str>) -> CacheKey {
        let family = bookings(tenant_id);
        match branch_id {
            Some(branch) => family.child(branch),
            None => family,
        }
    }

    /// One booking's detail: `booking/{id}`.
    pub fn booking(booking_id: &str) -> CacheKey {
        CacheKey::new(["booking", booking_id])
    }
}
