//! Event routing.
//!
//! Turns the raw payload of one push message into a [`ReconcilePlan`] for the
//! cache. Routing never fails: anything that cannot be classified (malformed
//! JSON, an unknown `type`, an event that does not belong on this topic) falls
//! back to invalidating the whole topic family, so the views refetch instead of
//! showing data the client could not interpret.

use nereo_proto::{DecodeError, DomainEvent};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{CacheKey, Subscription, scope::keys};

/// What the reconciler should do with the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcilePlan {
    /// Shallow field merge into one existing entry
    Merge {
        /// Entry to merge into
        key: CacheKey,
        /// Fields to overwrite
        partial: Map<String, Value>,
    },

    /// Mark the entries under each key stale
    Invalidate {
        /// Key prefixes to invalidate
        keys: Vec<CacheKey>,
    },

    /// Mark everything the topic feeds stale
    InvalidateFamily {
        /// Topic family prefix
        family: CacheKey,
    },
}

/// Result of routing one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Known event for this topic
    Classified {
        /// Decoded event
        event: DomainEvent,
        /// Targeted plan
        plan: ReconcilePlan,
    },

    /// Well-formed, but not an event this topic handles
    Unrecognized {
        /// `type` field of the payload
        event_type: String,
        /// Family invalidation
        plan: ReconcilePlan,
    },

    /// Could not be decoded at all
    Undecodable {
        /// Decode failure
        error: DecodeError,
        /// Family invalidation
        plan: ReconcilePlan,
    },
}

impl Routed {
    /// Plan to apply, whatever the classification.
    pub fn plan(&self) -> &ReconcilePlan {
        match self {
            Self::Classified { plan, .. }
            | Self::Unrecognized { plan, .. }
            | Self::Undecodable { plan, .. } => plan,
        }
    }

    /// Consume into the plan.
    pub fn into_plan(self) -> ReconcilePlan {
        match self {
            Self::Classified { plan, .. }
            | Self::Unrecognized { plan, .. }
            | Self::Undecodable { plan, .. } => plan,
        }
    }

    /// True for [`Routed::Classified`].
    pub fn is_classified(&self) -> bool {
        matches!(self, Self::Classified { .. })
    }
}

/// Router for the messages of one subscription.
#[derive(Debug, Clone)]
pub struct EventRouter {
    subscription: Subscription,
}

impl EventRouter {
    /// Router for `subscription`.
    pub fn new(subscription: Subscription) -> Self {
        Self { subscription }
    }

    /// Subscription this router serves.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Classify one raw payload.
    pub fn route(&self, raw: &str) -> Routed {
        match DomainEvent::decode(raw) {
            Ok(event) => match self.plan_for(&event) {
                Some(plan) => {
                    debug!(channel = %self.subscription, kind = %event.kind(), "routed event");
                    Routed::Classified { event, plan }
                },
                None => {
                    warn!(
                        channel = %self.subscription,
                        kind = %event.kind(),
                        "event does not belong on this topic"
                    );
                    Routed::Unrecognized {
                        event_type: event.kind().as_str().to_owned(),
                        plan: self.family_plan(),
                    }
                },
            },
            Err(DecodeError::UnknownType(event_type)) => {
                warn!(channel = %self.subscription, %event_type, "unknown event type");
                Routed::Unrecognized { event_type, plan: self.family_plan() }
            },
            Err(error) => {
                warn!(channel = %self.subscription, %error, "undecodable event");
                Routed::Undecodable { error, plan: self.family_plan() }
            },
        }
    }

    /// Targeted plan for a decoded event. `None` if the event's home topic is
    /// not this router's topic.
    pub fn plan_for(&self, event: &DomainEvent) -> Option<ReconcilePlan> {
        if event.kind().topic() != self.subscription.topic {
            return None;
        }

        let tenant = self.subscription.scope.tenant_id.as_str();
        let plan = match event {
            DomainEvent::KpiUpdated { payload, .. } => {
                ReconcilePlan::Merge { key: keys::kpis(tenant), partial: payload.clone() }
            },
            DomainEvent::PaymentProcessed { .. } => ReconcilePlan::Invalidate {
                keys: vec![keys::kpis(tenant), keys::revenue(tenant)],
            },
            DomainEvent::SubscriptionChanged { .. } => ReconcilePlan::Invalidate {
                keys: vec![keys::kpis(tenant), keys::subscribers(tenant)],
            },
            DomainEvent::BookingCompleted { .. } => {
                ReconcilePlan::Invalidate { keys: vec![keys::kpis(tenant)] }
            },
            DomainEvent::BookingCreated(change)
            | DomainEvent::BookingUpdated(change)
            | DomainEvent::BookingStatusChanged(change) => {
                let mut targets = vec![keys::bookings(tenant)];
                if let Some(id) = change.booking_id.as_deref() {
                    targets.push(keys::booking(id));
                }
                ReconcilePlan::Invalidate { keys: targets }
            },
        };

        Some(plan)
    }

    fn family_plan(&self) -> ReconcilePlan {
        ReconcilePlan::InvalidateFamily { family: self.subscription.family() }
    }
}
