//! Fuzz target for DomainEvent::decode and EventRouter::route
//!
//! This fuzzer feeds arbitrary payloads to the decoder and to both topic
//! routers to find:
//! - Decoder panics on malformed or deeply nested JSON
//! - Payloads that decode but route to keys outside the tenant
//! - Unclassified payloads that do not fall back to the topic family
//!
//! The fuzzer should NEVER panic. Undecodable payloads must still route.

#![no_main]

use libfuzzer_sys::fuzz_target;
use nereo_core::{CacheKey, EventRouter, ReconcilePlan, Scope, Subscription, keys};
use nereo_proto::{DomainEvent, Topic};

const TENANT: &str = "tenant-1";

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };

    let _ = DomainEvent::decode(raw);

    for topic in Topic::ALL {
        let router = EventRouter::new(Subscription::new(topic, Scope::tenant(TENANT)));
        let routed = router.route(raw);

        if !routed.is_classified() {
            assert_eq!(
                routed.plan(),
                &ReconcilePlan::InvalidateFamily { family: keys::family(topic, TENANT) },
                "unclassified payload must invalidate the family"
            );
        }

        for key in plan_keys(routed.plan()) {
            let tenant_scoped = key.segments().get(1).is_some_and(|s| s == TENANT);
            let detail = matches!(key.segments().first().map(String::as_str), Some("booking"));
            assert!(tenant_scoped || detail, "plan touches foreign key {key}");
        }
    }
});

fn plan_keys(plan: &ReconcilePlan) -> Vec<&CacheKey> {
    match plan {
        ReconcilePlan::Merge { key, .. } => vec![key],
        ReconcilePlan::Invalidate { keys } => keys.iter().collect(),
        ReconcilePlan::InvalidateFamily { family } => vec![family],
    }
}
