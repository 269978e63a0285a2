//! Property tests for event decoding.
//!
//! Push payloads come from the network and must never take a channel down, so
//! decoding is exercised with arbitrary text as well as with well-formed
//! envelopes carrying arbitrary type names.

use nereo_proto::{DecodeError, DomainEvent, EventKind};
use proptest::prelude::*;

/// Type names that are not in the known set.
fn unknown_type_strategy() -> impl Strategy<Value = String> {
    "[a-z_]{1,24}".prop_filter("must not be a known kind", |name| {
        EventKind::from_type_name(name).is_none()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// Arbitrary text decodes to a value or an error, never a panic.
    #[test]
    fn prop_decode_never_panics(raw in any::<String>()) {
        let _ = DomainEvent::decode(&raw);
    }

    /// Arbitrary JSON-ish bytes decode to a value or an error, never a panic.
    #[test]
    fn prop_decode_never_panics_on_json_fragments(
        raw in r#"[\{\}\[\]":,a-z0-9 ]{0,64}"#,
    ) {
        let _ = DomainEvent::decode(&raw);
    }

    /// Unknown type names are always reported as `UnknownType` with the name.
    #[test]
    fn prop_unknown_types_are_named(name in unknown_type_strategy()) {
        let raw = format!(r#"{{"type":"{name}","payload":{{}}}}"#);
        prop_assert_eq!(DomainEvent::decode(&raw), Err(DecodeError::UnknownType(name)));
    }

    /// Any numeric KPI payload survives decoding field for field.
    #[test]
    fn prop_kpi_payload_preserved(revenue in any::<i64>(), churn in 0u32..100) {
        let raw = format!(
            r#"{{"type":"kpi_updated","payload":{{"monthlyRevenue":{revenue},"churnRate":{churn}}}}}"#
        );
        let event = DomainEvent::decode(&raw).unwrap();
        match event {
            DomainEvent::KpiUpdated { payload, .. } => {
                prop_assert_eq!(payload["monthlyRevenue"].as_i64(), Some(revenue));
                prop_assert_eq!(payload["churnRate"].as_u64(), Some(u64::from(churn)));
            },
            other => prop_assert!(false, "unexpected event {:?}", other),
        }
    }
}

#[test]
fn every_known_kind_decodes_from_minimal_envelope() {
    for kind in EventKind::ALL {
        let raw = match kind {
            EventKind::KpiUpdated => r#"{"type":"kpi_updated","payload":{}}"#.to_string(),
            other => format!(r#"{{"type":"{other}"}}"#),
        };
        let event = DomainEvent::decode(&raw).unwrap();
        assert_eq!(event.kind(), kind);
    }
}
