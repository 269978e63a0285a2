//! Simulated backend.
//!
//! Holds the authoritative value of every query the simulation registers,
//! keyed by the cache key the client stores it under. Accepted writes are
//! applied with the same field rewrites the client shows speculatively, then
//! placeholder ids are replaced by server ids.

use std::collections::BTreeMap;

use nereo_core::{CacheKey, Scope, SpeculativeUpdate, keys};
use serde_json::{Value, json};

use crate::model::SEEDED_RECORDS;

/// Prefix of client-side placeholder ids.
const TEMP_ID_PREFIX: &str = "temp-";

/// Authoritative state of the simulated backend.
#[derive(Debug, Clone, Default)]
pub struct SimServer {
    records: BTreeMap<CacheKey, Value>,
    next_id: u64,
    accepted_writes: usize,
}

impl SimServer {
    /// Server with no data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Server holding a KPI snapshot, a subscriber list, one subscriber
    /// detail and a kanban board for `scope`.
    pub fn seeded(scope: &Scope) -> Self {
        let tenant = scope.tenant_id.as_str();
        let branch = scope.branch_id.as_deref();
        let mut server = Self { next_id: u64::from(SEEDED_RECORDS), ..Self::default() };

        server.set(
            keys::kpis(tenant),
            json!({"monthlyRevenue": 4000, "activeSubscribers": 3, "washesToday": 12}),
        );

        let subscribers: Vec<Value> = (0..SEEDED_RECORDS)
            .map(|i| {
                json!({
                    "id": format!("s{i}"),
                    "fullName": format!("Subscriber {i}"),
                    "plate": format!("PLT-{i:03}"),
                    "status": "active",
                })
            })
            .collect();
        if let Some(first) = subscribers.first() {
            server.set(keys::subscriber("s0"), first.clone());
        }
        server.set(keys::subscriber_list(tenant, branch), Value::Array(subscribers));

        let board = (0..SEEDED_RECORDS)
            .map(|i| {
                json!({"id": format!("b{i}"), "plate": format!("BKG-{i:03}"), "status": "waiting"})
            })
            .collect();
        server.set(keys::booking_board(tenant, branch), Value::Array(board));

        server
    }

    /// Authoritative value under `key`.
    pub fn get(&self, key: &CacheKey) -> Option<&Value> {
        self.records.get(key)
    }

    /// Overwrite the value under `key`.
    pub fn set(&mut self, key: CacheKey, value: Value) {
        self.records.insert(key, value);
    }

    /// Keys the server can answer.
    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.records.keys()
    }

    /// Writes accepted so far.
    pub fn accepted_writes(&self) -> usize {
        self.accepted_writes
    }

    /// Apply an accepted write.
    pub fn accept(&mut self, update: &SpeculativeUpdate) {
        self.accepted_writes += 1;

        for key in update.affected() {
            if let Some(value) = update.apply(&key, self.records.get(&key)) {
                let value = self.assign_ids(value);
                self.records.insert(key, value);
            }
        }
    }

    fn assign_ids(&mut self, value: Value) -> Value {
        let Value::Array(items) = value else {
            return value;
        };

        let items = items
            .into_iter()
            .map(|mut item| {
                let is_placeholder = item
                    .get("id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| id.starts_with(TEMP_ID_PREFIX));
                if is_placeholder && let Some(object) = item.as_object_mut() {
                    object.insert("id".to_owned(), Value::String(format!("s{}", self.next_id)));
                    self.next_id += 1;
                }
                item
            })
            .collect();
        Value::Array(items)
    }
}
