//! Query cache store.
//!
//! Holds one JSON snapshot of server data per [`CacheKey`] together with a
//! staleness flag. Keys are ordered path segments, so "every entry of tenant
//! T" is a key prefix and family invalidation is a range scan over the ordered
//! map.
//!
//! Reads are public. Writes are `pub(crate)`: only the
//! [`Reconciler`](crate::Reconciler) and the
//! [`MutationCoordinator`](crate::MutationCoordinator) mutate entries, which
//! keeps the merge-only-if-present and restore-from-snapshot rules in one
//! place.

use std::{collections::BTreeMap, fmt};

use serde_json::{Map, Value};

/// Key of a cache entry: ordered path segments such as
/// `["analytics", "tenant-1", "kpis"]`.
///
/// A key is also a prefix selecting every key that starts with the same
/// segments. The empty key selects everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CacheKey(Vec<String>);

impl CacheKey {
    /// Build a key from its segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// The empty key, a prefix of every key.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Segments of this key.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// This key extended by one segment.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// True if `prefix` is a (non-strict) prefix of this key.
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the root key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// One cached server snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    value: Value,
    stale: bool,
}

impl CacheEntry {
    /// Fresh entry holding `value`.
    pub fn fresh(value: Value) -> Self {
        Self { value, stale: false }
    }

    /// Cached value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// True once the entry has been invalidated and not yet refetched.
    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

/// Result of a field merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Fields were written into the entry.
    Applied {
        /// Number of fields in the partial.
        fields: usize,
    },
    /// No entry under the key. Nothing was written.
    Missing,
    /// The entry is not a JSON object. Nothing was written.
    NotAnObject,
}

/// In-memory store from [`CacheKey`] to [`CacheEntry`].
#[derive(Debug, Clone, Default)]
pub struct QueryCache {
    entries: BTreeMap<CacheKey, CacheEntry>,
}

impl QueryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value under `key`, stale or not.
    pub fn get(&self, key: &CacheKey) -> Option<&Value> {
        self.entries.get(key).map(CacheEntry::value)
    }

    /// Entry under `key`.
    pub fn entry(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// True if an entry exists under `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Staleness of `key`. `None` if absent.
    pub fn is_stale(&self, key: &CacheKey) -> Option<bool> {
        self.entries.get(key).map(CacheEntry::is_stale)
    }

    /// All keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.keys()
    }

    /// Keys that start with `prefix`, in order.
    pub fn keys_under(&self, prefix: &CacheKey) -> Vec<CacheKey> {
        self.entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Keys that need a refetch, in order.
    pub fn stale_keys(&self) -> Vec<CacheKey> {
        self.entries.iter().filter(|(_, e)| e.stale).map(|(k, _)| k.clone()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store authoritative server data. Clears staleness.
    pub(crate) fn put_fresh(&mut self, key: CacheKey, value: Value) {
        self.entries.insert(key, CacheEntry::fresh(value));
    }

    /// Store server data that is already known to be outdated.
    pub(crate) fn put_stale(&mut self, key: CacheKey, value: Value) {
        self.entries.insert(key, CacheEntry { value, stale: true });
    }

    /// Shallow merge of `partial` into the object under `key`.
    pub(crate) fn merge_fields(
        &mut self,
        key: &CacheKey,
        partial: &Map<String, Value>,
    ) -> MergeOutcome {
        let Some(entry) = self.entries.get_mut(key) else {
            return MergeOutcome::Missing;
        };
        let Value::Object(object) = &mut entry.value else {
            return MergeOutcome::NotAnObject;
        };

        for (field, value) in partial {
            object.insert(field.clone(), value.clone());
        }

        MergeOutcome::Applied { fields: partial.len() }
    }

    /// Mark every entry under `prefix` stale. Returns the affected keys.
    pub(crate) fn mark_stale(&mut self, prefix: &CacheKey) -> Vec<CacheKey> {
        let keys = self.keys_under(prefix);
        for key in &keys {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.stale = true;
            }
        }
        keys
    }

    /// Overwrite the value under `key`, keeping its staleness. Creates a
    /// fresh entry if none exists.
    pub(crate) fn write(&mut self, key: &CacheKey, value: Value) {
        match self.entries.get_mut(key) {
            Some(entry) => entry.value = value,
            None => {
                self.entries.insert(key.clone(), CacheEntry::fresh(value));
            },
        }
    }

    /// Put `key` back to a previously captured entry.
    ///
    /// `None` removes the key. Staleness recorded since the snapshot is kept:
    /// an invalidation that arrived in the meantime still needs its refetch.
    pub(crate) fn restore(&mut self, key: &CacheKey, snapshot: Option<CacheEntry>) {
        match snapshot {
            None => {
                self.entries.remove(key);
            },
            Some(snapshot) => {
                let stale = snapshot.stale || self.entries.get(key).is_some_and(|e| e.stale);
                self.entries.insert(key.clone(), CacheEntry { value: snapshot.value, stale });
            },
        }
    }
}
