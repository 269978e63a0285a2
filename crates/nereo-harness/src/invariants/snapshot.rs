//! Observable state extracted from a simulated world.
//!
//! Snapshots are plain data: invariants check them and insta serializes them,
//! so nothing in here refers back to the live world.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

/// Complete observable state of a simulation at one instant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemSnapshot {
    /// Virtual time, milliseconds since the start of the run
    pub now_ms: u64,
    /// Every channel, including closed ones
    pub channels: Vec<ChannelSnapshot>,
    /// Cache contents by key
    pub cache: BTreeMap<String, EntrySnapshot>,
    /// Keys ever written by a load or a speculative write
    pub loaded: BTreeSet<String>,
    /// Writes still waiting for the server
    pub pending_writes: usize,
    /// Writes the server rejected
    pub rolled_back: usize,
    /// Failure notices shown to the user
    pub notices: usize,
    /// Rollbacks whose keys nothing else touched, with what they restored
    pub rollbacks: Vec<RollbackRecord>,
}

/// Observable state of one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    /// Topic key
    pub key: String,
    /// Connection state name
    pub state: String,
    /// Consecutive failures
    pub retry_count: u32,
    /// Fallback polling flag
    pub fallback_polling: bool,
    /// Published polling interval
    pub polling_interval_ms: u64,
    /// Configured fallback polling interval
    pub fallback_interval_ms: u64,
    /// Configured connect timeout
    pub connect_timeout_ms: u64,
    /// Configured reconnect delay cap
    pub max_retry_delay_ms: u64,
    /// Transports the server still considers alive
    pub live_transports: usize,
    /// Next timer, if any
    pub next_deadline_ms: Option<u64>,
    /// Set once the channel was closed
    pub closed: bool,
    /// Connection requests so far
    pub connects: usize,
}

/// One cache entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySnapshot {
    /// Cached value
    pub value: Value,
    /// Needs a refetch
    pub stale: bool,
}

/// Value of one key before a write and after its rollback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackRecord {
    /// Mutation sequence number
    pub mutation: u64,
    /// Key the write touched
    pub key: String,
    /// Value before the write, `None` if absent
    pub before: Option<Value>,
    /// Value after the rollback, `None` if absent
    pub restored: Option<Value>,
}

impl SystemSnapshot {
    /// Empty snapshot at time zero.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a channel.
    #[must_use]
    pub fn with_channel(mut self, channel: ChannelSnapshot) -> Self {
        self.channels.push(channel);
        self
    }

    /// Add a cache entry, also recording it as loaded.
    #[must_use]
    pub fn with_entry(mut self, key: impl Into<String>, value: Value, stale: bool) -> Self {
        let key = key.into();
        self.loaded.insert(key.clone());
        self.cache.insert(key, EntrySnapshot { value, stale });
        self
    }

    /// Add a rollback record.
    #[must_use]
    pub fn with_rollback(mut self, record: RollbackRecord) -> Self {
        self.rollbacks.push(record);
        self
    }

    /// Channel with topic key `key`.
    pub fn channel(&self, key: &str) -> Option<&ChannelSnapshot> {
        self.channels.iter().find(|c| c.key == key)
    }
}

impl ChannelSnapshot {
    /// Connected channel with default timings and one transport.
    pub fn connected(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: "connected".to_owned(),
            retry_count: 0,
            fallback_polling: false,
            polling_interval_ms: 0,
            fallback_interval_ms: 15_000,
            connect_timeout_ms: 5_000,
            max_retry_delay_ms: 30_000,
            live_transports: 1,
            next_deadline_ms: None,
            closed: false,
            connects: 1,
        }
    }
}
