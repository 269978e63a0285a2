//! Standard invariant checks.
//!
//! These invariants capture behavioral properties that must always hold.
//! They verify WHAT must be true, not specific test scenarios.

use super::{Invariant, InvariantResult, SystemSnapshot, Violation};

/// Published status fields agree with each other.
///
/// The polling interval is the configured fallback interval exactly while the
/// fallback flag is set, zero otherwise. A connected channel has no retries
/// and is not polling.
pub struct StatusConsistency;

impl Invariant for StatusConsistency {
    fn name(&self) -> &'static str {
        "status_consistency"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for channel in &state.channels {
            let expected_interval =
                if channel.fallback_polling { channel.fallback_interval_ms } else { 0 };
            if channel.polling_interval_ms != expected_interval {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "{}: fallback={} but polling every {}ms",
                        channel.key, channel.fallback_polling, channel.polling_interval_ms
                    ),
                });
            }

            let backing_off = channel.retry_count != 0 || channel.fallback_polling;
            if channel.state == "connected" && backing_off {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "{}: connected with retry_count={} fallback={}",
                        channel.key, channel.retry_count, channel.fallback_polling
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Exactly one transport is alive while a channel is connecting or
/// connected, none otherwise.
///
/// A second transport means a replaced attempt was never closed. A transport
/// on a closed or backing-off channel is a leak.
pub struct TransportAccounting;

impl Invariant for TransportAccounting {
    fn name(&self) -> &'static str {
        "transport_accounting"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for channel in &state.channels {
            let active = !channel.closed
                && matches!(channel.state.as_str(), "connecting" | "connected");
            let expected = usize::from(active);
            if channel.live_transports != expected {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "{}: {} live transports in state {} (closed={})",
                        channel.key, channel.live_transports, channel.state, channel.closed
                    ),
                });
            }
        }
        Ok(())
    }
}

/// An open channel that is not connected always has a timer pending, no
/// further away than the longer of connect timeout and reconnect cap.
///
/// Reconnection never stalls, however many attempts failed.
pub struct ReconnectProgress;

impl Invariant for ReconnectProgress {
    fn name(&self) -> &'static str {
        "reconnect_progress"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for channel in &state.channels {
            if channel.closed || channel.state == "connected" {
                continue;
            }

            let Some(deadline) = channel.next_deadline_ms else {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("{}: {} with no timer pending", channel.key, channel.state),
                });
            };

            let horizon = channel.connect_timeout_ms.max(channel.max_retry_delay_ms);
            let wait = deadline.saturating_sub(state.now_ms);
            if wait > horizon {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "{}: next timer in {}ms, beyond the {}ms horizon",
                        channel.key, wait, horizon
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Push events never create entries.
///
/// Every cached key was written by a load or a speculative write. A merge
/// into a key nobody loaded must leave the cache without it.
pub struct NoPhantomEntries;

impl Invariant for NoPhantomEntries {
    fn name(&self) -> &'static str {
        "no_phantom_entries"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        match state.cache.keys().find(|key| !state.loaded.contains(*key)) {
            Some(key) => Err(Violation {
                invariant: self.name(),
                message: format!("{key} is cached but was never loaded"),
            }),
            None => Ok(()),
        }
    }
}

/// A rolled back write leaves its keys exactly as they were before it began,
/// provided nothing else wrote them in between.
pub struct RollbackExactness;

impl Invariant for RollbackExactness {
    fn name(&self) -> &'static str {
        "rollback_exactness"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        match state.rollbacks.iter().find(|r| r.before != r.restored) {
            Some(record) => Err(Violation {
                invariant: self.name(),
                message: format!(
                    "write {} on {}: before {:?}, restored {:?}",
                    record.mutation, record.key, record.before, record.restored
                ),
            }),
            None => Ok(()),
        }
    }
}

/// Every rejected write produces exactly one notice.
pub struct OneNoticePerRollback;

impl Invariant for OneNoticePerRollback {
    fn name(&self) -> &'static str {
        "one_notice_per_rollback"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        if state.notices == state.rolled_back {
            Ok(())
        } else {
            Err(Violation {
                invariant: self.name(),
                message: format!(
                    "{} notices for {} rolled back writes",
                    state.notices, state.rolled_back
                ),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::invariants::{ChannelSnapshot, RollbackRecord};

    #[test]
    fn connected_channel_passes_status_checks() {
        let state = SystemSnapshot::empty().with_channel(ChannelSnapshot::connected("a/t"));
        assert!(StatusConsistency.check(&state).is_ok());
        assert!(TransportAccounting.check(&state).is_ok());
        assert!(ReconnectProgress.check(&state).is_ok());
    }

    #[test]
    fn polling_without_fallback_is_inconsistent() {
        let mut channel = ChannelSnapshot::connected("a/t");
        channel.polling_interval_ms = 15_000;
        let state = SystemSnapshot::empty().with_channel(channel);

        let violation = StatusConsistency.check(&state).unwrap_err();
        assert_eq!(violation.invariant, "status_consistency");
    }

    #[test]
    fn leaked_transport_is_caught() {
        let mut channel = ChannelSnapshot::connected("a/t");
        channel.state = "reconnecting".to_owned();
        channel.next_deadline_ms = Some(1_000);
        let state = SystemSnapshot::empty().with_channel(channel);

        assert!(TransportAccounting.check(&state).is_err());
    }

    #[test]
    fn stalled_reconnect_is_caught() {
        let mut channel = ChannelSnapshot::connected("a/t");
        channel.state = "reconnecting".to_owned();
        channel.live_transports = 0;
        let state = SystemSnapshot::empty().with_channel(channel.clone());
        assert!(ReconnectProgress.check(&state).is_err());

        channel.next_deadline_ms = Some(31_000);
        let state = SystemSnapshot::empty().with_channel(channel);
        assert!(ReconnectProgress.check(&state).is_err());
    }

    #[test]
    fn phantom_entry_is_caught() {
        let mut state = SystemSnapshot::empty().with_entry("analytics/t/kpis", json!({}), false);
        assert!(NoPhantomEntries.check(&state).is_ok());

        state.loaded.clear();
        assert!(NoPhantomEntries.check(&state).is_err());
    }

    #[test]
    fn inexact_rollback_is_caught() {
        let state = SystemSnapshot::empty().with_rollback(RollbackRecord {
            mutation: 1,
            key: "subscribers/t/b".to_owned(),
            before: Some(json!([{"id": "s1", "status": "active"}])),
            restored: Some(json!([{"id": "s1", "status": "paused"}])),
        });
        assert!(RollbackExactness.check(&state).is_err());
    }

    #[test]
    fn missing_notice_is_caught() {
        let state = SystemSnapshot { rolled_back: 2, notices: 1, ..SystemSnapshot::empty() };
        assert!(OneNoticePerRollback.check(&state).is_err());
    }
}
