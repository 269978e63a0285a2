//! Property-based tests for the push channel state machine.
//!
//! Arbitrary sequences of transport events and clock advances are fed into a
//! channel. After every step the observable status must be consistent with the
//! state, stale attempts must be inert, and a closed channel must stay silent.
//! A channel whose streams never open must end up polling.

use std::time::{Duration, Instant};

use nereo_core::{
    Channel, ChannelAction, ChannelConfig, ChannelState, Scope, Subscription,
    channel::DEFAULT_FALLBACK_POLL_INTERVAL,
};
use nereo_proto::Topic;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Step {
    /// Transport of `current - lag` opened
    Opened { lag: u64 },
    /// Transport of `current - lag` failed
    Failed { lag: u64 },
    /// Transport of `current - lag` delivered a message
    Message { lag: u64 },
    /// Advance the clock
    Advance { millis: u64 },
    /// Advance to the next deadline and tick
    Fire,
    /// Close the channel
    Close,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0u64..3).prop_map(|lag| Step::Opened { lag }),
        3 => (0u64..3).prop_map(|lag| Step::Failed { lag }),
        2 => (0u64..3).prop_map(|lag| Step::Message { lag }),
        2 => (0u64..40_000).prop_map(|millis| Step::Advance { millis }),
        4 => Just(Step::Fire),
        1 => Just(Step::Close),
    ]
}

fn new_channel() -> Channel<Instant> {
    let sub = Subscription::new(Topic::Bookings, Scope::tenant("tenant-1"));
    Channel::new(&sub, ChannelConfig::default())
}

fn apply(ch: &mut Channel<Instant>, now: &mut Instant, step: &Step) -> Vec<ChannelAction> {
    match *step {
        Step::Opened { lag } => {
            let attempt = ch.attempt().saturating_sub(lag);
            ch.handle_opened(attempt, *now)
        },
        Step::Failed { lag } => {
            let attempt = ch.attempt().saturating_sub(lag);
            ch.handle_error(attempt, *now)
        },
        Step::Message { lag } => {
            let attempt = ch.attempt().saturating_sub(lag);
            ch.handle_message(attempt, "{}".to_string())
        },
        Step::Advance { millis } => {
            *now += Duration::from_millis(millis);
            ch.tick(*now)
        },
        Step::Fire => {
            if let Some(deadline) = ch.next_deadline() {
                *now = (*now).max(deadline);
            }
            ch.tick(*now)
        },
        Step::Close => ch.close(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Status snapshot agrees with the state machine after every step.
    #[test]
    fn prop_status_is_consistent(steps in prop::collection::vec(step_strategy(), 0..64)) {
        let mut now = Instant::now();
        let mut ch = new_channel();
        ch.open(now).unwrap();

        for step in &steps {
            let actions = apply(&mut ch, &mut now, step);

            for action in &actions {
                if let ChannelAction::StatusChanged(status) = action {
                    prop_assert_eq!(*status, ch.status());
                }
            }

            if ch.state() == ChannelState::Connected {
                prop_assert_eq!(ch.polling_interval(), Duration::ZERO);
                prop_assert!(!ch.is_fallback());
                prop_assert_eq!(ch.retry_count(), 0);
            }

            if ch.is_fallback() {
                prop_assert_eq!(ch.polling_interval(), DEFAULT_FALLBACK_POLL_INTERVAL);
            }
        }
    }

    /// Events tagged with an old attempt never produce actions or change state.
    #[test]
    fn prop_stale_attempts_are_inert(
        steps in prop::collection::vec(step_strategy(), 0..32),
        lag in 1u64..4,
    ) {
        let mut now = Instant::now();
        let mut ch = new_channel();
        ch.open(now).unwrap();

        for step in &steps {
            apply(&mut ch, &mut now, step);

            let stale = ch.attempt().saturating_sub(lag);
            if stale == ch.attempt() {
                continue;
            }

            let before = ch.status();
            prop_assert!(ch.handle_opened(stale, now).is_empty());
            let body = "{}".to_string();
            prop_assert!(ch.handle_message(stale, body).is_empty());
            prop_assert!(ch.handle_error(stale, now).is_empty());
            prop_assert_eq!(ch.status(), before);
        }
    }

    /// Once closed, nothing the transport or the clock does produces actions.
    #[test]
    fn prop_closed_channel_is_silent(
        before in prop::collection::vec(step_strategy(), 0..16),
        after in prop::collection::vec(step_strategy(), 0..32),
    ) {
        let mut now = Instant::now();
        let mut ch = new_channel();
        ch.open(now).unwrap();

        for step in &before {
            apply(&mut ch, &mut now, step);
        }
        ch.close();

        for step in &after {
            prop_assert!(apply(&mut ch, &mut now, step).is_empty());
            prop_assert_eq!(ch.state(), ChannelState::Disconnected);
            prop_assert_eq!(ch.polling_interval(), Duration::ZERO);
        }
        prop_assert_eq!(ch.next_deadline(), None);
    }

    /// The N-th consecutive failure waits `min(base * 2^(N-1), max)`.
    #[test]
    fn prop_backoff_delay_matches_formula(failures in 1u32..12) {
        let config = ChannelConfig::default();
        let mut now = Instant::now();
        let mut ch = new_channel();
        ch.open(now).unwrap();

        for n in 1..=failures {
            let failed_at = now;
            let attempt = ch.attempt();
            ch.handle_error(attempt, now);
            prop_assert_eq!(ch.retry_count(), n);

            let expected =
                config.backoff_base.saturating_mul(2u32.pow(n - 1)).min(config.max_retry_delay);

            // The connect timeout may fire while waiting, it never reconnects
            loop {
                now = ch.next_deadline().unwrap();
                let actions = ch.tick(now);
                if matches!(actions.first(), Some(ChannelAction::Connect { .. })) {
                    break;
                }
                prop_assert!(now - failed_at < expected);
            }
            prop_assert_eq!(now - failed_at, expected);
        }
    }

    /// A server that refuses every stream, however fast, still sends the
    /// channel into fallback polling once the connect timeout has passed.
    #[test]
    fn prop_refused_streams_fall_back(delays in prop::collection::vec(0u64..2_000, 1..24)) {
        let config = ChannelConfig::default();
        let t0 = Instant::now();
        let mut now = t0;
        let mut ch = new_channel();
        ch.open(now).unwrap();

        for delay in delays {
            let target = now + Duration::from_millis(delay);
            fire_until(&mut ch, &mut now, target);
            if ch.state() == ChannelState::Connecting {
                let attempt = ch.attempt();
                ch.handle_error(attempt, now);
            }
        }
        fire_until(&mut ch, &mut now, t0 + config.connect_timeout);

        prop_assert!(ch.is_fallback());
        prop_assert_ne!(ch.state(), ChannelState::Connected);
        prop_assert_eq!(ch.status().polling_interval, DEFAULT_FALLBACK_POLL_INTERVAL);
    }
}

/// Fire every timer due up to `target`, in order, then move the clock there.
fn fire_until(ch: &mut Channel<Instant>, now: &mut Instant, target: Instant) {
    while let Some(deadline) = ch.next_deadline().filter(|deadline| *deadline <= target) {
        *now = (*now).max(deadline);
        ch.tick(*now);
    }
    *now = (*now).max(target);
}

#[test]
fn six_seconds_of_silence_falls_back() {
    let t0 = Instant::now();
    let mut ch = new_channel();
    ch.open(t0).unwrap();
    assert_eq!(ch.state(), ChannelState::Connecting);

    ch.tick(t0 + Duration::from_secs(6));

    assert_eq!(ch.state(), ChannelState::Disconnected);
    assert!(ch.is_fallback());
    assert_eq!(ch.polling_interval(), Duration::from_millis(15_000));
}
