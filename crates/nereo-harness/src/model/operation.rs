//! Operations for model-based and fuzz testing.
//!
//! Operations are generated by proptest strategies or by `arbitrary` from
//! fuzzer bytes and applied to the simulated world (and, for the cache
//! subset, to [`super::ModelCache`]). Indices are small integers reduced
//! modulo whatever they select from, so every generated value is valid.

use arbitrary::Arbitrary;
use nereo_core::{Scope, SpeculativeUpdate};
use nereo_proto::{BookingStatus, NewSubscriber, SubscriberAction};
use serde_json::json;

use crate::sim_channel::StreamBehavior;

/// Number of subscribers and bookings the simulated server seeds.
pub const SEEDED_RECORDS: u8 = 3;

/// Operations that can be applied to the simulated world.
#[derive(Debug, Clone, Arbitrary)]
pub enum Operation {
    /// Advance virtual time, firing due channel timers.
    AdvanceTime {
        /// Milliseconds to advance.
        millis: u16,
    },

    /// Change how the server answers stream requests of a channel.
    SetBehavior {
        /// Channel index.
        channel: u8,
        /// New behavior.
        behavior: StreamBehavior,
    },

    /// Answer a channel's pending stream request.
    AcceptPending {
        /// Channel index.
        channel: u8,
    },

    /// Server ends a channel's streams.
    DropStream {
        /// Channel index.
        channel: u8,
    },

    /// Server pushes an event on a channel.
    Push {
        /// Channel index.
        channel: u8,
        /// Event to push.
        event: SimEvent,
    },

    /// Close a channel and open a fresh one for the same topic.
    Resubscribe {
        /// Channel index.
        channel: u8,
    },

    /// Start a refetch without landing it.
    StartFetch {
        /// Query index.
        query: u8,
    },

    /// Land the oldest in-flight refetch.
    CompleteFetch,

    /// Start a write with a speculative update.
    Mutate {
        /// The write.
        mutation: SimMutation,
        /// Whether the server rejects it.
        fails: bool,
    },

    /// Answer the oldest in-flight write.
    SettleNext,

    /// Refetch every stale registered query.
    RefetchStale,
}

/// Event payloads the simulated server pushes.
#[derive(Debug, Clone, Arbitrary)]
pub enum SimEvent {
    /// `kpi_updated` with one field
    Kpi {
        /// Field selector
        field: u8,
        /// New value
        value: u16,
    },
    /// `payment_processed`
    Payment,
    /// `subscription_changed`
    SubscriptionChanged,
    /// `booking_status_changed`
    BookingMoved {
        /// Booking index
        booking: u8,
    },
    /// Well-formed event of an unknown type
    Unknown,
    /// Not JSON
    Garbage,
}

impl SimEvent {
    /// Wire payload.
    pub fn to_payload(&self) -> String {
        const FIELDS: [&str; 3] = ["monthlyRevenue", "activeSubscribers", "washesToday"];

        let value = match self {
            Self::Kpi { field, value } => {
                let field = FIELDS[usize::from(*field) % FIELDS.len()];
                json!({"type": "kpi_updated", "payload": {field: value}})
            },
            Self::Payment => json!({"type": "payment_processed", "payload": {"amount": 25}}),
            Self::SubscriptionChanged => {
                json!({"type": "subscription_changed", "payload": {}})
            },
            Self::BookingMoved { booking } => json!({
                "type": "booking_status_changed",
                "bookingId": booking_id(*booking),
                "status": "washing",
            }),
            Self::Unknown => json!({"type": "loyalty_points_awarded", "payload": {}}),
            Self::Garbage => return "{not json".to_owned(),
        };
        value.to_string()
    }
}

/// Writes the simulated admin and kiosk views issue.
#[derive(Debug, Clone, Arbitrary)]
pub enum SimMutation {
    /// Membership action on a seeded subscriber
    Membership {
        /// Subscriber index
        subscriber: u8,
        /// 0 renew, 1 pause, 2 cancel
        action: u8,
    },
    /// New subscriber
    Create {
        /// Name seed
        name: u8,
    },
    /// Kanban move of a seeded booking
    MoveBooking {
        /// Booking index
        booking: u8,
        /// 0 waiting, 1 washing, 2 ready
        column: u8,
    },
}

impl SimMutation {
    /// Speculative update for `scope`. Creation uses `temp_id` for the
    /// placeholder.
    pub fn to_update(&self, scope: &Scope, temp_id: String) -> SpeculativeUpdate {
        match self {
            Self::Membership { subscriber, action } => {
                let action = match action % 3 {
                    0 => SubscriberAction::Renew,
                    1 => SubscriberAction::Pause,
                    _ => SubscriberAction::Cancel,
                };
                SpeculativeUpdate::subscriber_status(
                    scope.clone(),
                    subscriber_id(*subscriber),
                    action,
                )
            },
            Self::Create { name } => {
                let request = NewSubscriber {
                    full_name: format!("Driver {name}"),
                    phone: format!("555-01{name:02}"),
                    plate: format!("SIM-{name:03}"),
                    plan_id: "plan-basic".to_owned(),
                    ..NewSubscriber::default()
                };
                SpeculativeUpdate::create_subscriber(scope.clone(), &request, temp_id)
            },
            Self::MoveBooking { booking, column } => {
                let status = match column % 3 {
                    0 => BookingStatus::Waiting,
                    1 => BookingStatus::Washing,
                    _ => BookingStatus::Ready,
                };
                SpeculativeUpdate::booking_status(scope.clone(), booking_id(*booking), status)
            },
        }
    }
}

/// Id of seeded subscriber `index`.
pub fn subscriber_id(index: u8) -> String {
    format!("s{}", index % SEEDED_RECORDS)
}

/// Id of seeded booking `index`.
pub fn booking_id(index: u8) -> String {
    format!("b{}", index % SEEDED_RECORDS)
}

#[cfg(test)]
mod tests {
    use nereo_core::{EventRouter, Subscription};
    use nereo_proto::Topic;

    use super::*;

    #[test]
    fn generated_payloads_route_as_intended() {
        let analytics = EventRouter::new(Subscription::new(Topic::Analytics, Scope::tenant("t")));
        let bookings = EventRouter::new(Subscription::new(Topic::Bookings, Scope::tenant("t")));

        let classified = |router: &EventRouter, event: SimEvent| {
            router.route(&event.to_payload()).is_classified()
        };

        assert!(classified(&analytics, SimEvent::Kpi { field: 4, value: 9 }));
        assert!(classified(&analytics, SimEvent::Payment));
        assert!(classified(&bookings, SimEvent::BookingMoved { booking: 7 }));
        assert!(!classified(&bookings, SimEvent::Unknown));
        assert!(!classified(&analytics, SimEvent::Garbage));
    }

    #[test]
    fn indices_wrap_onto_seeded_records() {
        assert_eq!(subscriber_id(4), "s1");
        assert_eq!(booking_id(255), "b0");

        let update = SimMutation::MoveBooking { booking: 5, column: 7 }
            .to_update(&Scope::tenant("t"), String::new());
        assert_eq!(update.target(), "b2");
    }
}
