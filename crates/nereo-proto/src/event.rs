//! Domain events pushed over the server-sent-event channels.
//!
//! Each SSE message carries one JSON object whose `type` field selects the
//! variant. Decoding is two-phase: the envelope is inspected first so that an
//! unknown `type` is reported as [`DecodeError::UnknownType`] rather than a
//! generic shape error, then the known variant is deserialized.
//!
//! # Invariants
//!
//! - [`DomainEvent::decode`] never panics, whatever the input.
//! - Every [`EventKind`] has exactly one wire name and one home [`Topic`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    Topic,
    errors::{DecodeError, Result},
};

/// A change notification from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// Dashboard KPIs changed. `payload` is a partial KPI object.
    KpiUpdated {
        /// Changed KPI fields
        payload: Map<String, Value>,
        /// Server timestamp (RFC 3339)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },

    /// A payment went through.
    PaymentProcessed {
        /// Event details (not interpreted by the client)
        #[serde(default)]
        payload: Map<String, Value>,
        /// Server timestamp (RFC 3339)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },

    /// A membership was created, renewed, paused or cancelled.
    SubscriptionChanged {
        /// Event details (not interpreted by the client)
        #[serde(default)]
        payload: Map<String, Value>,
        /// Server timestamp (RFC 3339)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },

    /// A wash finished.
    BookingCompleted {
        /// Event details (not interpreted by the client)
        #[serde(default)]
        payload: Map<String, Value>,
        /// Server timestamp (RFC 3339)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },

    /// A booking was checked in.
    BookingCreated(BookingChange),

    /// A booking's details changed.
    BookingUpdated(BookingChange),

    /// A booking moved to another kanban column.
    BookingStatusChanged(BookingChange),
}

/// Body shared by the booking events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingChange {
    /// Booking that changed. Absent on some legacy emitters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<String>,
    /// New status as sent by the server.
    ///
    /// Kept verbatim: the kiosk and the backend disagree on the status
    /// vocabulary and the client only uses it for logging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Operator the booking is assigned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operario_id: Option<String>,
    /// Server timestamp (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Discriminant of [`DomainEvent`], matching the wire `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// `kpi_updated`
    KpiUpdated,
    /// `payment_processed`
    PaymentProcessed,
    /// `subscription_changed`
    SubscriptionChanged,
    /// `booking_completed`
    BookingCompleted,
    /// `booking_created`
    BookingCreated,
    /// `booking_updated`
    BookingUpdated,
    /// `booking_status_changed`
    BookingStatusChanged,
}

impl EventKind {
    /// Every known event kind.
    pub const ALL: [Self; 7] = [
        Self::KpiUpdated,
        Self::PaymentProcessed,
        Self::SubscriptionChanged,
        Self::BookingCompleted,
        Self::BookingCreated,
        Self::BookingUpdated,
        Self::BookingStatusChanged,
    ];

    /// Wire name used in the `type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KpiUpdated => "kpi_updated",
            Self::PaymentProcessed => "payment_processed",
            Self::SubscriptionChanged => "subscription_changed",
            Self::BookingCompleted => "booking_completed",
            Self::BookingCreated => "booking_created",
            Self::BookingUpdated => "booking_updated",
            Self::BookingStatusChanged => "booking_status_changed",
        }
    }

    /// Parse a wire name. `None` for anything not in [`Self::ALL`].
    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Topic whose stream carries this kind of event.
    ///
    /// `booking_completed` is an analytics event: the bookings stream only
    /// carries the kanban-level changes.
    pub fn topic(self) -> Topic {
        match self {
            Self::KpiUpdated
            | Self::PaymentProcessed
            | Self::SubscriptionChanged
            | Self::BookingCompleted => Topic::Analytics,
            Self::BookingCreated | Self::BookingUpdated | Self::BookingStatusChanged => {
                Topic::Bookings
            },
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DomainEvent {
    /// Decode one SSE `data` payload.
    ///
    /// # Errors
    ///
    /// - `DecodeError::MalformedJson` if `raw` is not JSON
    /// - `DecodeError::NotAnObject` if it is JSON but not an object
    /// - `DecodeError::MissingType` if there is no string `type` field
    /// - `DecodeError::UnknownType` if `type` is not a known [`EventKind`]
    /// - `DecodeError::InvalidShape` if the fields do not fit the known kind
    pub fn decode(raw: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| DecodeError::MalformedJson(e.to_string()))?;

        let type_name = match &value {
            Value::Object(object) => match object.get("type").and_then(Value::as_str) {
                Some(name) => name.to_owned(),
                None => return Err(DecodeError::MissingType),
            },
            other => return Err(DecodeError::NotAnObject { found: json_type_name(other) }),
        };

        if EventKind::from_type_name(&type_name).is_none() {
            return Err(DecodeError::UnknownType(type_name));
        }

        serde_json::from_value(value)
            .map_err(|e| DecodeError::InvalidShape { event_type: type_name, reason: e.to_string() })
    }

    /// Encode as the JSON text the backend sends.
    pub fn to_json(&self) -> String {
        // Maps with string keys and plain values cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Discriminant of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::KpiUpdated { .. } => EventKind::KpiUpdated,
            Self::PaymentProcessed { .. } => EventKind::PaymentProcessed,
            Self::SubscriptionChanged { .. } => EventKind::SubscriptionChanged,
            Self::BookingCompleted { .. } => EventKind::BookingCompleted,
            Self::BookingCreated(_) => EventKind::BookingCreated,
            Self::BookingUpdated(_) => EventKind::BookingUpdated,
            Self::BookingStatusChanged(_) => EventKind::BookingStatusChanged,
        }
    }

    /// Booking body, for the booking variants.
    pub fn booking_change(&self) -> Option<&BookingChange> {
        match self {
            Self::BookingCreated(change)
            | Self::BookingUpdated(change)
            | Self::BookingStatusChanged(change) => Some(change),
            _ => None,
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
