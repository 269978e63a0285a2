//! Decode errors for inbound push payloads.

use thiserror::Error;

/// Result alias for decode operations.
pub type Result<T> = std::result::Result<T, DecodeError>;

/// Reasons an inbound event payload could not be turned into a
/// [`crate::DomainEvent`].
///
/// None of these are fatal to a channel. The router maps every variant to a
/// broad invalidation of the topic family.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload is not valid JSON.
    #[error("malformed json: {0}")]
    MalformedJson(String),

    /// Payload is JSON but not an object.
    #[error("expected a json object, found {found}")]
    NotAnObject {
        /// JSON type that was found instead
        found: &'static str,
    },

    /// Object has no string `type` field.
    #[error("missing or non-string `type` field")]
    MissingType,

    /// `type` names an event this client does not know.
    #[error("unknown event type: {0}")]
    UnknownType(String),

    /// Known `type`, but the remaining fields do not match its shape.
    #[error("invalid `{event_type}` event: {reason}")]
    InvalidShape {
        /// Event type that failed to decode
        event_type: String,
        /// Underlying deserializer message
        reason: String,
    },
}

impl DecodeError {
    /// The event type named by the payload, if one could be read.
    pub fn event_type(&self) -> Option<&str> {
        match self {
            Self::UnknownType(t) | Self::InvalidShape { event_type: t, .. } => Some(t),
            Self::MalformedJson(_) | Self::NotAnObject { .. } | Self::MissingType => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_only_for_typed_failures() {
        assert_eq!(DecodeError::UnknownType("x".into()).event_type(), Some("x"));
        assert_eq!(
            DecodeError::InvalidShape { event_type: "kpi_updated".into(), reason: "r".into() }
                .event_type(),
            Some("kpi_updated")
        );
        assert_eq!(DecodeError::MissingType.event_type(), None);
        assert_eq!(DecodeError::MalformedJson("eof".into()).event_type(), None);
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            DecodeError::NotAnObject { found: "array" }.to_string(),
            "expected a json object, found array"
        );
        assert_eq!(DecodeError::UnknownType("ping".into()).to_string(), "unknown event type: ping");
    }
}
