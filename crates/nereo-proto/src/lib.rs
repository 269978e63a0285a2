//! Wire formats for the Nereo backend.
//!
//! Everything that crosses the network boundary lives here: the JSON domain
//! events pushed over the server-sent-event channels, the topic names that
//! select those channels, the REST paths and request bodies used for writes,
//! and the handful of domain models the client builds speculative values from.
//!
//! # Components
//!
//! - [`DomainEvent`]: Tagged push event, decoded defensively via
//!   [`DomainEvent::decode`]
//! - [`Topic`]: Logical push stream (bookings, analytics)
//! - [`paths`]: REST and SSE path builders
//! - [`model`]: Subscriber and booking models
//!
//! This crate performs no I/O.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod errors;
pub mod event;
pub mod model;
pub mod paths;
pub mod topic;

pub use errors::{DecodeError, Result};
pub use event::{BookingChange, DomainEvent, EventKind};
pub use model::{
    BookingStatus, BookingStatusUpdate, ErrorBody, MembershipStatus, NewSubscriber, Plan,
    PlanInterval, Subscriber, SubscriberAction,
};
pub use topic::{Topic, UnknownTopic};
