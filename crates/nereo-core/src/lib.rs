//! Core
//!
//! Sans-IO state machines that keep the client's query cache in step with the
//! backend: push channels, event routing, cache reconciliation and optimistic
//! mutations.
//!
//! # Architecture
//!
//! Nothing in this crate performs I/O or reads a clock. State machines take
//! the current time as a parameter and return actions for the caller to
//! execute, so the same code runs under tokio in `nereo-client` and under a
//! virtual clock in `nereo-harness`.
//!
//! ```text
//!  SSE ──> Channel ──Deliver──> EventRouter ──plan──┐
//!                                                   ↓
//!  UI ──> SpeculativeUpdate ──> MutationCoordinator ──> Reconciler ──> QueryCache
//!                                    ↑ settle
//!  REST response ────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`Channel`]: Connect/timeout/backoff/fallback state machine per topic
//! - [`EventRouter`]: Raw payload to [`ReconcilePlan`]
//! - [`Reconciler`]: Merge, invalidation and fetch tickets over [`QueryCache`]
//! - [`MutationCoordinator`]: Snapshot, speculative write, commit or rollback
//! - [`SyncCore`]: Owner of the reconciler and the coordinator

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod cache;
pub mod channel;
pub mod env;
pub mod error;
pub mod mutation;
pub mod reconciler;
pub mod router;
pub mod scope;
pub mod sync;
pub mod updates;

pub use cache::{CacheEntry, CacheKey, MergeOutcome, QueryCache};
pub use channel::{Channel, ChannelAction, ChannelConfig, ChannelState, ChannelStatus};
pub use env::Environment;
pub use error::ChannelError;
pub use mutation::{
    FailureNotice, MutationCoordinator, MutationId, MutationRequest, MutationState, Outcome,
    Settlement,
};
pub use reconciler::{ApplyOutcome, FetchOutcome, FetchTicket, Reconciler};
pub use router::{EventRouter, ReconcilePlan, Routed};
pub use scope::{Scope, Subscription, keys};
pub use sync::SyncCore;
pub use updates::SpeculativeUpdate;
