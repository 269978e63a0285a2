//! Deterministic simulation harness for Nereo cache synchronization.
//!
//! A virtual-clock [`Environment`](nereo_core::Environment) and a synchronous
//! simulated world that runs the real channel state machines, router,
//! reconciler and mutation coordinator against a scripted backend. A run is
//! fully determined by its seed and its operations.
//!
//! # Model-Based Testing
//!
//! The `model` module provides generated [`Operation`]s and a reference
//! implementation of the cache rules ([`ModelCache`]). Operations are applied
//! to both the model and the real core, and their observable states are
//! compared.
//!
//! # Invariant Testing
//!
//! The `invariants` module provides behavioral testing through invariant
//! checks. Invariants verify WHAT must be true across all execution paths, not
//! specific scenarios. Use [`InvariantRegistry::standard()`] for the channel
//! and cache invariants.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod model;
pub mod sim_channel;
pub mod sim_env;
pub mod sim_server;
pub mod sim_world;

pub use invariants::{
    ChannelSnapshot, EntrySnapshot, Invariant, InvariantRegistry, InvariantResult,
    NoPhantomEntries, OneNoticePerRollback, ReconnectProgress, RollbackExactness, RollbackRecord,
    StatusConsistency, SystemSnapshot, TransportAccounting, Violation,
};
pub use model::{ModelCache, ModelTicket, Observable, Operation, SimEvent, SimMutation, observe};
pub use sim_channel::{Effects, SimChannel, StreamBehavior, TransportState};
pub use sim_env::{SimEnv, SimInstant};
pub use sim_server::SimServer;
pub use sim_world::{REJECTION_MESSAGE, SIM_BRANCH, SIM_TENANT, SimWorld};
