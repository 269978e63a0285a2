//! Model-based testing support.
//!
//! - [`Operation`]: everything a simulated run can do, generated by proptest
//!   strategies or by `arbitrary` from fuzzer input
//! - [`ModelCache`]: a reference implementation of the cache rules to compare
//!   the real core against

mod cache;
mod operation;

pub use cache::{ModelCache, ModelTicket, Observable, observe};
pub use operation::{Operation, SEEDED_RECORDS, SimEvent, SimMutation, booking_id, subscriber_id};
