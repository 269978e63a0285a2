//! Error types for the synchronization core.
//!
//! The state machines report misuse by the driver (operations invoked in the
//! wrong state) as typed errors. Transport failures are not errors here: they
//! are inputs that drive the channel into `Reconnecting`.

use thiserror::Error;

use crate::channel::ChannelState;

/// Errors returned by [`crate::Channel`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Operation not valid in the current state
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when the error occurred
        state: ChannelState,
        /// Operation that was attempted
        operation: String,
    },

    /// Channel was closed and cannot be reopened
    #[error("channel {key} is closed")]
    Closed {
        /// Topic key of the channel
        key: String,
    },
}
