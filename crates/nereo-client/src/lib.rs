//! Client
//!
//! Tokio drivers for the `nereo-core` state machines: server-sent-event
//! transport, REST calls and the [`SyncClient`] that ties them to one shared
//! cache.
//!
//! # Architecture
//!
//! `nereo-core` decides, this crate does the I/O. Each push channel runs in its
//! own task ([`ChannelDriver`]) that executes the actions of its state machine.
//! Queries and mutations run on the caller's task. All of them share one
//! [`nereo_core::SyncCore`] behind a tokio mutex.
//!
//! # Components
//!
//! - [`SyncClient`]: Subscriptions, queries and optimistic mutations
//! - [`ChannelDriver`]: Per-channel task, reconnects and fallback status
//! - [`HttpConnector`]: SSE streams over reqwest
//! - [`SseDecoder`]: Incremental `text/event-stream` parser
//! - [`ApiClient`]: JSON REST calls
//! - [`SystemEnv`]: Production environment (tokio clock, OS RNG)

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod api;
mod client;
mod config;
mod driver;
mod error;
pub mod sse;
mod system_env;
mod transport;

pub use api::ApiClient;
pub use client::SyncClient;
pub use config::{
    API_TOKEN_VAR, API_URL_VAR, ClientConfig, DEFAULT_API_URL, DEFAULT_REQUEST_TIMEOUT,
    REQUEST_TIMEOUT_VAR,
};
pub use driver::{ChannelDriver, ChannelHandle};
pub use error::{ApiError, ClientError, TransportError};
pub use sse::{SseDecoder, SseMessage};
pub use system_env::SystemEnv;
pub use transport::{ChannelInput, Connector, HttpConnector, TransportEvent, TransportSink};
