//! Server-sent-event transport for push channels.
//!
//! A [`Connector`] runs one connection attempt: it opens the stream, reports
//! `Opened`, forwards every unnamed message and reports `Failed` when the
//! stream cannot be opened or ends. It never retries; reconnecting is the
//! channel state machine's decision. Events are tagged with the attempt
//! number so the state machine can discard what a replaced attempt still
//! sends.

use std::future::Future;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use tokio::sync::{mpsc, oneshot};

use crate::{ClientConfig, SseDecoder, TransportError};

/// What a connection attempt reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Stream accepted by the server
    Opened,
    /// Payload of one unnamed message
    Message(String),
    /// Attempt is over
    Failed(TransportError),
}

/// Input of a channel driver task.
#[derive(Debug)]
pub enum ChannelInput {
    /// Event from connection attempt `attempt`
    Transport {
        /// Attempt the event belongs to
        attempt: u64,
        /// The event
        event: TransportEvent,
    },
    /// Close the channel. `done` fires once the transport is released.
    Close {
        /// Completion signal
        done: oneshot::Sender<()>,
    },
}

/// Where a connection attempt sends its events.
#[derive(Debug, Clone)]
pub struct TransportSink {
    attempt: u64,
    inputs: mpsc::Sender<ChannelInput>,
}

impl TransportSink {
    /// Sink for attempt `attempt` of a channel.
    pub fn new(attempt: u64, inputs: mpsc::Sender<ChannelInput>) -> Self {
        Self { attempt, inputs }
    }

    /// Attempt this sink reports for.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Send an event. Returns false once the channel is gone.
    pub async fn send(&self, event: TransportEvent) -> bool {
        self.inputs.send(ChannelInput::Transport { attempt: self.attempt, event }).await.is_ok()
    }
}

/// Opens push streams.
pub trait Connector: Send + Sync + 'static {
    /// Run one attempt against `path` until the stream ends or the task is
    /// aborted. Must report `Opened` at most once and `Failed` at most once,
    /// as the last event.
    fn connect(
        &self,
        path: String,
        sink: TransportSink,
    ) -> impl Future<Output = ()> + Send + 'static;
}

/// [`Connector`] over HTTP using reqwest.
///
/// The request carries the session cookies of the shared client and, when
/// configured, a bearer token. No request timeout applies; the channel's
/// connect timeout covers a stream that never opens.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    http: reqwest::Client,
    config: ClientConfig,
}

impl HttpConnector {
    /// Connector sharing `http` (and its cookie store) with the REST client.
    pub fn new(http: reqwest::Client, config: &ClientConfig) -> Self {
        Self { http, config: config.clone() }
    }

    async fn stream(self, path: String, sink: &TransportSink) -> Result<(), TransportError> {
        let url = self.config.url(&path);
        let mut request = self
            .http
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response =
            request.send().await.map_err(|e| TransportError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with("text/event-stream") {
            return Err(TransportError::Stream(format!("unexpected content type {content_type:?}")));
        }

        if !sink.send(TransportEvent::Opened).await {
            return Ok(());
        }

        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk: Bytes = chunk.map_err(|e| TransportError::Stream(e.to_string()))?;

            for message in decoder.feed(&chunk) {
                if !message.is_default_event() {
                    tracing::debug!(%url, event = %message.event, "ignoring named event");
                    continue;
                }
                if !sink.send(TransportEvent::Message(message.data)).await {
                    return Ok(());
                }
            }
        }

        Err(TransportError::Stream("stream ended".to_string()))
    }
}

impl Connector for HttpConnector {
    fn connect(
        &self,
        path: String,
        sink: TransportSink,
    ) -> impl Future<Output = ()> + Send + 'static {
        let connector = self.clone();
        async move {
            if let Err(err) = connector.stream(path, &sink).await {
                sink.send(TransportEvent::Failed(err)).await;
            }
        }
    }
}
