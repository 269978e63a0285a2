//! Incremental `text/event-stream` decoder.
//!
//! Bytes arrive in arbitrary chunks; [`SseDecoder::feed`] buffers partial lines
//! and returns every message completed by the chunk. Parsing follows the
//! HTML event-stream rules:
//!
//! - lines end in LF, CR or CRLF (a CRLF split across chunks counts once)
//! - a leading byte-order mark is skipped
//! - lines starting with `:` are comments
//! - `data` lines accumulate, joined by `\n`
//! - an empty line dispatches; a message without data is discarded
//! - `id` persists across messages and is ignored if it contains NUL
//! - `retry` is only honoured when it is all ASCII digits
//!
//! An incomplete message at end of stream is discarded by simply not being
//! dispatched.

use std::time::Duration;

/// Event type of messages without an `event` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// One dispatched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    /// `event` field, [`DEFAULT_EVENT_TYPE`] when absent
    pub event: String,
    /// Concatenated `data` lines
    pub data: String,
    /// Last event id seen on the stream
    pub id: Option<String>,
}

impl SseMessage {
    /// True for unnamed messages, the only kind the backend's domain events
    /// are sent as.
    pub fn is_default_event(&self) -> bool {
        self.event == DEFAULT_EVENT_TYPE
    }
}

/// Stateful decoder for one stream.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    skip_lf: bool,
    started: bool,
    data: String,
    has_data: bool,
    event: Option<String>,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl SseDecoder {
    /// Decoder at the start of a stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last `retry` value sent by the server.
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    /// Last event id sent by the server.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Consume a chunk. Returns the messages it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        let mut messages = Vec::new();

        for &byte in chunk {
            if self.skip_lf {
                self.skip_lf = false;
                if byte == b'\n' {
                    continue;
                }
            }

            match byte {
                b'\n' => self.end_line(&mut messages),
                b'\r' => {
                    self.end_line(&mut messages);
                    self.skip_lf = true;
                },
                _ => self.line.push(byte),
            }
        }

        messages
    }

    fn end_line(&mut self, messages: &mut Vec<SseMessage>) {
        let raw = std::mem::take(&mut self.line);
        let mut line = String::from_utf8_lossy(&raw).into_owned();

        if !self.started {
            self.started = true;
            if let Some(stripped) = line.strip_prefix('\u{feff}') {
                line = stripped.to_owned();
            }
        }

        if line.is_empty() {
            self.dispatch(messages);
            return;
        }

        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_str(), ""),
        };

        match field {
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            },
            "event" => self.event = Some(value.to_owned()),
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = Some(value.to_owned());
                }
            },
            "retry" => {
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(millis) = value.parse::<u64>() {
                        self.retry = Some(Duration::from_millis(millis));
                    }
                }
            },
            _ => {},
        }
    }

    fn dispatch(&mut self, messages: &mut Vec<SseMessage>) {
        let event = self.event.take();
        if !self.has_data {
            return;
        }

        self.has_data = false;
        messages.push(SseMessage {
            event: event.filter(|e| !e.is_empty()).unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_owned()),
            data: std::mem::take(&mut self.data),
            id: self.last_event_id.clone(),
        });
    }
}
