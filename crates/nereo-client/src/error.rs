//! Error types for the client drivers.
//!
//! `TransportError` covers push streams, `ApiError` REST calls. Neither is
//! fatal to the client: push failures feed the channel's reconnect logic, REST
//! failures roll back the mutation that issued them. `ClientError` is what the
//! public API returns.

use nereo_core::FailureNotice;
use thiserror::Error;

/// Push stream failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Request could not be sent or the connection dropped
    #[error("connection failed: {0}")]
    Connection(String),

    /// Server answered the stream request with a non-2xx status
    #[error("stream rejected with status {0}")]
    Status(u16),

    /// Stream ended or failed mid-read
    #[error("stream error: {0}")]
    Stream(String),
}

impl TransportError {
    /// Returns true if reconnecting may succeed.
    ///
    /// Client errors other than 408/429 mean the request itself is wrong
    /// (bad tenant, expired session) and will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Stream(_) => true,
            Self::Status(status) => !(400..500).contains(status) || matches!(status, 408 | 429),
        }
    }
}

/// REST failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Non-2xx response
    #[error("request failed with status {status}: {message}")]
    Status {
        /// HTTP status
        status: u16,
        /// Server `message`, or the status reason when absent
        message: String,
    },

    /// Request could not be sent or timed out
    #[error("request failed: {0}")]
    Request(String),

    /// 2xx response whose body is not JSON
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl ApiError {
    /// Message suitable as rollback detail.
    pub fn message(&self) -> String {
        match self {
            Self::Status { message, .. } => message.clone(),
            Self::Request(reason) | Self::Decode(reason) => reason.clone(),
        }
    }

    /// Returns true for timeouts, connection failures and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500 || matches!(status, 408 | 429),
            Self::Request(_) => true,
            Self::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() { Self::Decode(err.to_string()) } else { Self::Request(err.to_string()) }
    }
}

/// Errors returned by [`crate::SyncClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP client could not be built
    #[error("configuration error: {0}")]
    Config(String),

    /// REST call failed (reads and refetches)
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Server rejected a mutation. The cache was rolled back.
    #[error("{notice}")]
    Rejected {
        /// Notice also published on the notification channel
        notice: FailureNotice,
        /// Underlying failure
        #[source]
        source: ApiError,
    },
}
