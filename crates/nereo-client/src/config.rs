//! Client configuration.
//!
//! Defaults target a backend on `localhost:8080`. The environment can override
//! the base URL and the request settings; CLI flags override both.

use std::time::Duration;

use nereo_core::ChannelConfig;

/// Backend used when `NEREO_API_URL` is not set.
pub const DEFAULT_API_URL: &str = "http://localhost:8080";

/// Timeout for a single REST request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable naming the backend base URL.
pub const API_URL_VAR: &str = "NEREO_API_URL";

/// Environment variable holding a bearer token.
pub const API_TOKEN_VAR: &str = "NEREO_API_TOKEN";

/// Environment variable overriding the request timeout, in milliseconds.
pub const REQUEST_TIMEOUT_VAR: &str = "NEREO_REQUEST_TIMEOUT_MS";

/// Configuration of a [`crate::SyncClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Backend base URL, without trailing slash
    pub base_url: String,
    /// Push channel timing
    pub channel: ChannelConfig,
    /// Timeout for REST requests. Push streams are not subject to it.
    pub request_timeout: Duration,
    /// Bearer token sent with every request, in addition to cookies
    pub bearer_token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            channel: ChannelConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            bearer_token: None,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup(API_URL_VAR).filter(|value| !value.trim().is_empty()) {
            config = config.with_base_url(url);
        }

        config.bearer_token = lookup(API_TOKEN_VAR).filter(|value| !value.is_empty());

        if let Some(timeout) = lookup(REQUEST_TIMEOUT_VAR)
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
        {
            config.request_timeout = Duration::from_millis(timeout);
        }

        config
    }

    /// Set the base URL. A trailing slash is dropped.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url = base_url.trim().trim_end_matches('/').to_string();
        self
    }

    /// Set the push channel timing.
    #[must_use]
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    /// Set the REST request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the bearer token.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Absolute URL of `path`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}
