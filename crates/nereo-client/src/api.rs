//! JSON REST calls against the backend.
//!
//! Every call carries the shared cookie store, the optional bearer token and
//! the configured request timeout. Non-2xx responses become
//! [`ApiError::Status`] with the server's `message` (or the status reason).
//! Empty 2xx bodies, as sent with `204 No Content`, decode as `null`.

use nereo_proto::ErrorBody;
use reqwest::{Method, RequestBuilder};
use serde::Serialize;
use serde_json::Value;

use crate::{ApiError, ClientConfig};

/// REST client.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl ApiClient {
    /// Client sharing `http` (and its cookie store) with the push transport.
    pub fn new(http: reqwest::Client, config: &ClientConfig) -> Self {
        Self { http, config: config.clone() }
    }

    /// `GET path`.
    pub async fn get_json(&self, path: &str) -> Result<Value, ApiError> {
        self.send(self.request(Method::GET, path)).await
    }

    /// `POST path` without a body.
    pub async fn post(&self, path: &str) -> Result<Value, ApiError> {
        self.send(self.request(Method::POST, path)).await
    }

    /// `POST path` with a JSON body.
    pub async fn post_json<B>(&self, path: &str, body: &B) -> Result<Value, ApiError>
    where
        B: Serialize + ?Sized,
    {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    /// `PATCH path` with a JSON body.
    pub async fn patch_json<B>(&self, path: &str, body: &B) -> Result<Value, ApiError>
    where
        B: Serialize + ?Sized,
    {
        self.send(self.request(Method::PATCH, path).json(body)).await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request =
            self.http.request(method, self.config.url(path)).timeout(self.config.request_timeout);
        match &self.config.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, ApiError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("request failed");
            let message = serde_json::from_slice::<ErrorBody>(&body)
                .ok()
                .and_then(|body| body.message)
                .unwrap_or_else(|| reason.to_owned());
            return Err(ApiError::Status { status: status.as_u16(), message });
        }

        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}
