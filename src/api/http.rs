//! HTTP API — JSON fetch wrapper for scripts.
//!
//! Thin wrapper over a shared reqwest client: non-2xx statuses become
//! errors carrying the status line, success bodies parse as JSON (an empty
//! body reads as `null`). `post`/`put` JSON-encode their body, which also
//! sets the JSON content type.

use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use tracing::warn;

const REQUEST_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("http client build failed: {0}")]
    ClientBuild(String),
    #[error("invalid method: {0}")]
    InvalidMethod(String),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {reason}")]
    Status { status: u16, reason: String },
}

/// HTTP capability facade handed to the script sandbox.
#[derive(Clone)]
pub struct HttpApi {
    client: reqwest::Client,
}

impl HttpApi {
    /// Build the facade with its own pooled client.
    ///
    /// # Errors
    ///
    /// Returns `ClientBuild` if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| HttpError::ClientBuild(e.to_string()))?;
        Ok(Self { client })
    }

    /// GET a JSON resource.
    ///
    /// # Errors
    ///
    /// Returns `Status` for non-2xx responses, `Transport` otherwise.
    pub async fn get(&self, url: &str) -> Result<Value, HttpError> {
        self.request(Method::GET, url, None).await
    }

    /// POST a JSON body.
    ///
    /// # Errors
    ///
    /// Returns `Status` for non-2xx responses, `Transport` otherwise.
    pub async fn post(&self, url: &str, body: Option<Value>) -> Result<Value, HttpError> {
        self.request(Method::POST, url, body).await
    }

    /// PUT a JSON body.
    ///
    /// # Errors
    ///
    /// Returns `Status` for non-2xx responses, `Transport` otherwise.
    pub async fn put(&self, url: &str, body: Option<Value>) -> Result<Value, HttpError> {
        self.request(Method::PUT, url, body).await
    }

    /// DELETE a resource.
    ///
    /// # Errors
    ///
    /// Returns `Status` for non-2xx responses, `Transport` otherwise.
    pub async fn delete(&self, url: &str) -> Result<Value, HttpError> {
        self.request(Method::DELETE, url, None).await
    }

    /// Issue a request with an arbitrary method name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMethod` for an unparseable method, `Status` for
    /// non-2xx responses, `Transport` otherwise.
    pub async fn request_named(
        &self,
        method: &str,
        url: &str,
        body: Option<Value>,
    ) -> Result<Value, HttpError> {
        let method = method
            .parse::<Method>()
            .map_err(|_| HttpError::InvalidMethod(method.to_owned()))?;
        self.request(method, url, body).await
    }

    async fn request(&self, method: Method, url: &str, body: Option<Value>) -> Result<Value, HttpError> {
        let mut builder = self.client.request(method.clone(), url);
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(%method, url, status = status.as_u16(), "http request failed");
            return Err(HttpError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_owned(),
            });
        }

        let text = response.text().await?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

// =============================================================================
// TESTS
// =============================================================================
