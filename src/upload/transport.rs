//! Request transport and credential seams for upload operations.
//!
//! The session controller never talks to the network directly: every request
//! goes through the [`Transport`] trait, and every request is signed by a
//! [`CredentialProvider`]. The production implementation is
//! [`ReqwestTransport`]; tests inject scripted transports to exercise the
//! retry and reconciliation paths.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use reqwest::header::{CONTENT_LENGTH, HeaderMap};
use reqwest::{Body, Client, Method, StatusCode};
use tracing::debug;

use super::UploadError;
use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};

/// Body of an outgoing request.
pub enum RequestBody {
    /// No body (status probes, finalize requests).
    Empty,
    /// A fully materialized body (session creation metadata, bounded chunks).
    Full(Bytes),
    /// A lazily produced body (open-ended chunk transmission).
    ///
    /// `length` is set when the total size is known upfront, so the
    /// transport can emit a Content-Length header instead of chunked
    /// transfer encoding.
    Stream {
        /// The byte stream to send.
        stream: BoxStream<'static, Result<Bytes, UploadError>>,
        /// Total body length, when known.
        length: Option<u64>,
    },
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Stream { length, .. } => f.debug_struct("Stream").field("length", length).finish(),
        }
    }
}

/// An outgoing request handed to a [`Transport`].
#[derive(Debug)]
pub struct TransportRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute request URL.
    pub url: String,
    /// Request headers (including Authorization when credentials apply).
    pub headers: HeaderMap,
    /// Request body.
    pub body: RequestBody,
}

impl TransportRequest {
    /// Creates a request with empty headers and no body.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }
}

/// A fully buffered response returned by a [`Transport`].
///
/// Resumable-protocol responses are small (headers plus a metadata JSON
/// document at most), so the body is read eagerly.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

impl TransportResponse {
    /// Returns a response header as a string slice, when present and valid.
    #[must_use]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Returns a snippet of the response body for error context.
    #[must_use]
    pub fn body_snippet(&self) -> Option<String> {
        if self.body.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.body);
        Some(text.chars().take(256).collect())
    }
}

/// Request-transport capability consumed by the session controller.
///
/// Implementations send one request and return the raw response without
/// interpreting the status code; classification is the retry engine's job.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Sends one request and returns the response.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::Timeout`] or [`UploadError::Network`] for
    /// transport-level failures. HTTP error statuses are NOT errors at this
    /// layer.
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, UploadError>;
}

/// Supplies an `Authorization` header value per request.
#[async_trait]
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    /// Returns the Authorization header value, or `None` for anonymous access.
    ///
    /// # Errors
    ///
    /// Returns an error when credentials cannot be produced (e.g. a token
    /// refresh failed); such errors are surfaced to the caller unretried.
    async fn authorization_header(&self) -> Result<Option<String>, UploadError>;
}

/// Credential provider for unauthenticated endpoints (emulators, tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousCredentials;

#[async_trait]
impl CredentialProvider for AnonymousCredentials {
    async fn authorization_header(&self) -> Result<Option<String>, UploadError> {
        Ok(None)
    }
}

/// Credential provider wrapping a static bearer token.
#[derive(Clone)]
pub struct StaticTokenCredentials {
    token: String,
}

impl StaticTokenCredentials {
    /// Creates a provider that sends `Bearer {token}` on every request.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticTokenCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The token itself must never reach logs.
        f.debug_struct("StaticTokenCredentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenCredentials {
    async fn authorization_header(&self) -> Result<Option<String>, UploadError> {
        Ok(Some(format!("Bearer {}", self.token)))
    }
}

/// Production transport backed by a pooled [`reqwest::Client`].
///
/// Designed to be created once and reused across uploads, taking advantage
/// of connection pooling.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestTransport {
    /// Creates a transport with default timeouts.
    ///
    /// Default configuration:
    /// - Connect timeout: 30 seconds
    /// - Read timeout: 5 minutes (for large chunk requests)
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    pub fn new() -> Self {
        Self::new_with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a transport with explicit timeout values.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the supplied
    /// timeout configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new_with_timeouts(connect_timeout_secs: u64, read_timeout_secs: u64) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .user_agent(crate::user_agent::default_upload_user_agent())
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, UploadError> {
        let url = request.url;
        debug!(method = %request.method, url = %url, body = ?request.body, "sending request");

        let mut builder = self
            .client
            .request(request.method, &url)
            .headers(request.headers);

        builder = match request.body {
            RequestBody::Empty => builder.header(CONTENT_LENGTH, 0),
            RequestBody::Full(bytes) => builder.body(bytes),
            RequestBody::Stream { stream, length } => {
                if let Some(length) = length {
                    builder = builder.header(CONTENT_LENGTH, length);
                }
                builder.body(Body::wrap_stream(stream))
            }
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                UploadError::timeout(&url)
            } else {
                UploadError::network(&url, e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| UploadError::network(&url, e))?;

        debug!(status = status.as_u16(), body_len = body.len(), "response received");

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
