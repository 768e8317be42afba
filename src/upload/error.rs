//! Error types for the upload module.
//!
//! This module defines structured errors for all upload operations,
//! providing context-rich error messages for debugging and user feedback.

use thiserror::Error;

/// Errors that can occur during resumable uploads.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error uploading to {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout uploading to {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} uploading to {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429/503 responses).
        retry_after: Option<String>,
        /// A snippet of the response body, if any.
        body: Option<String>,
    },

    /// The upload session is gone on the server (404 on probe or chunk).
    #[error("upload session expired: {uri}")]
    SessionExpired {
        /// The session URI that is no longer valid.
        uri: String,
    },

    /// The server acknowledged fewer bytes than the client can replay.
    ///
    /// The unacknowledged suffix is no longer available in the replay cache,
    /// so the upload cannot be reconciled and must be restarted from scratch.
    #[error(
        "data loss: server confirmed {confirmed_offset} bytes but client wrote \
         {bytes_written} and cannot replay the missing suffix"
    )]
    DataLoss {
        /// Byte count the server has acknowledged.
        confirmed_offset: u64,
        /// Byte count the client has transmitted.
        bytes_written: u64,
    },

    /// The retry budget (max attempts or total timeout) is exhausted.
    #[error("retry budget exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of failed attempts performed.
        attempts: u32,
        /// The last failure observed.
        #[source]
        source: Box<UploadError>,
    },

    /// The server reported an application error inside a 2xx response.
    #[error("server rejected upload: {message}")]
    ServerRejected {
        /// The error message from the response envelope.
        message: String,
    },

    /// The server or client violated the resumable-upload protocol.
    #[error("protocol error: {detail}")]
    Protocol {
        /// What went wrong.
        detail: String,
    },

    /// The upload configuration is invalid.
    #[error("invalid upload configuration: {reason}")]
    InvalidConfig {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// The provided endpoint or session URI is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The upload was cancelled by the caller.
    #[error("upload cancelled")]
    Cancelled,
}

impl UploadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error without response context.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
            body: None,
        }
    }

    /// Creates an HTTP status error carrying Retry-After and body context.
    pub fn http_status_with_detail(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
        body: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
            body,
        }
    }

    /// Creates a session-expired error.
    pub fn session_expired(uri: impl Into<String>) -> Self {
        Self::SessionExpired { uri: uri.into() }
    }

    /// Creates a data-loss error.
    pub fn data_loss(confirmed_offset: u64, bytes_written: u64) -> Self {
        Self::DataLoss {
            confirmed_offset,
            bytes_written,
        }
    }

    /// Creates a retries-exhausted error wrapping the last failure.
    pub fn retries_exhausted(attempts: u32, source: UploadError) -> Self {
        Self::RetriesExhausted {
            attempts,
            source: Box::new(source),
        }
    }

    /// Creates a server-rejected error from a response envelope message.
    pub fn server_rejected(message: impl Into<String>) -> Self {
        Self::ServerRejected {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol {
            detail: detail.into(),
        }
    }

    /// Creates an invalid-configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }
}

// Note on From trait implementations:
// We intentionally do NOT implement `From<reqwest::Error>` because our error
// variants require context (the request URL) that the source error does not
// reliably provide. The helper constructors are the pattern used throughout.
