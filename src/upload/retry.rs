//! Retry logic with exponential backoff for transient upload failures.
//!
//! This module provides the [`RetryPolicy`] and [`FailureType`] types for
//! classifying upload errors and determining retry behavior. The same policy
//! wraps all three network operations of a session: session creation, the
//! status probe, and chunk transmission.
//!
//! # Overview
//!
//! When a request fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::Permanent`] - Failures that won't succeed regardless of retries
//! - [`FailureType::SessionExpired`] - The server no longer knows the session
//! - [`FailureType::RateLimited`] - Server rate limiting (retries with backoff)
//!
//! [`RetryPolicy::evaluate`] then either returns the delay to sleep before
//! the next attempt or converts the failure into a fatal error, tracking both
//! the attempt count and the cumulative time budget in [`RetryState`].
//!
//! # Delay Calculation
//!
//! ```text
//! delay = min(base_delay * multiplier^attempt + jitter, max_delay, remaining_budget)
//! ```
//!
//! A `Retry-After` header on 429/503 responses raises the delay to the
//! server-mandated minimum, still clamped by the remaining budget. A session
//! that expired before any data was sent is retried immediately: the next
//! request is self-contained and loses nothing by restarting at once.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, instrument};

use super::UploadError;
use super::constants::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES,
    DEFAULT_TOTAL_TIMEOUT, MAX_JITTER, MAX_RETRY_AFTER,
};

/// Classification function injected into a [`RetryPolicy`].
pub type ClassifyFn = fn(&UploadError) -> FailureType;

/// Classification of upload failure types.
///
/// Used to determine whether a failed request should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, 5xx server errors, connection refused.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 400 Bad Request, data loss, invalid configuration.
    Permanent,

    /// The server responded 404 for the session URI.
    ///
    /// Recoverable by restarting transmission under a fresh session, but
    /// only when the failed request carried no data.
    SessionExpired,

    /// Server rate limiting (HTTP 429).
    ///
    /// Retries with exponential backoff, honoring Retry-After when present.
    RateLimited,
}

/// Attempt counting and budget tracking for one upload session.
///
/// Lives for the lifetime of one session; reset only when a fresh session
/// URI is acquired.
#[derive(Debug, Clone)]
pub struct RetryState {
    failures: u32,
    started: Instant,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryState {
    /// Creates a fresh state with zero failures and the budget clock started.
    #[must_use]
    pub fn new() -> Self {
        Self {
            failures: 0,
            started: Instant::now(),
        }
    }

    /// Resets the counter and the budget clock (fresh session URI acquired).
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Returns the number of failures recorded so far.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns the time elapsed since the first attempt.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `base_delay`: 1 second
/// - `max_delay`: 64 seconds
/// - `backoff_multiplier`: 2.0
/// - `total_timeout`: 600 seconds
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt (typically 2.0 for doubling).
    backoff_multiplier: f32,

    /// Cumulative budget across all attempts of one session.
    total_timeout: Duration,

    /// Injectable retryable-vs-fatal predicate.
    classify: ClassifyFn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            total_timeout: DEFAULT_TOTAL_TIMEOUT,
            classify: classify_error,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum attempts including initial (must be >= 1)
    /// * `base_delay` - Base delay for first retry
    /// * `max_delay` - Maximum delay cap
    /// * `backoff_multiplier` - Multiplier for exponential increase
    /// * `total_timeout` - Cumulative budget across all attempts
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
        total_timeout: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            total_timeout,
            classify: classify_error,
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults otherwise.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Replaces the total timeout budget.
    #[must_use]
    pub fn with_total_timeout(mut self, total_timeout: Duration) -> Self {
        self.total_timeout = total_timeout;
        self
    }

    /// Replaces the failure classification predicate.
    #[must_use]
    pub fn with_classifier(mut self, classify: ClassifyFn) -> Self {
        self.classify = classify;
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the cumulative timeout budget.
    #[must_use]
    pub fn total_timeout(&self) -> Duration {
        self.total_timeout
    }

    /// Classifies an error with the configured predicate.
    #[must_use]
    pub fn classify(&self, error: &UploadError) -> FailureType {
        (self.classify)(error)
    }

    /// Decides what to do about a failed request.
    ///
    /// Records the failure in `state` and returns the delay to sleep before
    /// retrying, or the fatal error to surface. `zero_bytes_sent` reports
    /// whether the failed request carried any of the current chunk: an
    /// expired session is only restartable when it did not.
    ///
    /// # Errors
    ///
    /// Returns the original error for permanent failures, and
    /// [`UploadError::RetriesExhausted`] when the attempt count or the total
    /// timeout budget is spent.
    #[instrument(skip(self, error, state), fields(max_attempts = self.max_attempts))]
    pub fn evaluate(
        &self,
        error: UploadError,
        state: &mut RetryState,
        zero_bytes_sent: bool,
    ) -> Result<Duration, UploadError> {
        let failure = (self.classify)(&error);
        state.failures += 1;
        let attempt = state.failures;

        match failure {
            FailureType::Permanent => return Err(error),
            FailureType::SessionExpired if !zero_bytes_sent => return Err(error),
            FailureType::SessionExpired | FailureType::Transient | FailureType::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return Err(UploadError::retries_exhausted(attempt, error));
        }

        // An expired session is retried immediately: no data was sent, so
        // the restarted request is self-contained.
        if failure == FailureType::SessionExpired {
            debug!(attempt, "session expired before data was sent; restarting");
            return Ok(Duration::ZERO);
        }

        let Some(remaining) = self
            .total_timeout
            .checked_sub(state.elapsed())
            .filter(|left| !left.is_zero())
        else {
            debug!(
                budget_ms = self.total_timeout.as_millis(),
                "total timeout budget exhausted"
            );
            return Err(UploadError::retries_exhausted(attempt, error));
        };

        let mut delay = self.calculate_delay(attempt);
        if let Some(server_delay) = retry_after_hint(&error) {
            delay = delay.max(server_delay);
        }
        let delay = delay.min(remaining);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            remaining_budget_ms = remaining.as_millis(),
            "will retry"
        );

        Ok(delay)
    }

    /// Calculates the delay for a retry attempt with exponential backoff and jitter.
    ///
    /// Formula: `min(base_delay * multiplier^attempt, max_delay) + jitter`
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        // attempt is 0-indexed for the exponent (attempt 1 = 2^0 = 1x base)
        let exponent = f64::from(attempt - 1);
        let delay_ms = base_ms * multiplier.powf(exponent);

        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let capped = Duration::from_millis(capped_ms as u64);
        capped + calculate_jitter()
    }
}

/// Generates random jitter between 0 and [`MAX_JITTER`].
///
/// Jitter prevents thundering herd when multiple uploads fail
/// simultaneously and retry at the same time.
fn calculate_jitter() -> Duration {
    let mut rng = rand::thread_rng();
    #[allow(clippy::cast_possible_truncation)]
    let jitter_ms = rng.gen_range(0..=MAX_JITTER.as_millis() as u64);
    Duration::from_millis(jitter_ms)
}

/// Extracts a parsed Retry-After delay from a rate-limited error.
fn retry_after_hint(error: &UploadError) -> Option<Duration> {
    match error {
        UploadError::HttpStatus {
            retry_after: Some(value),
            ..
        } => parse_retry_after(value),
        _ => None,
    }
}

/// Parses a Retry-After header value into a duration.
///
/// Supports both forms from RFC 7231: delay-seconds (`"120"`) and an
/// HTTP-date (`"Wed, 21 Oct 2015 07:28:00 GMT"`). Values are capped at
/// [`MAX_RETRY_AFTER`]; unparseable values yield `None`.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let trimmed = value.trim();

    let delay = if let Ok(seconds) = trimmed.parse::<u64>() {
        Duration::from_secs(seconds)
    } else {
        let date = httpdate::parse_http_date(trimmed).ok()?;
        date.duration_since(std::time::SystemTime::now())
            .unwrap_or(Duration::ZERO)
    };

    Some(delay.min(MAX_RETRY_AFTER))
}

/// Classifies an upload error into a failure type for retry decisions.
///
/// # HTTP Status Code Classification
///
/// | Status | Type | Rationale |
/// |--------|------|-----------|
/// | 400 | Permanent | Bad request - won't succeed on retry |
/// | 401 | Permanent | Unauthorized - fresh credentials won't appear mid-session |
/// | 403 | Permanent | Forbidden |
/// | 404 | SessionExpired | Session gone - restartable when no data was sent |
/// | 408 | Transient | Request timeout - may succeed |
/// | 429 | RateLimited | Rate limited - retry with backoff |
/// | 500 | Transient | Server error - may be temporary |
/// | 502 | Transient | Bad gateway - proxy issue |
/// | 503 | Transient | Service unavailable - temporary |
/// | 504 | Transient | Gateway timeout - temporary |
///
/// # Non-HTTP Errors
///
/// | Error | Type | Rationale |
/// |-------|------|-----------|
/// | Timeout | Transient | Network may recover |
/// | Network (most) | Transient | Server may come back |
/// | Network (TLS) | Permanent | Certificate/config issue |
/// | SessionExpired | SessionExpired | Propagated from a probe |
/// | DataLoss, ServerRejected, Protocol, ... | Permanent | Retry would not help |
#[instrument]
pub fn classify_error(error: &UploadError) -> FailureType {
    match error {
        UploadError::HttpStatus { status, .. } => classify_http_status(*status),

        UploadError::Timeout { .. } => FailureType::Transient,

        UploadError::Network { source, .. } => {
            // TLS/certificate failures are configuration problems.
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }

        UploadError::SessionExpired { .. } => FailureType::SessionExpired,

        UploadError::DataLoss { .. }
        | UploadError::RetriesExhausted { .. }
        | UploadError::ServerRejected { .. }
        | UploadError::Protocol { .. }
        | UploadError::InvalidConfig { .. }
        | UploadError::InvalidUrl { .. }
        | UploadError::Cancelled => FailureType::Permanent,
    }
}

/// Classifies an HTTP status code into a failure type.
///
/// Explicit match arms are used for each status code for documentation
/// purposes, even though some return the same value.
#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        // Client errors - mostly permanent
        400 => FailureType::Permanent,      // Bad Request
        401 => FailureType::Permanent,      // Unauthorized
        403 => FailureType::Permanent,      // Forbidden
        404 => FailureType::SessionExpired, // Session gone
        408 => FailureType::Transient,      // Request Timeout
        429 => FailureType::RateLimited,    // Too Many Requests

        // Server errors - transient
        500 => FailureType::Transient, // Internal Server Error
        502 => FailureType::Transient, // Bad Gateway
        503 => FailureType::Transient, // Service Unavailable
        504 => FailureType::Transient, // Gateway Timeout

        // Other 4xx are generally permanent
        status if (400..500).contains(&status) => FailureType::Permanent,

        // Other 5xx are generally transient
        status if (500..600).contains(&status) => FailureType::Transient,

        // Anything else is unexpected, treat as permanent
        _ => FailureType::Permanent,
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
