//! Constants for the upload module (timeouts, chunking, retry defaults).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large chunk requests).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Chunk granularity required by the resumable protocol (256 KiB).
///
/// Every configured chunk size must be a positive multiple of this value;
/// only the final chunk of an upload may be shorter.
pub const CHUNK_GRANULARITY: u64 = 256 * 1024;

/// Default maximum retry attempts (including the initial attempt).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (1 second).
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap between retries (64 seconds).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(64);

/// Default cumulative timeout budget across all attempts of one session.
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(600);

/// Default backoff multiplier (doubles each attempt).
pub const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to backoff delays (1 second).
pub const MAX_JITTER: Duration = Duration::from_millis(1000);

/// Maximum honored Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);
