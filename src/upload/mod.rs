//! Resumable chunked upload engine for object storage.
//!
//! This module implements the client side of a session-based resumable
//! upload protocol: an arbitrarily large byte stream is transferred to a
//! remote endpoint as a sequence of acknowledged requests, surviving
//! transient network failures, server restarts, and intentional suspension.
//!
//! # Features
//!
//! - Non-blocking ingestion: producers push buffers, the transmission task
//!   pulls exactly what each request needs
//! - Offset reconciliation against server acknowledgments, with replay of
//!   unacknowledged suffixes and data-loss detection
//! - Bounded-chunk and single-request transmission modes
//! - Exponential backoff with jitter, Retry-After support, and a cumulative
//!   timeout budget
//! - Suspend/resume of partial uploads via the session URI and status probe
//!
//! # Example
//!
//! ```no_run
//! use uploader_core::upload::{UploadConfig, Uploader};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let uploader = Uploader::new("https://storage.example.com");
//! let handle = uploader.begin_upload(
//!     UploadConfig::new("my-bucket", "archive.tar").with_chunk_size(8 * 256 * 1024),
//! )?;
//! handle.write(&b"payload"[..]);
//! handle.finish();
//! let outcome = handle.join().await?;
//! println!("done: {outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod byte_queue;
pub mod constants;
mod controller;
mod error;
mod handle;
mod retry;
mod session;
mod status;
pub mod transport;

pub use byte_queue::ByteQueue;
pub use error::UploadError;
pub use handle::{UploadHandle, UploadOutcome, UploadProgress, Uploader};
pub use retry::{FailureType, RetryPolicy, RetryState, classify_error, parse_retry_after};
pub use session::{EncryptionKey, ObjectMetadata, UploadConfig};
pub use status::{UploadStatus, probe_status};
pub use transport::{
    AnonymousCredentials, CredentialProvider, ReqwestTransport, RequestBody,
    StaticTokenCredentials, Transport, TransportRequest, TransportResponse,
};

// Note: Per project-context.md, we do NOT define module-local Result aliases.
// Use `Result<T, UploadError>` explicitly in function signatures.
