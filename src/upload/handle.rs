//! Caller-facing surface: [`Uploader`] and [`UploadHandle`].
//!
//! An `Uploader` is created once per endpoint and reused across uploads,
//! sharing its transport's connection pool. [`Uploader::begin_upload`] spawns
//! the session controller on the current runtime and returns an
//! [`UploadHandle`]: the producer side (`write`/`finish`/`cancel`) plus the
//! consumer-visible outcome (`progress` subscription and the `join` future).
//!
//! # Example
//!
//! ```no_run
//! use uploader_core::upload::{UploadConfig, UploadOutcome, Uploader};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let uploader = Uploader::new("https://storage.example.com");
//! let handle = uploader.begin_upload(
//!     UploadConfig::new("my-bucket", "hello.txt").with_total_length(11),
//! )?;
//! handle.write(&b"hello world"[..]);
//! handle.finish();
//! match handle.join().await? {
//!     UploadOutcome::Complete(metadata) => println!("uploaded {}", metadata.name),
//!     UploadOutcome::Suspended { session_uri, .. } => println!("parked at {session_uri}"),
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};
use url::Url;

use super::UploadError;
use super::byte_queue::ByteQueue;
use super::controller::SessionController;
use super::session::{ObjectMetadata, UploadConfig};
use super::status::{self, UploadStatus};
use super::transport::{
    AnonymousCredentials, CredentialProvider, ReqwestTransport, Transport,
};

/// Terminal result of an upload invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The object was finalized on the server.
    Complete(ObjectMetadata),
    /// A partial upload was intentionally left incomplete.
    ///
    /// Resume later by passing the session URI (and this offset) to a new
    /// upload with a fresh producer.
    Suspended {
        /// Session URI to resume under.
        session_uri: String,
        /// Bytes the server has acknowledged so far.
        confirmed_offset: u64,
    },
}

/// Progress snapshot published after every server acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    /// Bytes the server has acknowledged.
    pub bytes_written: u64,
    /// Declared total length, when known.
    pub total_length: Option<u64>,
}

/// Client for resumable uploads against one storage endpoint.
///
/// Cheap to clone; clones share the transport and its connection pool.
#[derive(Debug, Clone)]
pub struct Uploader {
    endpoint: String,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
}

impl Uploader {
    /// Creates an uploader with the default reqwest transport and anonymous
    /// credentials.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_transport(
            endpoint,
            Arc::new(ReqwestTransport::new()),
            Arc::new(AnonymousCredentials),
        )
    }

    /// Creates an uploader with an injected transport and credential provider.
    #[must_use]
    pub fn with_transport(
        endpoint: impl Into<String>,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            transport,
            credentials,
        }
    }

    /// Returns the configured endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Starts an upload and returns its handle.
    ///
    /// The session controller runs as a task on the current Tokio runtime;
    /// `write` calls feed it through the byte queue and never block.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::InvalidConfig`] or [`UploadError::InvalidUrl`]
    /// when the configuration or endpoint is rejected. Network failures
    /// surface later, through [`UploadHandle::join`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[instrument(skip(self, config), fields(bucket = %config.bucket, object = %config.object_name))]
    pub fn begin_upload(&self, config: UploadConfig) -> Result<UploadHandle, UploadError> {
        config.validate()?;
        Url::parse(&self.endpoint).map_err(|_| UploadError::invalid_url(&self.endpoint))?;
        if let Some(uri) = &config.resume_uri {
            Url::parse(uri).map_err(|_| UploadError::invalid_url(uri))?;
        }

        let queue = Arc::new(ByteQueue::new());
        let cancel = Arc::new(Notify::new());
        let (progress_tx, progress_rx) = watch::channel(UploadProgress {
            bytes_written: config.starting_offset.unwrap_or(0),
            total_length: config.total_length,
        });

        let controller = SessionController::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.credentials),
            self.endpoint.clone(),
            config,
            Arc::clone(&queue),
            progress_tx,
        );

        let cancel_signal = Arc::clone(&cancel);
        let queue_for_cancel = Arc::clone(&queue);
        let task = tokio::spawn(async move {
            tokio::select! {
                result = controller.run() => result,
                () = cancel_signal.notified() => {
                    // Dropping the controller future aborts any in-flight
                    // request; the queue is drained to release buffers.
                    debug!("upload cancelled by caller");
                    queue_for_cancel.clear();
                    Err(UploadError::Cancelled)
                }
            }
        });

        Ok(UploadHandle {
            queue,
            cancel,
            progress: progress_rx,
            task,
        })
    }

    /// Queries the server-confirmed state of an existing session.
    ///
    /// # Errors
    ///
    /// See [`status::probe_status`].
    pub async fn probe_status(&self, session_uri: &str) -> Result<UploadStatus, UploadError> {
        status::probe_status(&*self.transport, &*self.credentials, session_uri).await
    }
}

/// Handle to one in-flight upload.
///
/// The handle is the producer side of the session: push bytes with
/// [`write`](Self::write), signal the end of the stream with
/// [`finish`](Self::finish), then await [`join`](Self::join) for the
/// terminal outcome. The outcome (or error) is surfaced exactly once, as the
/// `join` value.
#[derive(Debug)]
pub struct UploadHandle {
    queue: Arc<ByteQueue>,
    cancel: Arc<Notify>,
    progress: watch::Receiver<UploadProgress>,
    task: JoinHandle<Result<UploadOutcome, UploadError>>,
}

impl UploadHandle {
    /// Feeds bytes to the upload. Never blocks.
    pub fn write(&self, chunk: impl Into<Bytes>) {
        self.queue.push(chunk.into());
    }

    /// Signals that the producer has no more data.
    pub fn finish(&self) {
        self.queue.finish();
    }

    /// Cancels the upload: aborts any in-flight request and releases all
    /// buffered memory. [`join`](Self::join) resolves to
    /// [`UploadError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }

    /// Returns a subscription to progress snapshots, updated after every
    /// server acknowledgment.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<UploadProgress> {
        self.progress.clone()
    }

    /// Waits for the upload to reach a terminal state.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that destroyed the upload: retry exhaustion,
    /// data loss, a server rejection, or cancellation.
    pub async fn join(self) -> Result<UploadOutcome, UploadError> {
        self.task
            .await
            .map_err(|e| UploadError::protocol(format!("upload task failed: {e}")))?
    }
}
