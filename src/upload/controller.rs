//! Session controller: the resumable-upload state machine.
//!
//! One controller drives one object upload through its full lifecycle:
//! acquire a session URI, transmit chunks, await acknowledgments, reconcile
//! the client-side written counter against the server-confirmed offset, and
//! repeat until the object is finalized, the session is suspended, or a
//! fatal error destroys the upload.
//!
//! # State
//!
//! All mutable state (`bytes_written`, `offset`, the replay cache, the retry
//! state) is owned exclusively by the controller instance; nothing is shared
//! across tasks except the byte queue fed by the producer and the replay
//! cache teed from in-flight request bodies.
//!
//! # Reconciliation
//!
//! Before every transmission the controller aligns its written-byte counter
//! with the server's confirmed offset:
//!
//! - server behind (`offset < bytes_written`): the unacknowledged suffix is
//!   moved from the replay cache back to the front of the byte queue and the
//!   counter is rolled back, so the next request resends exactly that suffix.
//! - server ahead (`offset > bytes_written`): bytes pulled from the producer
//!   are discarded until the counters meet (resuming a prior session).
//! - aligned: transmit directly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE, HeaderMap, HeaderValue};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::UploadError;
use super::byte_queue::ByteQueue;
use super::handle::{UploadOutcome, UploadProgress};
use super::retry::RetryState;
use super::session::{EncryptionKey, ObjectMetadata, UploadConfig, parse_final_metadata};
use super::status::{UploadStatus, confirmed_offset_from_response, probe_status};
use super::transport::{
    CredentialProvider, RequestBody, Transport, TransportRequest, TransportResponse,
};

/// Content-Range header shapes emitted by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContentRange {
    /// A bounded chunk with a known byte count.
    ///
    /// The total is stated only on the request known to carry the final byte.
    Chunk {
        start: u64,
        len: u64,
        total: Option<u64>,
    },
    /// An open-ended body whose length is discovered as the stream ends.
    Open { start: u64, total: Option<u64> },
    /// A zero-length request that finalizes the object at `total` bytes.
    Finalize { total: u64 },
}

impl std::fmt::Display for ContentRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Chunk { start, len, total } => {
                let end = start + len - 1;
                match total {
                    Some(total) => write!(f, "bytes {start}-{end}/{total}"),
                    None => write!(f, "bytes {start}-{end}/*"),
                }
            }
            Self::Open { start, total } => match total {
                Some(total) => write!(f, "bytes {start}-*/{total}"),
                None => write!(f, "bytes {start}-*/*"),
            },
            Self::Finalize { total } => write!(f, "bytes */{total}"),
        }
    }
}

/// Ordered buffers transmitted but not yet confirmed by the server.
///
/// Teed from request bodies as they are pulled from the byte queue, so the
/// unacknowledged suffix can be resent without asking the producer again.
#[derive(Debug, Default)]
pub(crate) struct ReplayCache {
    buffers: Mutex<VecDeque<Bytes>>,
}

impl ReplayCache {
    fn push(&self, chunk: Bytes) {
        self.lock().push_back(chunk);
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn cached_bytes(&self) -> u64 {
        self.lock().iter().map(|b| b.len() as u64).sum()
    }

    /// Drains the cache, returning its last `missing` bytes in order.
    ///
    /// The prefix ahead of the suffix is confirmed by the server and is
    /// dropped. Returns `None` when the cache holds fewer than `missing`
    /// bytes, which is the unrecoverable data-loss condition.
    fn split_off_suffix(&self, missing: u64) -> Option<Vec<Bytes>> {
        let mut buffers = self.lock();
        let total: u64 = buffers.iter().map(|b| b.len() as u64).sum();
        if total < missing {
            return None;
        }

        let mut skip = total - missing;
        let mut suffix = Vec::new();
        for mut chunk in buffers.drain(..) {
            if skip >= chunk.len() as u64 {
                skip -= chunk.len() as u64;
                continue;
            }
            if skip > 0 {
                #[allow(clippy::cast_possible_truncation)]
                let chunk = chunk.split_off(skip as usize);
                skip = 0;
                suffix.push(chunk);
            } else {
                suffix.push(chunk);
            }
        }
        Some(suffix)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Bytes>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of one chunk request round trip.
#[derive(Debug)]
enum ChunkOutcome {
    /// 2xx: the object is finalized.
    Complete(ObjectMetadata),
    /// 308: the server acknowledged a prefix and expects more.
    Continue { confirmed: u64 },
    /// The producer is exhausted and the session is parked for later resume.
    Suspended,
}

/// Drives one upload session from start to a terminal state.
#[derive(Debug)]
pub(crate) struct SessionController {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    endpoint: String,
    config: UploadConfig,
    queue: Arc<ByteQueue>,
    progress: watch::Sender<UploadProgress>,
    session_uri: Option<String>,
    /// Last byte count the server has acknowledged receiving.
    offset: u64,
    /// Bytes this client has attempted to send in requests so far.
    bytes_written: u64,
    cache: Arc<ReplayCache>,
    /// Bytes pulled into the in-flight request; folded into `bytes_written`
    /// when the request resolves.
    sent_this_attempt: Arc<AtomicU64>,
    retry_state: RetryState,
}

impl SessionController {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
        endpoint: String,
        config: UploadConfig,
        queue: Arc<ByteQueue>,
        progress: watch::Sender<UploadProgress>,
    ) -> Self {
        Self {
            transport,
            credentials,
            endpoint,
            config,
            queue,
            progress,
            session_uri: None,
            offset: 0,
            bytes_written: 0,
            cache: Arc::new(ReplayCache::default()),
            sent_this_attempt: Arc::new(AtomicU64::new(0)),
            retry_state: RetryState::new(),
        }
    }

    /// Runs the upload to a terminal state.
    #[instrument(skip(self), fields(bucket = %self.config.bucket, object = %self.config.object_name))]
    pub(crate) async fn run(mut self) -> Result<UploadOutcome, UploadError> {
        if let Some(uri) = self.config.resume_uri.clone() {
            self.session_uri = Some(uri.clone());
            match self.config.starting_offset {
                Some(offset) => self.offset = offset,
                None => {
                    // Learn the confirmed offset from the server before
                    // touching the producer stream.
                    if let Some(metadata) = self.resolve_resume_offset(&uri).await? {
                        return Ok(UploadOutcome::Complete(*metadata));
                    }
                }
            }
            if self.session_uri.is_some() {
                info!(offset = self.offset, "resuming upload session");
            }
        }

        loop {
            if self.session_uri.is_none() {
                self.acquire_session_uri().await?;
            }

            self.reconcile().await?;

            match self.transmit_chunk().await {
                Ok(ChunkOutcome::Complete(metadata)) => {
                    self.cache.clear();
                    self.publish_progress();
                    info!(bytes = self.bytes_written, "upload complete");
                    return Ok(UploadOutcome::Complete(metadata));
                }
                Ok(ChunkOutcome::Suspended) => {
                    let session_uri = self
                        .session_uri
                        .clone()
                        .ok_or_else(|| UploadError::protocol("suspended without a session URI"))?;
                    info!(
                        confirmed_offset = self.offset,
                        "upload suspended; resume with the same session URI"
                    );
                    return Ok(UploadOutcome::Suspended {
                        session_uri,
                        confirmed_offset: self.offset,
                    });
                }
                Ok(ChunkOutcome::Continue { confirmed }) => {
                    self.apply_confirmed(confirmed)?;
                }
                Err(error) => {
                    let restartable = matches!(error, UploadError::SessionExpired { .. })
                        && self.bytes_written == 0;
                    let delay =
                        self.config
                            .retry
                            .evaluate(error, &mut self.retry_state, restartable)?;

                    if restartable {
                        // The session vanished before any data was sent; the
                        // next request is self-contained, so restart at once
                        // under a fresh session instead of waiting out the
                        // backoff.
                        warn!("session expired before data was sent; restarting");
                        // The original session is gone; the fresh one starts
                        // from byte zero regardless of any resume offset.
                        self.session_uri = None;
                        self.config.resume_uri = None;
                        self.config.starting_offset = None;
                        self.offset = 0;
                        continue;
                    }

                    tokio::time::sleep(delay).await;

                    // Re-query the server-confirmed offset so the next
                    // transmission reconciles against ground truth rather
                    // than an assumption.
                    if let Some(metadata) = self.refresh_offset_from_probe().await {
                        self.publish_progress();
                        return Ok(UploadOutcome::Complete(metadata));
                    }
                }
            }
        }
    }

    /// Probes the resume session for its confirmed offset, retrying per
    /// policy.
    ///
    /// Returns final metadata when the object is already complete. A 404
    /// means the session to resume is gone: the resume request is dropped
    /// and the upload restarts from scratch under a fresh session.
    async fn resolve_resume_offset(
        &mut self,
        uri: &str,
    ) -> Result<Option<Box<ObjectMetadata>>, UploadError> {
        loop {
            match probe_status(&*self.transport, &*self.credentials, uri).await {
                Ok(UploadStatus::Complete(metadata)) => return Ok(Some(metadata)),
                Ok(UploadStatus::Incomplete { confirmed_offset }) => {
                    self.offset = confirmed_offset;
                    return Ok(None);
                }
                Err(error) => {
                    let expired = matches!(error, UploadError::SessionExpired { .. });
                    let delay = self
                        .config
                        .retry
                        .evaluate(error, &mut self.retry_state, true)?;
                    if expired {
                        warn!("session to resume is gone; restarting from scratch");
                        self.session_uri = None;
                        self.config.resume_uri = None;
                        self.config.starting_offset = None;
                        self.offset = 0;
                        return Ok(None);
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Issues the session-creation request, retrying per policy.
    ///
    /// Re-issuing this request is safe: no bytes have been sent, and any
    /// extra sessions created by a retried call are simply never used.
    async fn acquire_session_uri(&mut self) -> Result<(), UploadError> {
        loop {
            match self.create_session_attempt().await {
                Ok(uri) => {
                    info!(session_uri = %uri, "upload session created");
                    self.session_uri = Some(uri);
                    self.offset = self.config.starting_offset.unwrap_or(0);
                    // A fresh session URI resets the retry budget.
                    self.retry_state.reset();
                    return Ok(());
                }
                Err(error) => {
                    let delay = self
                        .config
                        .retry
                        .evaluate(error, &mut self.retry_state, true)?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn create_session_attempt(&self) -> Result<String, UploadError> {
        let mut url = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=resumable&name={}",
            self.endpoint,
            self.config.bucket,
            urlencoding::encode(&self.config.object_name),
        );
        if let Some(acl) = &self.config.predefined_acl {
            url.push_str("&predefinedAcl=");
            url.push_str(&urlencoding::encode(acl));
        }
        if let Some(kms_key) = &self.config.kms_key {
            url.push_str("&kmsKeyName=");
            url.push_str(&urlencoding::encode(kms_key));
        }

        let mut request = TransportRequest::new(Method::POST, &url);
        request.headers = self.base_headers().await?;
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(total) = self.config.total_length {
            request.headers.insert(
                "x-upload-content-length",
                header_value(&total.to_string())?,
            );
        }

        let metadata = serde_json::json!({ "name": self.config.object_name });
        let body = serde_json::to_vec(&metadata)
            .map_err(|e| UploadError::protocol(format!("unserializable session metadata: {e}")))?;
        request.body = RequestBody::Full(Bytes::from(body));

        let response = self.transport.send(request).await?;
        if !response.status.is_success() {
            return Err(self.response_error(&url, &response));
        }

        response
            .header_str("Location")
            .map(str::to_string)
            .ok_or_else(|| {
                UploadError::protocol("missing Location header in session-creation response")
            })
    }

    /// Aligns the written-byte counter with the server-confirmed offset.
    ///
    /// After this returns, `offset == bytes_written` and the replay cache is
    /// empty: the unacknowledged suffix (if any) sits at the front of the
    /// byte queue, ready to be resent.
    async fn reconcile(&mut self) -> Result<(), UploadError> {
        if self.offset < self.bytes_written {
            let missing = self.bytes_written - self.offset;
            let Some(suffix) = self.cache.split_off_suffix(missing) else {
                return Err(UploadError::data_loss(self.offset, self.bytes_written));
            };
            debug!(
                missing,
                offset = self.offset,
                bytes_written = self.bytes_written,
                "server behind client; requeueing unacknowledged suffix"
            );
            self.queue.requeue_front(suffix);
            self.bytes_written = self.offset;
        } else if self.offset > self.bytes_written {
            let skip = self.offset - self.bytes_written;
            debug!(
                skip,
                offset = self.offset,
                "server ahead of client; fast-forwarding producer stream"
            );
            self.cache.clear();
            let discarded = self.queue.discard(skip).await;
            if discarded < skip {
                return Err(UploadError::protocol(format!(
                    "cannot fast-forward to offset {}: producer ended after {} of {} bytes; \
                     resuming requires re-feeding the stream from the beginning",
                    self.offset,
                    discarded,
                    skip
                )));
            }
            self.bytes_written = self.offset;
        } else {
            // Aligned: everything transmitted is confirmed.
            self.cache.clear();
        }
        Ok(())
    }

    /// Sends one request (chunk, open-ended stream, or finalize) and maps
    /// its response.
    async fn transmit_chunk(&mut self) -> Result<ChunkOutcome, UploadError> {
        // Suspend until the producer delivers data or signals completion;
        // the decision between transmitting and ending the session must see
        // one of the two.
        let has_data = self.queue.wait_for_data().await;

        // Everything available has been transmitted and confirmed; decide
        // how the session ends.
        if !has_data {
            if self.config.partial {
                return Ok(ChunkOutcome::Suspended);
            }
            if let Some(total) = self.config.total_length {
                if total != self.bytes_written {
                    return Err(UploadError::protocol(format!(
                        "producer ended at {} bytes but {} were declared",
                        self.bytes_written, total
                    )));
                }
            }
            return self.send_finalize().await;
        }

        match self.next_request_bound() {
            Some(limit) => self.send_bounded_chunk(limit).await,
            None => self.send_open_stream().await,
        }
    }

    /// Upload size for the next request: min(chunk size, remaining known
    /// length), or `None` when neither bound is known.
    fn next_request_bound(&self) -> Option<u64> {
        let remaining = self
            .config
            .total_length
            .map(|total| total.saturating_sub(self.bytes_written));
        match (self.config.chunk_size, remaining) {
            (Some(chunk), Some(remaining)) => Some(chunk.min(remaining)),
            (Some(chunk), None) => Some(chunk),
            (None, Some(remaining)) => Some(remaining),
            (None, None) => None,
        }
    }

    /// Collects up to `limit` bytes, caching every buffer pulled, then sends
    /// them as one bounded request.
    async fn send_bounded_chunk(&mut self, limit: u64) -> Result<ChunkOutcome, UploadError> {
        let (buffers, exhausted) = self.collect_chunk(limit).await;
        let size: u64 = buffers.iter().map(|b| b.len() as u64).sum();

        if size == 0 {
            // Data is buffered but the declared total leaves no room for it.
            return Err(UploadError::protocol(format!(
                "producer delivered more than the declared total of {} bytes",
                self.config.total_length.unwrap_or(0)
            )));
        }

        let is_final = match self.config.total_length {
            Some(total) => self.bytes_written + size == total,
            None => exhausted && !self.config.partial,
        };
        let range = ContentRange::Chunk {
            start: self.bytes_written,
            len: size,
            total: is_final.then(|| self.bytes_written + size),
        };

        let stream = futures_util::stream::iter(buffers.into_iter().map(Ok)).boxed();
        let response = self
            .send_session_request(range, RequestBody::Stream { stream, length: Some(size) })
            .await;
        self.fold_sent();
        self.handle_chunk_response(response?)
    }

    /// Streams the producer's bytes in one open-ended request, caching and
    /// counting each buffer as it is pulled.
    async fn send_open_stream(&mut self) -> Result<ChunkOutcome, UploadError> {
        let range = ContentRange::Open {
            start: self.bytes_written,
            total: self.config.total_length,
        };
        let stream = tee_queue_stream(
            Arc::clone(&self.queue),
            Arc::clone(&self.cache),
            Arc::clone(&self.sent_this_attempt),
        );
        let response = self
            .send_session_request(range, RequestBody::Stream { stream, length: None })
            .await;
        self.fold_sent();
        self.handle_chunk_response(response?)
    }

    /// Sends the zero-length request that finalizes the object at the
    /// current written count. Covers the empty-object case (`bytes */0`).
    async fn send_finalize(&mut self) -> Result<ChunkOutcome, UploadError> {
        let range = ContentRange::Finalize {
            total: self.bytes_written,
        };
        let response = self.send_session_request(range, RequestBody::Empty).await;
        self.handle_chunk_response(response?)
    }

    async fn send_session_request(
        &self,
        range: ContentRange,
        body: RequestBody,
    ) -> Result<TransportResponse, UploadError> {
        let session_uri = self
            .session_uri
            .clone()
            .ok_or_else(|| UploadError::protocol("transmitting without a session URI"))?;

        let mut request = TransportRequest::new(Method::PUT, &session_uri);
        request.headers = self.base_headers().await?;
        request
            .headers
            .insert(CONTENT_RANGE, header_value(&range.to_string())?);
        request.body = body;

        debug!(content_range = %range, "transmitting");
        self.transport.send(request).await
    }

    fn handle_chunk_response(
        &mut self,
        response: TransportResponse,
    ) -> Result<ChunkOutcome, UploadError> {
        let status = response.status.as_u16();
        match status {
            200 | 201 => {
                let metadata = parse_final_metadata(&response.body)?;
                self.offset = self.bytes_written;
                Ok(ChunkOutcome::Complete(metadata))
            }
            308 => {
                let confirmed = confirmed_offset_from_response(&response)?;
                Ok(ChunkOutcome::Continue { confirmed })
            }
            404 => {
                let uri = self.session_uri.as_deref().unwrap_or_default();
                Err(UploadError::session_expired(uri))
            }
            _ => {
                let uri = self.session_uri.clone().unwrap_or_default();
                Err(self.response_error(&uri, &response))
            }
        }
    }

    /// Records a server acknowledgment from a 308 response.
    fn apply_confirmed(&mut self, confirmed: u64) -> Result<(), UploadError> {
        if confirmed > self.bytes_written {
            // The server cannot have bytes this client never sent.
            return Err(UploadError::protocol(format!(
                "server acknowledged {} bytes but only {} were transmitted",
                confirmed, self.bytes_written
            )));
        }
        self.offset = confirmed;
        if confirmed == self.bytes_written {
            // Fully and unambiguously confirmed.
            self.cache.clear();
        }
        debug!(
            confirmed,
            bytes_written = self.bytes_written,
            "server acknowledged prefix"
        );
        self.publish_progress();
        Ok(())
    }

    /// Folds the in-flight byte count into the written counter once a
    /// request has resolved (successfully or not).
    fn fold_sent(&mut self) {
        self.bytes_written += self.sent_this_attempt.swap(0, Ordering::SeqCst);
    }

    async fn collect_chunk(&self, limit: u64) -> (Vec<Bytes>, bool) {
        let mut buffers = Vec::new();
        let mut collected = 0u64;
        while collected < limit {
            match self.queue.pull(limit - collected).await {
                Some(chunk) => {
                    collected += chunk.len() as u64;
                    self.cache.push(chunk.clone());
                    self.sent_this_attempt
                        .fetch_add(chunk.len() as u64, Ordering::SeqCst);
                    buffers.push(chunk);
                }
                None => return (buffers, true),
            }
        }
        (buffers, false)
    }

    /// Best-effort probe for the confirmed offset before a retry.
    ///
    /// Returns final metadata when the probe discovers the object already
    /// complete. Probe failures leave the current offset in place; the next
    /// transmission surfaces the real error.
    async fn refresh_offset_from_probe(&mut self) -> Option<ObjectMetadata> {
        let uri = self.session_uri.clone()?;
        match probe_status(&*self.transport, &*self.credentials, &uri).await {
            Ok(UploadStatus::Complete(metadata)) => Some(*metadata),
            Ok(UploadStatus::Incomplete { confirmed_offset }) => {
                debug!(confirmed_offset, "probe refreshed confirmed offset");
                self.offset = confirmed_offset;
                None
            }
            Err(error) => {
                warn!(error = %error, "status probe failed; keeping last known offset");
                None
            }
        }
    }

    async fn base_headers(&self) -> Result<HeaderMap, UploadError> {
        let mut headers = HeaderMap::new();
        if let Some(authorization) = self.credentials.authorization_header().await? {
            headers.insert(AUTHORIZATION, header_value(&authorization)?);
        }
        if let Some(key) = &self.config.encryption_key {
            apply_encryption_headers(&mut headers, key)?;
        }
        Ok(headers)
    }

    fn response_error(&self, url: &str, response: &TransportResponse) -> UploadError {
        UploadError::http_status_with_detail(
            url,
            response.status.as_u16(),
            response.header_str("Retry-After").map(str::to_string),
            response.body_snippet(),
        )
    }

    fn publish_progress(&self) {
        let _ = self.progress.send(UploadProgress {
            bytes_written: self.offset,
            total_length: self.config.total_length,
        });
    }
}

/// Builds a body stream that pulls from the queue until producer
/// exhaustion, teeing every buffer into the replay cache and counting it as
/// sent.
fn tee_queue_stream(
    queue: Arc<ByteQueue>,
    cache: Arc<ReplayCache>,
    sent: Arc<AtomicU64>,
) -> BoxStream<'static, Result<Bytes, UploadError>> {
    futures_util::stream::unfold((queue, cache, sent), |(queue, cache, sent)| async move {
        match queue.pull(u64::MAX).await {
            Some(chunk) => {
                cache.push(chunk.clone());
                sent.fetch_add(chunk.len() as u64, Ordering::SeqCst);
                Some((Ok(chunk), (queue, cache, sent)))
            }
            None => None,
        }
    })
    .boxed()
}

fn apply_encryption_headers(
    headers: &mut HeaderMap,
    key: &EncryptionKey,
) -> Result<(), UploadError> {
    headers.insert(
        "x-goog-encryption-algorithm",
        HeaderValue::from_static("AES256"),
    );
    headers.insert("x-goog-encryption-key", header_value(&key.key_base64())?);
    headers.insert(
        "x-goog-encryption-key-sha256",
        header_value(&key.sha256_base64())?,
    );
    Ok(())
}

fn header_value(value: &str) -> Result<HeaderValue, UploadError> {
    HeaderValue::from_str(value)
        .map_err(|_| UploadError::protocol(format!("invalid header value: {value}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::upload::transport::AnonymousCredentials;
    use async_trait::async_trait;

    /// Transport stub for tests that never reach the network.
    #[derive(Debug)]
    struct UnreachableTransport;

    #[async_trait]
    impl Transport for UnreachableTransport {
        async fn send(&self, _request: TransportRequest) -> Result<TransportResponse, UploadError> {
            panic!("test transport must not be called");
        }
    }

    fn test_controller(config: UploadConfig) -> (SessionController, Arc<ByteQueue>) {
        let queue = Arc::new(ByteQueue::new());
        let (progress, _rx) = watch::channel(UploadProgress {
            bytes_written: 0,
            total_length: config.total_length,
        });
        let controller = SessionController::new(
            Arc::new(UnreachableTransport),
            Arc::new(AnonymousCredentials),
            "http://localhost".to_string(),
            config,
            Arc::clone(&queue),
            progress,
        );
        (controller, queue)
    }

    // ==================== Content-Range Formatting Tests ====================

    #[test]
    fn test_content_range_chunk_without_total() {
        let range = ContentRange::Chunk {
            start: 0,
            len: 1024,
            total: None,
        };
        assert_eq!(range.to_string(), "bytes 0-1023/*");
    }

    #[test]
    fn test_content_range_chunk_with_total_on_final() {
        let range = ContentRange::Chunk {
            start: 1024,
            len: 512,
            total: Some(1536),
        };
        assert_eq!(range.to_string(), "bytes 1024-1535/1536");
    }

    #[test]
    fn test_content_range_open_unknown_total() {
        let range = ContentRange::Open {
            start: 2048,
            total: None,
        };
        assert_eq!(range.to_string(), "bytes 2048-*/*");
    }

    #[test]
    fn test_content_range_finalize_empty_object() {
        let range = ContentRange::Finalize { total: 0 };
        assert_eq!(range.to_string(), "bytes */0");
    }

    #[test]
    fn test_content_range_finalize_after_stream() {
        let range = ContentRange::Finalize { total: 4096 };
        assert_eq!(range.to_string(), "bytes */4096");
    }

    // ==================== Replay Cache Tests ====================

    #[test]
    fn test_replay_cache_suffix_whole_buffers() {
        let cache = ReplayCache::default();
        cache.push(Bytes::from_static(b"aaaa"));
        cache.push(Bytes::from_static(b"bbbb"));

        let suffix = cache.split_off_suffix(4).unwrap();
        assert_eq!(suffix, vec![Bytes::from_static(b"bbbb")]);
        assert_eq!(cache.cached_bytes(), 0, "cache is drained");
    }

    #[test]
    fn test_replay_cache_suffix_splits_boundary_buffer() {
        let cache = ReplayCache::default();
        cache.push(Bytes::from_static(b"abcdef"));
        cache.push(Bytes::from_static(b"gh"));

        let suffix = cache.split_off_suffix(4).unwrap();
        assert_eq!(
            suffix,
            vec![Bytes::from_static(b"ef"), Bytes::from_static(b"gh")]
        );
    }

    #[test]
    fn test_replay_cache_insufficient_is_none() {
        let cache = ReplayCache::default();
        cache.push(Bytes::from_static(b"ab"));
        assert!(cache.split_off_suffix(3).is_none());
    }

    #[test]
    fn test_replay_cache_exact_total_returns_everything() {
        let cache = ReplayCache::default();
        cache.push(Bytes::from_static(b"ab"));
        cache.push(Bytes::from_static(b"cd"));
        let suffix = cache.split_off_suffix(4).unwrap();
        assert_eq!(
            suffix,
            vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")]
        );
    }

    // ==================== Reconciliation Tests ====================

    #[tokio::test]
    async fn test_reconcile_server_behind_requeues_suffix() {
        let (mut controller, queue) = test_controller(UploadConfig::new("b", "o"));
        controller.bytes_written = 8;
        controller.offset = 5;
        controller.cache.push(Bytes::from_static(b"abcd"));
        controller.cache.push(Bytes::from_static(b"efgh"));

        controller.reconcile().await.unwrap();

        assert_eq!(controller.bytes_written, 5);
        assert_eq!(controller.offset, 5);
        // The 3 unacknowledged bytes are back at the front of the queue.
        assert_eq!(queue.pull(1024).await.unwrap(), Bytes::from_static(b"fgh"));
        assert_eq!(controller.cache.cached_bytes(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_server_behind_without_cache_is_data_loss() {
        let (mut controller, _queue) = test_controller(UploadConfig::new("b", "o"));
        controller.bytes_written = 100;
        controller.offset = 40;
        controller.cache.push(Bytes::from_static(b"short"));

        let result = controller.reconcile().await;
        match result {
            Err(UploadError::DataLoss {
                confirmed_offset,
                bytes_written,
            }) => {
                assert_eq!(confirmed_offset, 40);
                assert_eq!(bytes_written, 100);
            }
            other => panic!("Expected DataLoss, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reconcile_server_ahead_fast_forwards_queue() {
        let (mut controller, queue) = test_controller(UploadConfig::new("b", "o"));
        queue.push(Bytes::from_static(b"0123456789"));
        controller.bytes_written = 0;
        controller.offset = 6;

        controller.reconcile().await.unwrap();

        assert_eq!(controller.bytes_written, 6);
        // The first 6 bytes were discarded, not re-sent.
        assert_eq!(queue.pull(1024).await.unwrap(), Bytes::from_static(b"6789"));
    }

    #[tokio::test]
    async fn test_reconcile_server_ahead_with_short_producer_fails() {
        let (mut controller, queue) = test_controller(UploadConfig::new("b", "o"));
        queue.push(Bytes::from_static(b"abc"));
        queue.finish();
        controller.offset = 10;

        let result = controller.reconcile().await;
        assert!(matches!(result, Err(UploadError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_reconcile_aligned_clears_cache() {
        let (mut controller, _queue) = test_controller(UploadConfig::new("b", "o"));
        controller.bytes_written = 4;
        controller.offset = 4;
        controller.cache.push(Bytes::from_static(b"done"));

        controller.reconcile().await.unwrap();
        assert_eq!(controller.cache.cached_bytes(), 0);
    }

    // ==================== Acknowledgment Tests ====================

    #[tokio::test]
    async fn test_apply_confirmed_beyond_written_is_protocol_error() {
        let (mut controller, _queue) = test_controller(UploadConfig::new("b", "o"));
        controller.bytes_written = 10;
        let result = controller.apply_confirmed(11);
        assert!(matches!(result, Err(UploadError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_apply_confirmed_full_ack_clears_cache() {
        let (mut controller, _queue) = test_controller(UploadConfig::new("b", "o"));
        controller.bytes_written = 10;
        controller.cache.push(Bytes::from_static(b"0123456789"));
        controller.apply_confirmed(10).unwrap();
        assert_eq!(controller.offset, 10);
        assert_eq!(controller.cache.cached_bytes(), 0);
    }

    #[tokio::test]
    async fn test_apply_confirmed_partial_ack_keeps_cache() {
        let (mut controller, _queue) = test_controller(UploadConfig::new("b", "o"));
        controller.bytes_written = 10;
        controller.cache.push(Bytes::from_static(b"0123456789"));
        controller.apply_confirmed(6).unwrap();
        assert_eq!(controller.offset, 6);
        assert_eq!(controller.cache.cached_bytes(), 10, "suffix still replayable");
    }

    // ==================== Request Bound Tests ====================

    #[tokio::test]
    async fn test_next_request_bound_chunk_and_total() {
        let (mut controller, _queue) = test_controller(
            UploadConfig::new("b", "o")
                .with_chunk_size(crate::upload::constants::CHUNK_GRANULARITY)
                .with_total_length(crate::upload::constants::CHUNK_GRANULARITY + 100),
        );
        assert_eq!(
            controller.next_request_bound(),
            Some(crate::upload::constants::CHUNK_GRANULARITY)
        );
        controller.bytes_written = crate::upload::constants::CHUNK_GRANULARITY;
        assert_eq!(controller.next_request_bound(), Some(100));
    }

    #[tokio::test]
    async fn test_next_request_bound_unbounded() {
        let (controller, _queue) = test_controller(UploadConfig::new("b", "o"));
        assert_eq!(controller.next_request_bound(), None);
    }

    // ==================== Chunk Collection Tests ====================

    #[tokio::test]
    async fn test_collect_chunk_reaches_limit_and_caches() {
        let (controller, queue) = test_controller(UploadConfig::new("b", "o"));
        queue.push(Bytes::from_static(b"abcdefgh"));

        let (buffers, exhausted) = controller.collect_chunk(5).await;
        assert!(!exhausted);
        let total: usize = buffers.iter().map(Bytes::len).sum();
        assert_eq!(total, 5);
        assert_eq!(controller.cache.cached_bytes(), 5);
        assert_eq!(
            controller.sent_this_attempt.load(Ordering::SeqCst),
            5,
            "collected bytes count as attempted"
        );
        // The remainder stays queued for the next chunk.
        assert_eq!(queue.buffered_bytes(), 3);
    }

    #[tokio::test]
    async fn test_collect_chunk_stops_at_producer_exhaustion() {
        let (controller, queue) = test_controller(UploadConfig::new("b", "o"));
        queue.push(Bytes::from_static(b"abc"));
        queue.finish();

        let (buffers, exhausted) = controller.collect_chunk(100).await;
        assert!(exhausted);
        assert_eq!(buffers, vec![Bytes::from_static(b"abc")]);
    }
}
