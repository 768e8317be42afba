//! Integration tests for the upload module.
//!
//! These tests drive full upload flows against a stateful mock server that
//! implements the resumable-upload protocol: session creation, chunk PUTs
//! with Content-Range, 308 acknowledgments, status probes, and finalize
//! requests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uploader_core::upload::constants::CHUNK_GRANULARITY;
use uploader_core::{
    RetryPolicy, UploadConfig, UploadError, UploadOutcome, UploadStatus, Uploader,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const SESSION_PATH: &str = "/upload/session/sess-1";

/// A Content-Range header as understood by the mock server.
enum ParsedRange {
    /// `bytes */*` - status probe.
    Probe,
    /// `bytes */N` - zero-length finalize at N bytes.
    Finalize(u64),
    /// `bytes {start}-.../{total or *}` - data carrying request.
    Data { start: u64, total: Option<u64> },
}

fn parse_content_range(value: &str) -> Option<ParsedRange> {
    let rest = value.strip_prefix("bytes ")?;
    let (range, total) = rest.rsplit_once('/')?;
    let total = match total {
        "*" => None,
        n => Some(n.parse::<u64>().ok()?),
    };
    if range == "*" {
        return match total {
            None => Some(ParsedRange::Probe),
            Some(n) => Some(ParsedRange::Finalize(n)),
        };
    }
    let (start, _end) = range.split_once('-')?;
    Some(ParsedRange::Data {
        start: start.parse().ok()?,
        total,
    })
}

#[derive(Default)]
struct EndpointState {
    received: Vec<u8>,
    finalized: bool,
    /// Content-Range headers of data-carrying requests, in order.
    data_ranges: Vec<String>,
    /// Content-Range headers of every PUT, in order.
    all_ranges: Vec<String>,
    /// Statuses returned (without processing) for upcoming data requests.
    scripted_failures: VecDeque<u16>,
    /// When set, the server pretends to persist only this many bytes total
    /// on the next data request, then acknowledges that prefix.
    truncate_next_ack: Option<u64>,
}

/// Stateful responder emulating one resumable upload session.
#[derive(Clone)]
struct ResumableSession {
    object_name: String,
    state: Arc<Mutex<EndpointState>>,
}

impl ResumableSession {
    fn new(object_name: &str) -> Self {
        Self {
            object_name: object_name.to_string(),
            state: Arc::new(Mutex::new(EndpointState::default())),
        }
    }

    fn script_failures(&self, statuses: &[u16]) {
        self.state
            .lock()
            .unwrap()
            .scripted_failures
            .extend(statuses);
    }

    fn truncate_next_ack(&self, keep: u64) {
        self.state.lock().unwrap().truncate_next_ack = Some(keep);
    }

    fn received(&self) -> Vec<u8> {
        self.state.lock().unwrap().received.clone()
    }

    fn data_ranges(&self) -> Vec<String> {
        self.state.lock().unwrap().data_ranges.clone()
    }

    fn all_ranges(&self) -> Vec<String> {
        self.state.lock().unwrap().all_ranges.clone()
    }

    fn metadata_response(&self, size: usize) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_string(format!(
            r#"{{"name": "{}", "bucket": "test-bucket", "size": "{size}"}}"#,
            self.object_name
        ))
    }

    fn incomplete_response(len: usize) -> ResponseTemplate {
        let template = ResponseTemplate::new(308);
        if len > 0 {
            template.insert_header("Range", format!("bytes=0-{}", len - 1).as_str())
        } else {
            template
        }
    }
}

impl Respond for ResumableSession {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut state = self.state.lock().unwrap();

        let Some(header) = request
            .headers
            .get("Content-Range")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        else {
            return ResponseTemplate::new(400);
        };
        state.all_ranges.push(header.clone());

        let Some(parsed) = parse_content_range(&header) else {
            return ResponseTemplate::new(400);
        };

        match parsed {
            ParsedRange::Probe => {
                if state.finalized {
                    let size = state.received.len();
                    self.metadata_response(size)
                } else {
                    Self::incomplete_response(state.received.len())
                }
            }
            ParsedRange::Finalize(total) => {
                state.data_ranges.push(header);
                if state.received.len() as u64 == total {
                    state.finalized = true;
                    let size = state.received.len();
                    self.metadata_response(size)
                } else {
                    Self::incomplete_response(state.received.len())
                }
            }
            ParsedRange::Data { start, total } => {
                state.data_ranges.push(header);
                if let Some(status) = state.scripted_failures.pop_front() {
                    return ResponseTemplate::new(status);
                }

                let start = usize::try_from(start).unwrap();
                if start > state.received.len() {
                    // The client skipped ahead of what the server holds.
                    return ResponseTemplate::new(400);
                }
                state.received.truncate(start);

                let mut body = request.body.clone();
                if let Some(keep) = state.truncate_next_ack.take() {
                    let keep = usize::try_from(keep).unwrap();
                    let room = keep.saturating_sub(state.received.len());
                    body.truncate(room);
                }
                state.received.extend_from_slice(&body);

                if total.is_some_and(|t| state.received.len() as u64 == t) {
                    state.finalized = true;
                    let size = state.received.len();
                    self.metadata_response(size)
                } else {
                    Self::incomplete_response(state.received.len())
                }
            }
        }
    }
}

/// Responder for the session-creation POST; counts invocations.
#[derive(Clone)]
struct SessionCreator {
    location: String,
    count: Arc<AtomicUsize>,
}

impl SessionCreator {
    fn new(location: String) -> Self {
        Self {
            location,
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Respond for SessionCreator {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.count.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(200).insert_header("Location", self.location.as_str())
    }
}

/// Mounts a session creator and a stateful session endpoint on a fresh
/// mock server.
async fn setup_session(object_name: &str) -> (MockServer, SessionCreator, ResumableSession) {
    let server = MockServer::start().await;
    let creator = SessionCreator::new(format!("{}{}", server.uri(), SESSION_PATH));
    let session = ResumableSession::new(object_name);

    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/test-bucket/o"))
        .respond_with(creator.clone())
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(SESSION_PATH))
        .respond_with(session.clone())
        .mount(&server)
        .await;

    (server, creator, session)
}

/// Deterministic test payload.
fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(
        5,
        Duration::from_millis(10),
        Duration::from_millis(50),
        2.0,
        Duration::from_secs(30),
    )
}

#[tokio::test]
async fn test_round_trip_single_write_known_length() {
    let (server, creator, session) = setup_session("whole.bin").await;
    let content = payload(100 * 1024);

    let uploader = Uploader::new(server.uri());
    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "whole.bin")
                .with_total_length(content.len() as u64)
                .with_retry_policy(fast_retry()),
        )
        .unwrap();
    handle.write(content.clone());
    handle.finish();

    let outcome = handle.join().await.unwrap();
    match outcome {
        UploadOutcome::Complete(metadata) => {
            assert_eq!(metadata.name, "whole.bin");
            assert_eq!(metadata.size_bytes(), Some(content.len() as u64));
        }
        other => panic!("Expected Complete, got: {other:?}"),
    }

    assert_eq!(session.received(), content);
    assert_eq!(creator.count(), 1);
    // Known length, no chunking: one request stating the full range.
    assert_eq!(session.data_ranges(), vec!["bytes 0-102399/102400"]);
}

#[tokio::test]
async fn test_round_trip_byte_by_byte_writes() {
    let (server, _creator, session) = setup_session("drip.bin").await;
    let content = payload(1024);

    let uploader = Uploader::new(server.uri());
    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "drip.bin")
                .with_total_length(content.len() as u64)
                .with_retry_policy(fast_retry()),
        )
        .unwrap();
    // The chunking of producer writes must not affect the final object.
    for byte in &content {
        handle.write(vec![*byte]);
    }
    handle.finish();

    let outcome = handle.join().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Complete(_)));
    assert_eq!(session.received(), content);
}

#[tokio::test]
async fn test_chunk_boundaries_are_respected() {
    let (server, _creator, session) = setup_session("chunked.bin").await;
    // 2.5 chunks: two full-size requests and a final remainder.
    let total = CHUNK_GRANULARITY * 2 + CHUNK_GRANULARITY / 2;
    let content = payload(usize::try_from(total).unwrap());

    let uploader = Uploader::new(server.uri());
    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "chunked.bin")
                .with_total_length(total)
                .with_chunk_size(CHUNK_GRANULARITY)
                .with_retry_policy(fast_retry()),
        )
        .unwrap();
    handle.write(content.clone());
    handle.finish();

    let outcome = handle.join().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Complete(_)));
    assert_eq!(session.received(), content);

    // Every non-final request has length exactly C; the final request
    // carries the remainder and states the total.
    let c = CHUNK_GRANULARITY;
    assert_eq!(
        session.data_ranges(),
        vec![
            format!("bytes 0-{}/*", c - 1),
            format!("bytes {}-{}/*", c, 2 * c - 1),
            format!("bytes {}-{}/{}", 2 * c, total - 1, total),
        ]
    );
}

#[tokio::test]
async fn test_short_acknowledgment_resends_from_confirmed_offset() {
    let (server, _creator, session) = setup_session("acked.bin").await;
    let total = CHUNK_GRANULARITY * 2;
    let content = payload(usize::try_from(total).unwrap());

    // The server acknowledges only the first 1024 bytes of the first chunk.
    session.truncate_next_ack(1024);

    let uploader = Uploader::new(server.uri());
    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "acked.bin")
                .with_total_length(total)
                .with_chunk_size(CHUNK_GRANULARITY)
                .with_retry_policy(fast_retry()),
        )
        .unwrap();
    handle.write(content.clone());
    handle.finish();

    let outcome = handle.join().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Complete(_)));
    assert_eq!(session.received(), content, "no duplicate or missing bytes");

    // After `Range: bytes=0-1023`, the next request resumes at byte 1024.
    let ranges = session.data_ranges();
    assert!(
        ranges[1].starts_with("bytes 1024-"),
        "second request must start at the confirmed offset, got: {ranges:?}"
    );
}

#[tokio::test]
async fn test_suspend_and_resume_partial_upload() {
    let (server, _creator, session) = setup_session("resumed.bin").await;
    let total = CHUNK_GRANULARITY * 2;
    let content = payload(usize::try_from(total).unwrap());

    let uploader = Uploader::new(server.uri());

    // Phase 1: feed only the first chunk, intentionally partial.
    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "resumed.bin")
                .with_total_length(total)
                .with_chunk_size(CHUNK_GRANULARITY)
                .with_partial(true)
                .with_retry_policy(fast_retry()),
        )
        .unwrap();
    handle.write(content[..usize::try_from(CHUNK_GRANULARITY).unwrap()].to_vec());
    handle.finish();

    let (session_uri, confirmed_offset) = match handle.join().await.unwrap() {
        UploadOutcome::Suspended {
            session_uri,
            confirmed_offset,
        } => (session_uri, confirmed_offset),
        other => panic!("Expected Suspended, got: {other:?}"),
    };
    assert_eq!(confirmed_offset, CHUNK_GRANULARITY);

    // The status probe reports the same confirmed offset.
    let status = uploader.probe_status(&session_uri).await.unwrap();
    assert_eq!(
        status,
        UploadStatus::Incomplete {
            confirmed_offset: CHUNK_GRANULARITY
        }
    );

    // Phase 2: resume with the probed offset, re-feeding the full stream.
    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "resumed.bin")
                .with_total_length(total)
                .with_chunk_size(CHUNK_GRANULARITY)
                .with_resume(&session_uri, Some(confirmed_offset))
                .with_retry_policy(fast_retry()),
        )
        .unwrap();
    handle.write(content.clone());
    handle.finish();

    let outcome = handle.join().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Complete(_)));
    assert_eq!(
        session.received(),
        content,
        "resumed upload must equal an uninterrupted one"
    );
}

#[tokio::test]
async fn test_resume_learns_offset_from_probe_when_not_given() {
    let (server, _creator, session) = setup_session("probed.bin").await;
    let total = CHUNK_GRANULARITY * 2;
    let content = payload(usize::try_from(total).unwrap());

    let uploader = Uploader::new(server.uri());

    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "probed.bin")
                .with_total_length(total)
                .with_chunk_size(CHUNK_GRANULARITY)
                .with_partial(true)
                .with_retry_policy(fast_retry()),
        )
        .unwrap();
    handle.write(content[..usize::try_from(CHUNK_GRANULARITY).unwrap()].to_vec());
    handle.finish();
    let UploadOutcome::Suspended { session_uri, .. } = handle.join().await.unwrap() else {
        panic!("Expected Suspended");
    };

    // Resume without a starting offset: the controller probes for it.
    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "probed.bin")
                .with_total_length(total)
                .with_chunk_size(CHUNK_GRANULARITY)
                .with_resume(&session_uri, None)
                .with_retry_policy(fast_retry()),
        )
        .unwrap();
    handle.write(content.clone());
    handle.finish();

    let outcome = handle.join().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Complete(_)));
    assert_eq!(session.received(), content);
}

#[tokio::test]
async fn test_transient_failures_retry_then_succeed() {
    let (server, _creator, session) = setup_session("retried.bin").await;
    let content = payload(64 * 1024);
    session.script_failures(&[503, 503]);

    let started = Instant::now();
    let uploader = Uploader::new(server.uri());
    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "retried.bin")
                .with_total_length(content.len() as u64)
                .with_retry_policy(fast_retry()),
        )
        .unwrap();
    handle.write(content.clone());
    handle.finish();

    let outcome = handle.join().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Complete(_)));
    assert_eq!(session.received(), content);

    // Two failed attempts plus the success.
    assert_eq!(session.data_ranges().len(), 3);
    assert!(
        started.elapsed() < Duration::from_secs(30),
        "retries must stay within the total timeout budget"
    );
}

#[tokio::test]
async fn test_retries_exhausted_surfaces_last_failure() {
    let (server, _creator, session) = setup_session("doomed.bin").await;
    let content = payload(4096);
    // More failures than the policy allows (max_attempts = 2).
    session.script_failures(&[503, 503, 503, 503, 503, 503, 503, 503]);

    let uploader = Uploader::new(server.uri());
    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "doomed.bin")
                .with_total_length(content.len() as u64)
                .with_retry_policy(
                    RetryPolicy::new(
                        2,
                        Duration::from_millis(5),
                        Duration::from_millis(20),
                        2.0,
                        Duration::from_secs(10),
                    ),
                ),
        )
        .unwrap();
    handle.write(content);
    handle.finish();

    match handle.join().await {
        Err(UploadError::RetriesExhausted { attempts, source }) => {
            assert_eq!(attempts, 2);
            assert!(matches!(*source, UploadError::HttpStatus { status: 503, .. }));
        }
        other => panic!("Expected RetriesExhausted, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_upload_completes_in_single_request() {
    let (server, creator, session) = setup_session("empty.bin").await;

    let uploader = Uploader::new(server.uri());
    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "empty.bin").with_retry_policy(fast_retry()),
        )
        .unwrap();
    handle.finish();

    let outcome = handle.join().await.unwrap();
    match outcome {
        UploadOutcome::Complete(metadata) => assert_eq!(metadata.size_bytes(), Some(0)),
        other => panic!("Expected Complete, got: {other:?}"),
    }

    assert_eq!(creator.count(), 1);
    assert!(session.received().is_empty());
    // A zero-length object needs exactly one finalize request.
    assert_eq!(session.all_ranges(), vec!["bytes */0"]);
}

#[tokio::test]
async fn test_unknown_length_stream_finalizes_after_open_request() {
    let (server, _creator, session) = setup_session("stream.bin").await;
    let content = payload(48 * 1024);

    let uploader = Uploader::new(server.uri());
    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "stream.bin").with_retry_policy(fast_retry()),
        )
        .unwrap();
    handle.write(content.clone());
    handle.finish();

    let outcome = handle.join().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Complete(_)));
    assert_eq!(session.received(), content);

    let ranges = session.data_ranges();
    assert_eq!(ranges[0], "bytes 0-*/*", "open-ended first request");
    assert_eq!(
        ranges.last().unwrap(),
        &format!("bytes */{}", content.len()),
        "zero-length finalize states the discovered total"
    );
}

#[tokio::test]
async fn test_expired_resume_session_restarts_from_scratch() {
    let server = MockServer::start().await;
    let creator = SessionCreator::new(format!("{}{}", server.uri(), SESSION_PATH));
    let session = ResumableSession::new("reborn.bin");

    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/test-bucket/o"))
        .respond_with(creator.clone())
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(SESSION_PATH))
        .respond_with(session.clone())
        .mount(&server)
        .await;
    // The session being resumed is long gone.
    Mock::given(method("PUT"))
        .and(path("/upload/session/dead"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let content = payload(8 * 1024);
    let uploader = Uploader::new(server.uri());
    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "reborn.bin")
                .with_total_length(content.len() as u64)
                .with_resume(format!("{}/upload/session/dead", server.uri()), None)
                .with_retry_policy(fast_retry()),
        )
        .unwrap();
    handle.write(content.clone());
    handle.finish();

    let outcome = handle.join().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Complete(_)));
    assert_eq!(creator.count(), 1, "a fresh session was created");
    assert_eq!(session.received(), content);
}

#[tokio::test]
async fn test_cancel_aborts_inflight_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/test-bucket/o"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Location", format!("{}{}", server.uri(), SESSION_PATH).as_str()),
        )
        .mount(&server)
        .await;
    // Every chunk request hangs far longer than the test budget.
    Mock::given(method("PUT"))
        .and(path(SESSION_PATH))
        .respond_with(ResponseTemplate::new(308).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let uploader = Uploader::new(server.uri());
    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "cancelled.bin")
                .with_total_length(1024)
                .with_retry_policy(fast_retry()),
        )
        .unwrap();
    handle.write(payload(1024));
    handle.finish();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    handle.cancel();
    let result = handle.join().await;

    assert!(matches!(result, Err(UploadError::Cancelled)));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "cancel must abort the in-flight request promptly"
    );
}

#[tokio::test]
async fn test_error_envelope_in_success_response_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/test-bucket/o"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Location", format!("{}{}", server.uri(), SESSION_PATH).as_str()),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(SESSION_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"error": {"code": 500, "message": "backend exploded"}}"#),
        )
        .mount(&server)
        .await;

    let uploader = Uploader::new(server.uri());
    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "rejected.bin")
                .with_total_length(16)
                .with_retry_policy(fast_retry()),
        )
        .unwrap();
    handle.write(payload(16));
    handle.finish();

    match handle.join().await {
        Err(UploadError::ServerRejected { message }) => {
            assert!(message.contains("backend exploded"));
        }
        other => panic!("Expected ServerRejected, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_progress_reports_acknowledged_bytes() {
    let (server, _creator, _session) = setup_session("progress.bin").await;
    let total = CHUNK_GRANULARITY * 2;
    let content = payload(usize::try_from(total).unwrap());

    let uploader = Uploader::new(server.uri());
    let handle = uploader
        .begin_upload(
            UploadConfig::new("test-bucket", "progress.bin")
                .with_total_length(total)
                .with_chunk_size(CHUNK_GRANULARITY)
                .with_retry_policy(fast_retry()),
        )
        .unwrap();
    let progress = handle.progress();
    handle.write(content);
    handle.finish();

    let outcome = handle.join().await.unwrap();
    assert!(matches!(outcome, UploadOutcome::Complete(_)));

    let last = *progress.borrow();
    assert_eq!(last.bytes_written, total);
    assert_eq!(last.total_length, Some(total));
}
