//! Standalone status probe for resumable upload sessions.
//!
//! A probe is an idempotent zero-length `PUT` with `Content-Range: bytes */*`.
//! The response tells the caller where a session stands: a success status
//! means the object was already finalized, 308 means the session is live with
//! the server's confirmed offset in its `Range` header, 404 means the session
//! is gone. Used both to resume a suspended partial upload and inside the
//! retry path to reconcile against ground truth before retransmitting.

use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, HeaderValue};
use tracing::{debug, instrument};

use super::UploadError;
use super::session::{ObjectMetadata, parse_final_metadata};
use super::transport::{CredentialProvider, Transport, TransportRequest, TransportResponse};

/// Probe header value: a zero-length request asking "how much do you have?".
const PROBE_CONTENT_RANGE: &str = "bytes */*";

/// Server-side state of an upload session, as reported by a status probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    /// The object already exists complete.
    Complete(Box<ObjectMetadata>),
    /// The session is live; the server has durably received
    /// `confirmed_offset` bytes.
    Incomplete {
        /// Count of bytes the server has acknowledged.
        confirmed_offset: u64,
    },
}

/// Queries the server-confirmed state of a session.
///
/// # Errors
///
/// Returns [`UploadError::SessionExpired`] when the server responds 404,
/// and transport or HTTP-status errors otherwise.
#[instrument(skip(transport, credentials))]
pub async fn probe_status(
    transport: &dyn Transport,
    credentials: &dyn CredentialProvider,
    session_uri: &str,
) -> Result<UploadStatus, UploadError> {
    let mut request = TransportRequest::new(Method::PUT, session_uri);
    request.headers.insert(
        CONTENT_RANGE,
        HeaderValue::from_static(PROBE_CONTENT_RANGE),
    );
    if let Some(authorization) = credentials.authorization_header().await? {
        let value = HeaderValue::from_str(&authorization)
            .map_err(|_| UploadError::protocol("credential provider produced an invalid header"))?;
        request.headers.insert(AUTHORIZATION, value);
    }

    let response = transport.send(request).await?;
    let status = response.status.as_u16();

    match status {
        200 | 201 => {
            let metadata = parse_final_metadata(&response.body)?;
            debug!(session_uri, "probe: object already complete");
            Ok(UploadStatus::Complete(Box::new(metadata)))
        }
        308 => {
            let confirmed_offset = confirmed_offset_from_response(&response)?;
            debug!(session_uri, confirmed_offset, "probe: session incomplete");
            Ok(UploadStatus::Incomplete { confirmed_offset })
        }
        404 => Err(UploadError::session_expired(session_uri)),
        _ => Err(UploadError::http_status_with_detail(
            session_uri,
            status,
            response.header_str("Retry-After").map(str::to_string),
            response.body_snippet(),
        )),
    }
}

/// Extracts the server-confirmed offset from a 308 response.
///
/// An absent `Range` header means the server has persisted nothing yet.
pub(crate) fn confirmed_offset_from_response(
    response: &TransportResponse,
) -> Result<u64, UploadError> {
    match response.header_str("Range") {
        None => Ok(0),
        Some(value) => parse_range_header(value).ok_or_else(|| {
            UploadError::protocol(format!("unparseable Range header: {value}"))
        }),
    }
}

/// Parses a `Range: bytes=0-{end}` response header into a confirmed offset.
///
/// The offset is the count of acknowledged bytes, i.e. `end + 1`.
fn parse_range_header(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;
    if start.trim().parse::<u64>().ok()? != 0 {
        // The protocol acknowledges a single prefix range only.
        return None;
    }
    let end: u64 = end.trim().parse().ok()?;
    Some(end + 1)
}
