//! Upload session configuration and object metadata model.
//!
//! An [`UploadConfig`] describes one object upload: where it goes, how much
//! data to expect, how to chunk it, and how to retry. It is validated once
//! when the upload begins and then owned by the session controller for the
//! lifetime of the session.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::UploadError;
use super::constants::CHUNK_GRANULARITY;
use super::retry::RetryPolicy;

/// Customer-supplied AES-256 encryption key.
///
/// The key is sent to the server as request headers; it is never logged and
/// never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    bytes: [u8; 32],
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"<redacted>")
            .finish()
    }
}

impl EncryptionKey {
    /// Creates a key from raw bytes (not base64-encoded).
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::InvalidConfig`] unless the key is exactly 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self, UploadError> {
        let bytes: [u8; 32] = key.try_into().map_err(|_| {
            UploadError::invalid_config(format!(
                "encryption key must be 32 bytes, got {}",
                key.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Returns the base64-encoded key for the encryption-key header.
    #[must_use]
    pub fn key_base64(&self) -> String {
        BASE64.encode(self.bytes)
    }

    /// Returns the base64-encoded SHA-256 of the key for the key-hash header.
    #[must_use]
    pub fn sha256_base64(&self) -> String {
        BASE64.encode(Sha256::digest(self.bytes))
    }
}

/// Configuration for one object upload.
///
/// # Example
///
/// ```
/// use uploader_core::upload::UploadConfig;
///
/// let config = UploadConfig::new("my-bucket", "backups/2026-08.tar")
///     .with_total_length(1024 * 1024)
///     .with_chunk_size(256 * 1024);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Destination bucket id.
    pub bucket: String,
    /// Object name within the bucket.
    pub object_name: String,
    /// Total byte length of the object, when known upfront.
    pub total_length: Option<u64>,
    /// Bounded chunk size; `None` sends the object in a single request.
    pub chunk_size: Option<u64>,
    /// Session URI of a previously started upload to resume.
    pub resume_uri: Option<String>,
    /// Server-confirmed offset to resume from.
    pub starting_offset: Option<u64>,
    /// Suspend (instead of finalize) when the producer ends early.
    pub partial: bool,
    /// Customer-supplied encryption key.
    pub encryption_key: Option<EncryptionKey>,
    /// Predefined ACL applied to the new object.
    pub predefined_acl: Option<String>,
    /// Customer-managed encryption key resource name.
    pub kms_key: Option<String>,
    /// Retry behavior for this session.
    pub retry: RetryPolicy,
}

impl UploadConfig {
    /// Creates a configuration with defaults: unknown length, single-request
    /// mode, no resume, default retry policy.
    #[must_use]
    pub fn new(bucket: impl Into<String>, object_name: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object_name: object_name.into(),
            total_length: None,
            chunk_size: None,
            resume_uri: None,
            starting_offset: None,
            partial: false,
            encryption_key: None,
            predefined_acl: None,
            kms_key: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Declares the total object length upfront.
    #[must_use]
    pub fn with_total_length(mut self, total_length: u64) -> Self {
        self.total_length = Some(total_length);
        self
    }

    /// Enables bounded-chunk mode with the given chunk size.
    ///
    /// The size must be a positive multiple of the 256 KiB protocol
    /// granularity; validation happens when the upload begins.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Resumes a previously started session.
    ///
    /// The producer must re-feed the object stream from the beginning (or be
    /// backed by a seekable source): bytes below the server-confirmed offset
    /// are pulled from the producer and discarded, not recovered from any
    /// cache. When `starting_offset` is `None` the current offset is learned
    /// from a status probe before transmission starts.
    #[must_use]
    pub fn with_resume(mut self, session_uri: impl Into<String>, starting_offset: Option<u64>) -> Self {
        self.resume_uri = Some(session_uri.into());
        self.starting_offset = starting_offset;
        self
    }

    /// Marks this invocation as intentionally partial: when the producer
    /// finishes with the object incomplete, the session is suspended for a
    /// later resume instead of finalized.
    #[must_use]
    pub fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    /// Attaches a customer-supplied encryption key.
    #[must_use]
    pub fn with_encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Applies a predefined ACL to the new object.
    #[must_use]
    pub fn with_predefined_acl(mut self, acl: impl Into<String>) -> Self {
        self.predefined_acl = Some(acl.into());
        self
    }

    /// Sets the customer-managed encryption key resource name.
    #[must_use]
    pub fn with_kms_key(mut self, kms_key: impl Into<String>) -> Self {
        self.kms_key = Some(kms_key.into());
        self
    }

    /// Replaces the retry policy for this session.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::InvalidConfig`] when:
    /// - bucket or object name is empty
    /// - the chunk size is zero or not a multiple of the 256 KiB granularity
    /// - a starting offset is given without a session URI to resume
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.bucket.is_empty() {
            return Err(UploadError::invalid_config("bucket must not be empty"));
        }
        if self.object_name.is_empty() {
            return Err(UploadError::invalid_config("object name must not be empty"));
        }
        if let Some(chunk_size) = self.chunk_size {
            if chunk_size == 0 || chunk_size % CHUNK_GRANULARITY != 0 {
                return Err(UploadError::invalid_config(format!(
                    "chunk size {chunk_size} must be a positive multiple of {CHUNK_GRANULARITY}"
                )));
            }
        }
        if self.starting_offset.is_some() && self.resume_uri.is_none() {
            return Err(UploadError::invalid_config(
                "starting offset requires a session URI to resume",
            ));
        }
        if let (Some(total), Some(offset)) = (self.total_length, self.starting_offset) {
            if offset > total {
                return Err(UploadError::invalid_config(format!(
                    "starting offset {offset} exceeds total length {total}"
                )));
            }
        }
        Ok(())
    }
}

/// Final object metadata returned by the server once an upload completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMetadata {
    /// Object name.
    pub name: String,
    /// Bucket the object lives in.
    pub bucket: String,
    /// Object generation, when versioning applies.
    pub generation: Option<String>,
    /// Object size in bytes (transmitted as a decimal string).
    pub size: Option<String>,
    /// Content type recorded for the object.
    pub content_type: Option<String>,
    /// Base64 MD5 checksum of the object data.
    pub md5_hash: Option<String>,
    /// Base64 CRC32C checksum of the object data.
    pub crc32c: Option<String>,
}

impl ObjectMetadata {
    /// Returns the object size parsed from its decimal-string form.
    #[must_use]
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_deref().and_then(|s| s.parse().ok())
    }
}

/// Error envelope some servers embed in 2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: EnvelopeDetail,
}

#[derive(Debug, Deserialize)]
struct EnvelopeDetail {
    #[serde(default)]
    message: String,
}

/// Parses the body of a 2xx completion response into object metadata.
///
/// A body carrying an `{"error": ...}` envelope destroys the upload with
/// that error rather than being treated as success. An empty body yields
/// default metadata (some endpoints finalize without echoing the object).
pub(crate) fn parse_final_metadata(body: &[u8]) -> Result<ObjectMetadata, UploadError> {
    if body.is_empty() {
        return Ok(ObjectMetadata::default());
    }
    if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(body) {
        return Err(UploadError::server_rejected(envelope.error.message));
    }
    serde_json::from_slice(body).map_err(|e| {
        UploadError::protocol(format!("unparseable completion metadata: {e}"))
    })
}
