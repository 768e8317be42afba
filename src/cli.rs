//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use uploader_core::upload::constants::{CHUNK_GRANULARITY, DEFAULT_MAX_RETRIES};

/// Stream a file (or stdin) to an object-storage endpoint.
///
/// Uploader transfers large byte streams over unreliable networks using a
/// session-based resumable upload protocol: interrupted transfers retry with
/// backoff and resume exactly where the server left off.
#[derive(Parser, Debug)]
#[command(name = "uploader")]
#[command(author, version, about)]
pub struct Args {
    /// File to upload (reads stdin when omitted and piped)
    pub file: Option<PathBuf>,

    /// Storage endpoint base URL (e.g. https://storage.example.com)
    #[arg(short = 'e', long)]
    pub endpoint: String,

    /// Destination bucket id
    #[arg(short = 'b', long)]
    pub bucket: String,

    /// Object name (defaults to the file name)
    #[arg(short = 'o', long)]
    pub object: Option<String>,

    /// Chunk size in bytes; must be a multiple of 262144 (256 KiB).
    /// Omit to send the object in a single request.
    #[arg(short = 's', long)]
    pub chunk_size: Option<u64>,

    /// Maximum retry attempts for transient failures (0-10)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES as u8, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: u8,

    /// Cumulative retry budget across all attempts, in seconds (max 3600)
    #[arg(short = 't', long, default_value_t = 600, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub total_timeout: u64,

    /// Session URI of a suspended upload to resume
    #[arg(long)]
    pub resume_uri: Option<String>,

    /// Predefined ACL for the new object (e.g. private, publicRead)
    #[arg(long)]
    pub acl: Option<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Returns the chunk-size flag after alignment validation.
    ///
    /// # Errors
    ///
    /// Returns a message suitable for CLI output when the value is not a
    /// positive multiple of the protocol granularity.
    pub fn validated_chunk_size(&self) -> Result<Option<u64>, String> {
        match self.chunk_size {
            Some(size) if size == 0 || size % CHUNK_GRANULARITY != 0 => Err(format!(
                "--chunk-size {size} must be a positive multiple of {CHUNK_GRANULARITY}"
            )),
            other => Ok(other),
        }
    }
}
