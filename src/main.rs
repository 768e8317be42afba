//! CLI entry point for the uploader tool.

use std::io::IsTerminal;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use uploader_core::{RetryPolicy, UploadConfig, UploadHandle, UploadOutcome, Uploader};

mod cli;

use cli::Args;

/// Read granularity for the local file/stdin producer (256 KiB).
const READ_BUFFER_BYTES: usize = 256 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!("Uploader starting");

    let chunk_size = match args.validated_chunk_size() {
        Ok(size) => size,
        Err(message) => bail!(message),
    };

    // Resolve the data source: a named file, or piped stdin.
    let file_path = match &args.file {
        Some(path) => Some(path.clone()),
        None if !std::io::stdin().is_terminal() => None,
        None => {
            info!("No input provided. Pass a file or pipe data via stdin.");
            info!("Example: uploader big.tar -e https://storage.example.com -b my-bucket");
            return Ok(());
        }
    };

    let object_name = match (&args.object, &file_path) {
        (Some(object), _) => object.clone(),
        (None, Some(path)) => path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .context("file name is not valid UTF-8; pass --object explicitly")?,
        (None, None) => bail!("--object is required when reading from stdin"),
    };

    let total_length = match &file_path {
        Some(path) => Some(
            tokio::fs::metadata(path)
                .await
                .with_context(|| format!("cannot stat {}", path.display()))?
                .len(),
        ),
        None => None,
    };

    let retry = RetryPolicy::with_max_attempts(u32::from(args.max_retries).max(1))
        .with_total_timeout(Duration::from_secs(args.total_timeout));

    let mut config = UploadConfig::new(&args.bucket, &object_name).with_retry_policy(retry);
    if let Some(total) = total_length {
        config = config.with_total_length(total);
    }
    if let Some(chunk) = chunk_size {
        config = config.with_chunk_size(chunk);
    }
    if let Some(resume_uri) = &args.resume_uri {
        // The confirmed offset is learned from a status probe.
        config = config.with_resume(resume_uri, None);
    }
    if let Some(acl) = &args.acl {
        config = config.with_predefined_acl(acl);
    }

    let uploader = Uploader::new(&args.endpoint);
    let handle = uploader.begin_upload(config)?;

    let progress_ui = (!args.quiet).then(|| spawn_progress_ui(&handle, total_length));

    // Feed the producer; writes never block.
    match file_path {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("cannot open {}", path.display()))?;
            feed(file, &handle).await?;
        }
        None => feed(tokio::io::stdin(), &handle).await?,
    }
    handle.finish();

    let outcome = handle.join().await;
    if let Some(ui) = progress_ui {
        ui.abort();
    }

    match outcome? {
        UploadOutcome::Complete(metadata) => {
            info!(
                object = %object_name,
                size = metadata.size_bytes().or(total_length).unwrap_or(0),
                "Upload complete"
            );
        }
        UploadOutcome::Suspended {
            session_uri,
            confirmed_offset,
        } => {
            info!(
                confirmed_offset,
                "Upload suspended; resume with --resume-uri {session_uri}"
            );
        }
    }

    Ok(())
}

/// Streams a reader into the upload handle in fixed-size buffers.
async fn feed<R>(mut reader: R, handle: &UploadHandle) -> Result<()>
where
    R: AsyncReadExt + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER_BYTES];
    loop {
        let read = reader.read(&mut buffer).await.context("read failed")?;
        if read == 0 {
            return Ok(());
        }
        handle.write(Bytes::copy_from_slice(&buffer[..read]));
    }
}

/// Spawns the progress UI (bar or spinner) fed by the handle's progress
/// subscription.
fn spawn_progress_ui(
    handle: &UploadHandle,
    total_length: Option<u64>,
) -> tokio::task::JoinHandle<()> {
    let mut progress = handle.progress();
    tokio::spawn(async move {
        let bar = match total_length {
            Some(total) => {
                let bar = ProgressBar::new(total);
                bar.set_style(
                    ProgressStyle::with_template("{bar:40} {bytes}/{total_bytes} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar
            }
            None => {
                let spinner = ProgressBar::new_spinner();
                spinner.enable_steady_tick(Duration::from_millis(100));
                spinner
            }
        };

        while progress.changed().await.is_ok() {
            let snapshot = *progress.borrow();
            bar.set_position(snapshot.bytes_written);
        }
        bar.finish_and_clear();
    })
}
