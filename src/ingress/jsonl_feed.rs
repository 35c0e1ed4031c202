//! JSONL record feed with file rotation detection
//!
//! Tails a file holding one JSON record per line and forwards each parsed
//! record into the dispatcher's ingress channel. A line is only consumed
//! once its trailing newline has been written.

use crate::pipeline::types::Record;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::string::FromUtf8Error;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

/// Where reading starts when the feed file is first opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStart {
    /// Replay everything already in the file
    Beginning,
    /// Only records appended after start-up
    End,
}

pub struct JsonlFeed {
    path: PathBuf,
    file: Option<BufReader<File>>,
    inode: Option<u64>,
    start: FeedStart,
    poll_interval: Duration,
    /// Bytes of a line whose newline has not been written yet
    partial: Vec<u8>,
}

/// Counters returned when the feed stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub forwarded: u64,
    pub rejected: u64,
}

impl JsonlFeed {
    pub fn new(path: impl Into<PathBuf>, start: FeedStart) -> Self {
        Self {
            path: path.into(),
            file: None,
            inode: None,
            start,
            poll_interval: Duration::from_millis(100),
            partial: Vec::new(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn open(&mut self, position: FeedStart) -> std::io::Result<()> {
        let file = File::open(&self.path).await?;

        #[cfg(unix)]
        {
            self.inode = Some(file.metadata().await?.ino());
        }

        let mut reader = BufReader::new(file);
        if position == FeedStart::End {
            reader.seek(SeekFrom::End(0)).await?;
        }
        self.file = Some(reader);
        self.partial.clear();

        log::info!("📖 Reading records from: {}", self.path.display());
        Ok(())
    }

    /// Read the next complete, non-empty line, waiting if necessary
    ///
    /// Waits for the file to appear if it does not exist yet. I/O errors are
    /// logged and retried after the poll interval. A line that is not valid
    /// UTF-8 is consumed and returned as `Err` so the caller can reject it.
    ///
    /// After a rotation the old file is read to its end before the new one
    /// is opened; an unterminated last line of the old file is returned as is.
    pub async fn read_line(&mut self) -> Result<String, FromUtf8Error> {
        loop {
            if self.file.is_none() {
                match self.open(self.start).await {
                    Ok(()) => {}
                    Err(e) => {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            log::warn!("⚠️  Cannot open {}: {}, retrying", self.path.display(), e);
                        }
                        sleep(self.poll_interval).await;
                        continue;
                    }
                }
            }

            // Checked before reading: if the read below hits EOF, everything
            // written to the old file before it was rotated has been consumed.
            let rotated = self.detect_rotation().await;

            let Some(reader) = self.file.as_mut() else {
                continue;
            };

            if let Err(e) = reader.read_until(b'\n', &mut self.partial).await {
                log::warn!("⚠️  Read error on {}: {}, retrying", self.path.display(), e);
                sleep(self.poll_interval).await;
                continue;
            }

            if self.partial.ends_with(b"\n") {
                let bytes = std::mem::take(&mut self.partial);
                if let Some(line) = decode_line(bytes)? {
                    return Ok(line);
                }
                continue;
            }

            if rotated {
                log::info!("🔄 File rotation detected, reopening: {}", self.path.display());
                let leftover = std::mem::take(&mut self.partial);
                self.file = None;
                self.start = FeedStart::Beginning;
                if let Some(line) = decode_line(leftover)? {
                    return Ok(line);
                }
                continue;
            }

            sleep(self.poll_interval).await;
        }
    }

    /// Detect if the file has been rotated (inode changed)
    async fn detect_rotation(&self) -> bool {
        #[cfg(unix)]
        {
            match tokio::fs::metadata(&self.path).await {
                Ok(metadata) => self.inode.is_some_and(|old| old != metadata.ino()),
                // Rotated away and not recreated yet; keep draining the old file
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => {
                    log::debug!("Cannot stat {}: {}", self.path.display(), e);
                    false
                }
            }
        }

        #[cfg(not(unix))]
        {
            false
        }
    }
}

/// Trimmed line, or `None` for a blank one
fn decode_line(bytes: Vec<u8>) -> Result<Option<String>, FromUtf8Error> {
    let line = String::from_utf8(bytes)?;
    let line = line.trim();
    Ok((!line.is_empty()).then(|| line.to_string()))
}

/// Forward records from the feed into `tx` until cancelled
///
/// Lines that are not valid records (invalid UTF-8, bad JSON, missing
/// correlation key) are logged and dropped here; they never reach the
/// dispatcher.
pub async fn run_feed(
    mut feed: JsonlFeed,
    tx: mpsc::Sender<Record>,
    cancel: CancellationToken,
) -> FeedStats {
    let mut stats = FeedStats::default();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = feed.read_line() => line,
        };

        let line = match line {
            Ok(line) => line,
            Err(e) => {
                stats.rejected += 1;
                log::warn!(
                    "⚠️  Rejected line: {} ({} bytes)",
                    e.utf8_error(),
                    e.as_bytes().len()
                );
                continue;
            }
        };

        match Record::from_json(&line) {
            Ok(record) => {
                if tx.send(record).await.is_err() {
                    log::warn!("⚠️  Record channel closed, stopping feed");
                    break;
                }
                stats.forwarded += 1;
            }
            Err(e) => {
                stats.rejected += 1;
                log::warn!("⚠️  Rejected record: {} (line: {})", e, line);
            }
        }
    }

    log::info!(
        "✅ Record feed stopped ({} forwarded, {} rejected)",
        stats.forwarded,
        stats.rejected
    );
    stats
}
