//! Incremental parser for a worker's stdout.
//!
//! Output arrives in arbitrary chunks. [`LineBuffer`] keeps partial lines
//! across reads; [`StreamParser`] turns complete lines into
//! [`WorkerEvent`]s and skips anything it cannot parse.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use crate::cli::WorkerEvent;

/// Default buffer size for the event channel.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// Size of each read from the worker's stdout.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Error type for stream operations.
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    /// A line was not a valid worker event.
    #[error("Failed to parse event: {reason}")]
    ParseError {
        /// The offending line.
        input: String,
        /// Parser error message.
        reason: String,
    },
    /// Reading from the worker failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accumulates raw bytes and yields complete newline-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    ///
    /// Lines are returned without the trailing `\n` or `\r\n`. Invalid UTF-8
    /// is replaced rather than rejected.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut raw: Vec<u8> = self.pending.drain(..=pos).collect();
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            lines.push(String::from_utf8_lossy(&raw).into_owned());
        }
        lines
    }

    /// Take whatever is left without a terminating newline.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Discard any buffered partial line.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of buffered bytes not yet forming a line.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Parser for worker stream-json output.
#[derive(Debug, Clone, Copy)]
pub struct StreamParser;

impl StreamParser {
    /// Parse a single line of stream-json output.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::ParseError` if the line is not a valid event.
    pub fn parse_line(line: &str) -> Result<WorkerEvent, StreamError> {
        serde_json::from_str(line.trim()).map_err(|e| StreamError::ParseError {
            input: line.to_string(),
            reason: e.to_string(),
        })
    }

    /// Parse a line, logging and dropping it on failure.
    ///
    /// Blank lines are skipped without a warning.
    #[must_use]
    pub fn parse_or_skip(line: &str) -> Option<WorkerEvent> {
        if line.trim().is_empty() {
            return None;
        }
        match Self::parse_line(line) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(error = %e, line = %line, "Skipping unparseable worker output");
                None
            }
        }
    }

    /// Spawn a task that reads `reader` to EOF and forwards parsed events.
    ///
    /// The returned receiver closes when the reader hits EOF or fails, which
    /// is how callers observe a worker's stdout going away.
    pub fn into_channel<R>(reader: R, buffer: usize) -> mpsc::Receiver<WorkerEvent>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer);
        tokio::spawn(async move {
            if let Err(e) = Self::forward(reader, &tx).await {
                tracing::debug!(error = %e, "Worker stdout reader stopped");
            }
        });
        rx
    }

    async fn forward<R>(mut reader: R, tx: &mpsc::Sender<WorkerEvent>) -> Result<(), StreamError>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = LineBuffer::new();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                if let Some(rest) = lines.take_remainder() {
                    if let Some(event) = Self::parse_or_skip(&rest) {
                        let _ = tx.send(event).await;
                    }
                }
                return Ok(());
            }

            for line in lines.push(&chunk[..n]) {
                let Some(event) = Self::parse_or_skip(&line) else {
                    continue;
                };
                tracing::trace!(?event, "Worker event");
                if tx.send(event).await.is_err() {
                    // Receiver dropped: the session discarded this process.
                    return Ok(());
                }
            }
        }
    }
}
