//! Error type for session operations.

use std::time::Duration;

use crate::cli::SpawnError;

/// Reasons a request can fail.
///
/// Every variant rejects exactly one request. Protocol parse failures never
/// appear here: they are logged and skipped by the stream parser.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    /// The worker process could not be started.
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),

    /// The worker exited while the request was in flight.
    #[error("Worker exited unexpectedly (code {})", .code.map_or_else(|| "unknown".to_string(), |c| c.to_string()))]
    ProcessExited {
        /// Exit code, when one was observed.
        code: Option<i32>,
    },

    /// The request did not finish in time.
    #[error("Request timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// The request was cancelled by the caller.
    #[error("Request cancelled")]
    Cancelled,

    /// Too many recent crashes; no spawn was attempted.
    #[error("Circuit breaker open, retry in {}s", .remaining.as_secs())]
    CircuitOpen {
        /// Time until the breaker allows a spawn again.
        remaining: Duration,
    },

    /// The worker reported an error in its terminal result.
    #[error("Worker error: {0}")]
    Upstream(String),

    /// The session or pool is shutting down.
    #[error("Session shutting down")]
    ShuttingDown,
}

impl SessionError {
    /// Returns true if retrying later could succeed without intervention.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProcessExited { .. } | Self::Timeout(_) | Self::CircuitOpen { .. }
        )
    }
}
