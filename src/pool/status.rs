//! Pool diagnostics.

use serde::{Deserialize, Serialize};

/// Diagnostics for one pooled session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    /// Conversation key.
    pub key: String,
    /// Whole seconds since the session was last used.
    pub idle_seconds: u64,
    /// A worker process is running.
    pub alive: bool,
    /// A request is in flight.
    pub busy: bool,
    /// Requests waiting behind the in-flight one.
    pub queue_depth: usize,
    /// Crashes counted in the current breaker window.
    pub crashes: u32,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Number of live sessions.
    pub size: usize,
    /// Maximum number of live sessions.
    pub capacity: usize,
    /// Per-session diagnostics, sorted by key.
    pub per_channel: Vec<ChannelStatus>,
}

impl PoolStatus {
    /// Look up one channel by key.
    #[must_use]
    pub fn channel(&self, key: &str) -> Option<&ChannelStatus> {
        self.per_channel.iter().find(|c| c.key == key)
    }
}
