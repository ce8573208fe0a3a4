//! Crash-driven circuit breaker.
//!
//! The breaker only looks at the crash count and the time since the last
//! crash. Callers pass `now` explicitly so the state machine stays pure.

use std::time::Duration;

use tokio::time::Instant;

/// Refuses spawns after too many crashes inside a window.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    window: Duration,
    crashes: u32,
    window_start: Option<Instant>,
    last_crash: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a closed breaker. A zero threshold is treated as one.
    #[must_use]
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            crashes: 0,
            window_start: None,
            last_crash: None,
        }
    }

    /// Number of crashes counted in the current window.
    #[must_use]
    pub fn crash_count(&self) -> u32 {
        self.crashes
    }

    /// Record a crash and return whether the breaker is now open.
    pub fn record_crash(&mut self, now: Instant) -> bool {
        let window_expired = match self.window_start {
            Some(start) => now.saturating_duration_since(start) > self.window,
            None => true,
        };
        if window_expired {
            self.crashes = 0;
            self.window_start = Some(now);
        }
        self.crashes = self.crashes.saturating_add(1);
        self.last_crash = Some(now);
        self.is_open(now)
    }

    /// Returns true while spawns are refused.
    #[must_use]
    pub fn is_open(&self, now: Instant) -> bool {
        self.remaining(now).is_some()
    }

    /// Cooldown left before a spawn is allowed, or `None` when closed.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        if self.crashes < self.threshold {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.last_crash?);
        (elapsed < self.window).then(|| self.window - elapsed)
    }

    /// Gate a spawn attempt.
    ///
    /// Resets the counter when a full window has passed since the last
    /// crash. Returns the remaining cooldown when the breaker is open.
    ///
    /// # Errors
    ///
    /// Returns the remaining cooldown if the breaker is open.
    pub fn check_spawn(&mut self, now: Instant) -> Result<(), Duration> {
        if let Some(last) = self.last_crash {
            if self.crashes > 0 && now.saturating_duration_since(last) >= self.window {
                tracing::debug!(crashes = self.crashes, "Crash window elapsed, resetting breaker");
                self.reset();
            }
        }
        match self.remaining(now) {
            Some(remaining) => Err(remaining),
            None => Ok(()),
        }
    }

    /// Close the breaker and forget all crashes.
    pub fn reset(&mut self) {
        self.crashes = 0;
        self.window_start = None;
        self.last_crash = None;
    }
}
