//! Bounded pool of worker sessions keyed by conversation.
//!
//! Sessions are created on first use. When the pool is full, the entry with
//! the oldest `last_used_at` is shut down to make room. A background sweep
//! reclaims entries that sit idle past the configured timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{PoolConfig, SessionConfig};
use crate::pool::{ChannelStatus, PoolStatus};
use crate::session::{RunOptions, RunOutput, SessionError, SessionHandle, StreamObserver};

#[derive(Debug)]
struct PoolEntry {
    session: SessionHandle,
    last_used_at: Instant,
}

/// Keyed collection of sessions with LRU eviction and idle reclamation.
#[derive(Debug)]
pub struct SessionPool {
    config: PoolConfig,
    session_config: SessionConfig,
    entries: Mutex<HashMap<String, PoolEntry>>,
    closed: AtomicBool,
    sweeper: CancellationToken,
}

impl SessionPool {
    /// Create a pool without the background idle sweep.
    ///
    /// Use [`start`](Self::start) for normal operation; this constructor is
    /// for callers that drive [`sweep_idle`](Self::sweep_idle) themselves.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let session_config = SessionConfig::from(&config);
        Self {
            config,
            session_config,
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            sweeper: CancellationToken::new(),
        }
    }

    /// Create a pool with the idle sweep running. Must be called inside a
    /// tokio runtime.
    #[must_use]
    pub fn start(config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self::new(config));
        Self::spawn_idle_sweep(&pool);
        pool
    }

    /// Override the session settings, e.g. for sub-second timeouts.
    #[must_use]
    pub fn with_session_config(mut self, session_config: SessionConfig) -> Self {
        self.session_config = session_config;
        self
    }

    fn spawn_idle_sweep(pool: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(pool);
        let cancel = pool.sweeper.clone();
        let period = pool.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;

                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = weak.upgrade() else {
                            break;
                        };
                        pool.sweep_idle().await;
                    }
                }
            }
            tracing::debug!("Idle sweep stopped");
        });
    }

    /// Maximum number of live sessions.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.config.capacity.max(1)
    }

    /// Key used when a request names none.
    #[must_use]
    pub fn default_key(&self) -> &str {
        &self.config.default_key
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Returns true when no sessions are live.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Returns true if a session exists for `key`.
    pub async fn contains(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    /// Resolve or create the session for `key`, refreshing its recency.
    ///
    /// Creating a session in a full pool evicts the least recently used one.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ShuttingDown` after [`shutdown`](Self::shutdown).
    pub async fn acquire(&self, key: Option<&str>) -> Result<SessionHandle, SessionError> {
        let key = key.unwrap_or(&self.config.default_key);
        let mut entries = self.entries.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::ShuttingDown);
        }

        let now = Instant::now();
        if let Some(entry) = entries.get_mut(key) {
            entry.last_used_at = now;
            return Ok(entry.session.clone());
        }

        if entries.len() >= self.capacity() {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used_at)
                .map(|(key, _)| key.clone());
            if let Some(evicted) = oldest.and_then(|k| entries.remove_entry(&k)) {
                let (evicted_key, entry) = evicted;
                let status = entry.session.status();
                tracing::info!(
                    key = %evicted_key,
                    busy = status.busy,
                    queued = status.queue_depth,
                    "Evicting least recently used session"
                );
                entry.session.shutdown();
            }
        }

        let session = SessionHandle::spawn(key, self.session_config.clone());
        entries.insert(
            key.to_string(),
            PoolEntry {
                session: session.clone(),
                last_used_at: now,
            },
        );
        tracing::debug!(key = %key, size = entries.len(), "Session added to pool");
        Ok(session)
    }

    /// Run a prompt on the session for `options.key`.
    ///
    /// # Errors
    ///
    /// Returns the `SessionError` that rejected the request.
    pub async fn run(
        &self,
        prompt: impl Into<String>,
        options: RunOptions,
    ) -> Result<RunOutput, SessionError> {
        let session = self.prepare(&options).await?;
        session.enqueue_run(prompt, options).await
    }

    /// Run a prompt, reporting progress to `observer`.
    ///
    /// # Errors
    ///
    /// Returns the `SessionError` that rejected the request.
    pub async fn run_streaming(
        &self,
        prompt: impl Into<String>,
        observer: Arc<dyn StreamObserver>,
        options: RunOptions,
    ) -> Result<RunOutput, SessionError> {
        let session = match self.prepare(&options).await {
            Ok(session) => session,
            Err(e) => {
                observer.on_error(&e);
                return Err(e);
            }
        };
        session.enqueue_run_streaming(prompt, observer, options).await
    }

    async fn prepare(&self, options: &RunOptions) -> Result<SessionHandle, SessionError> {
        let session = self.acquire(options.key.as_deref()).await?;
        if let Some(token) = &options.continuation_token {
            session.set_continuation_token(token.clone());
        }
        Ok(session)
    }

    /// Cancel the in-flight request for `key`, or for the first session that
    /// has one when `key` is `None`.
    pub async fn cancel(&self, key: Option<&str>) -> bool {
        let targets: Vec<SessionHandle> = {
            let entries = self.entries.lock().await;
            match key {
                Some(key) => entries.get(key).map(|e| e.session.clone()).into_iter().collect(),
                None => entries.values().map(|e| e.session.clone()).collect(),
            }
        };

        for session in targets {
            if session.cancel_current().await {
                return true;
            }
        }
        false
    }

    /// Shut down and remove the session for `key`.
    pub async fn destroy(&self, key: &str) -> bool {
        let removed = self.entries.lock().await.remove(key);
        match removed {
            Some(entry) => {
                tracing::info!(key = %key, "Destroying session");
                entry.session.shutdown();
                true
            }
            None => false,
        }
    }

    /// Close the circuit breaker of the session for `key`.
    pub async fn reset_circuit(&self, key: &str) -> bool {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) => {
                entry.session.reset_circuit();
                true
            }
            None => false,
        }
    }

    /// Evict every session idle longer than the configured timeout.
    ///
    /// Returns the evicted keys.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let idle_timeout = self.config.idle_timeout();
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_used_at) > idle_timeout)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = entries.remove(key) {
                tracing::info!(
                    key = %key,
                    idle_secs = now.saturating_duration_since(entry.last_used_at).as_secs(),
                    "Evicting idle session"
                );
                entry.session.shutdown();
            }
        }
        expired
    }

    /// Stop the idle sweep, shut down every session and refuse new work.
    pub async fn shutdown(&self) {
        self.sweeper.cancel();
        let drained: Vec<(String, PoolEntry)> = {
            let mut entries = self.entries.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            entries.drain().collect()
        };

        tracing::info!(sessions = drained.len(), "Shutting down session pool");
        let mut join_set = JoinSet::new();
        for (_, entry) in drained {
            join_set.spawn(async move { entry.session.shutdown_and_wait().await });
        }
        while let Some(result) = join_set.join_next().await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Session shutdown task failed");
            }
        }
    }

    /// Diagnostics for every pooled session.
    pub async fn status(&self) -> PoolStatus {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut per_channel: Vec<ChannelStatus> = entries
            .iter()
            .map(|(key, entry)| {
                let status = entry.session.status();
                ChannelStatus {
                    key: key.clone(),
                    idle_seconds: now.saturating_duration_since(entry.last_used_at).as_secs(),
                    alive: status.alive,
                    busy: status.busy,
                    queue_depth: status.queue_depth,
                    crashes: status.crashes,
                }
            })
            .collect();
        per_channel.sort_by(|a, b| a.key.cmp(&b.key));

        PoolStatus {
            size: entries.len(),
            capacity: self.capacity(),
            per_channel,
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}
