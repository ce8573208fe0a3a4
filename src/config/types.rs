//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::WorkerCommand;

/// How each worker process is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker binary to execute.
    pub binary: String,
    /// Arguments placed before the worker flags.
    pub prefix_args: Vec<String>,
    /// Model selector passed as `--model`.
    pub model: Option<String>,
    /// Working directory for workers. Inherited when unset.
    pub working_dir: Option<PathBuf>,
    /// Default for skipping permission prompts, overridable per request.
    pub skip_permissions: bool,
    /// Text injected with `--append-system-prompt`.
    pub system_prompt: Option<String>,
    /// Grace period between SIGTERM and SIGKILL on shutdown.
    pub terminate_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            prefix_args: Vec::new(),
            model: None,
            working_dir: None,
            skip_permissions: false,
            system_prompt: None,
            terminate_grace_ms: 2000,
        }
    }
}

impl WorkerConfig {
    /// Grace period as a `Duration`.
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    /// Build the command for one spawn.
    #[must_use]
    pub fn command(&self, skip_permissions: bool, resume: Option<&str>) -> WorkerCommand {
        let mut command = WorkerCommand::new(&self.binary)
            .prefix_args(self.prefix_args.iter().cloned())
            .skip_permissions(skip_permissions);
        if let Some(model) = &self.model {
            command = command.model(model);
        }
        if let Some(prompt) = &self.system_prompt {
            command = command.append_system_prompt(prompt);
        }
        if let Some(dir) = &self.working_dir {
            command = command.working_dir(dir);
        }
        if let Some(token) = resume {
            command = command.resume(token);
        }
        command
    }
}

/// Crash-driven circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Crashes within the window that open the breaker.
    pub threshold: u32,
    /// Trailing window in seconds.
    pub window_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            window_secs: 60,
        }
    }
}

impl BreakerConfig {
    /// Window as a `Duration`.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Configuration for the session pool and its sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live sessions.
    pub capacity: usize,
    /// Sessions idle longer than this are reclaimed.
    pub idle_timeout_secs: u64,
    /// How often the idle sweep runs.
    pub sweep_interval_secs: u64,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
    /// Key used when a caller supplies none.
    pub default_key: String,
    /// Worker launch settings.
    pub worker: WorkerConfig,
    /// Circuit breaker settings.
    pub breaker: BreakerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            idle_timeout_secs: 1800,
            sweep_interval_secs: 60,
            request_timeout_secs: 300,
            default_key: "default".to_string(),
            worker: WorkerConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Idle timeout as a `Duration`.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Sweep interval as a `Duration`, never zero.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Request timeout as a `Duration`.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Per-session settings derived from [`PoolConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Worker launch settings.
    pub worker: WorkerConfig,
    /// Default per-request timeout.
    pub request_timeout: Duration,
    /// Crashes that open the breaker.
    pub breaker_threshold: u32,
    /// Breaker window.
    pub breaker_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl From<&PoolConfig> for SessionConfig {
    fn from(config: &PoolConfig) -> Self {
        Self {
            worker: config.worker.clone(),
            request_timeout: config.request_timeout(),
            breaker_threshold: config.breaker.threshold,
            breaker_window: config.breaker.window(),
        }
    }
}
