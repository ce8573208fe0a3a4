//! Claude Session Pool - interactive front end over the worker pool.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use claude_session_pool::config::{ConfigError, ConfigLoader, PoolConfig};
use claude_session_pool::display;
use claude_session_pool::pool::SessionPool;
use claude_session_pool::session::{RunOptions, StreamEvent, StreamObserver};

#[derive(Parser)]
#[command(
    name = "claude-session-pool",
    about = "Run concurrent Claude Code conversations on a pool of long-lived workers",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to a TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Worker binary to launch.
    #[arg(long, global = true)]
    binary: Option<String>,

    /// Model passed to each worker.
    #[arg(long, global = true)]
    model: Option<String>,

    /// Working directory for workers.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Skip worker permission prompts.
    #[arg(long, global = true)]
    skip_permissions: bool,

    /// Maximum number of live sessions.
    #[arg(long, global = true)]
    capacity: Option<usize>,

    /// Per-request timeout in seconds.
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Show full text instead of truncating.
    #[arg(long, global = true)]
    raw: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one prompt and stream the reply.
    Ask {
        /// The prompt to send.
        prompt: String,
        /// Conversation key.
        #[arg(short, long)]
        key: Option<String>,
        /// Continuation token to resume.
        #[arg(long)]
        resume: Option<String>,
    },
    /// Read prompts from stdin, one per line (`key> prompt` or `prompt`).
    Chat,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

impl Cli {
    fn load_config(&self) -> Result<PoolConfig, ConfigError> {
        let loader = match &self.config {
            Some(path) => ConfigLoader::with_path(path.clone()),
            None => ConfigLoader::new(),
        };
        let (mut config, source) = loader.load_with_source()?;
        tracing::debug!(source = %source, "Configuration loaded");

        if let Some(binary) = &self.binary {
            config.worker.binary.clone_from(binary);
        }
        if let Some(model) = &self.model {
            config.worker.model = Some(model.clone());
        }
        if let Some(cwd) = &self.cwd {
            config.worker.working_dir = Some(cwd.clone());
        }
        if self.skip_permissions {
            config.worker.skip_permissions = true;
        }
        if let Some(capacity) = self.capacity {
            config.capacity = capacity;
        }
        if let Some(timeout) = self.timeout {
            config.request_timeout_secs = timeout;
        }
        Ok(config)
    }
}

/// One line of `chat` input.
#[derive(Debug, PartialEq, Eq)]
enum ChatInput {
    Prompt { key: Option<String>, prompt: String },
    Status,
    Cancel(Option<String>),
    Destroy(String),
    Reset(String),
    Quit,
    Empty,
    Invalid(String),
}

impl ChatInput {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }

        if let Some(command) = line.strip_prefix('/') {
            let mut parts = command.split_whitespace();
            let name = parts.next().unwrap_or_default();
            let arg = parts.next().map(str::to_string);
            return match (name, arg) {
                ("status", _) => Self::Status,
                ("cancel", key) => Self::Cancel(key),
                ("destroy", Some(key)) => Self::Destroy(key),
                ("reset", Some(key)) => Self::Reset(key),
                ("quit" | "exit", _) => Self::Quit,
                _ => Self::Invalid(line.to_string()),
            };
        }

        if let Some((key, prompt)) = line.split_once("> ") {
            let key = key.trim();
            if !key.is_empty() && !key.contains(char::is_whitespace) {
                return Self::Prompt {
                    key: Some(key.to_string()),
                    prompt: prompt.trim().to_string(),
                };
            }
        }

        Self::Prompt {
            key: None,
            prompt: line.to_string(),
        }
    }
}

/// Dispatch one prompt and print the streamed reply.
async fn ask(pool: Arc<SessionPool>, key: String, prompt: String, options: RunOptions, raw: bool) {
    display::print_dispatch(&key, &prompt, raw);

    let (tx, mut rx) = mpsc::unbounded_channel::<StreamEvent>();
    let observer: Arc<dyn StreamObserver> = Arc::new(tx);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Text { chunk, .. } = event {
                display::print_text(&chunk);
            }
        }
    });

    let result = pool.run_streaming(prompt, observer, options).await;
    let _ = printer.await;

    match result {
        Ok(output) => display::print_reply_end(&key, &output, raw),
        Err(e) => display::print_request_error(&key, &e),
    }
}

async fn chat(pool: Arc<SessionPool>, raw: bool) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    display::print_info("Reading prompts from stdin (`key> prompt`, /status, /cancel, /quit)");

    while let Some(line) = lines.next_line().await? {
        match ChatInput::parse(&line) {
            ChatInput::Prompt { key, prompt } => {
                let key = key.unwrap_or_else(|| pool.default_key().to_string());
                let options = RunOptions::for_key(key.clone());
                tokio::spawn(ask(Arc::clone(&pool), key, prompt, options, raw));
            }
            ChatInput::Status => display::print_status(&pool.status().await),
            ChatInput::Cancel(key) => {
                if pool.cancel(key.as_deref()).await {
                    display::print_info("Cancelled in-flight request");
                } else {
                    display::print_info("Nothing to cancel");
                }
            }
            ChatInput::Destroy(key) => {
                if pool.destroy(&key).await {
                    display::print_info(&format!("Destroyed session {key}"));
                } else {
                    display::print_error(&format!("No session {key}"));
                }
            }
            ChatInput::Reset(key) => {
                if pool.reset_circuit(&key).await {
                    display::print_info(&format!("Circuit breaker reset for {key}"));
                } else {
                    display::print_error(&format!("No session {key}"));
                }
            }
            ChatInput::Quit => break,
            ChatInput::Empty => {}
            ChatInput::Invalid(input) => display::print_error(&format!("Unknown command: {input}")),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            display::print_error(&e.to_string());
            std::process::exit(2);
        }
    };
    tracing::info!(
        capacity = config.capacity,
        binary = %config.worker.binary,
        model = ?config.worker.model,
        "Starting session pool"
    );
    let pool = SessionPool::start(config);

    match cli.command {
        Commands::Ask {
            prompt,
            key,
            resume,
        } => {
            let key = key.unwrap_or_else(|| pool.default_key().to_string());
            let mut options = RunOptions::for_key(key.clone());
            if let Some(token) = resume {
                options = options.continuation_token(token);
            }
            ask(Arc::clone(&pool), key, prompt, options, cli.raw).await;
        }
        Commands::Chat => {
            tokio::select! {
                result = chat(Arc::clone(&pool), cli.raw) => {
                    if let Err(e) = result {
                        display::print_error(&format!("Failed to read stdin: {e}"));
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted");
                }
            }
        }
    }

    pool.shutdown().await;
}
