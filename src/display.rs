//! Colored CLI display utilities for the pool front end.
//!
//! The engine itself never formats user-facing text; everything printed to
//! the terminal goes through here.

use std::io::{self, Write};

use chrono::Utc;
use owo_colors::OwoColorize;

use crate::pool::PoolStatus;
use crate::session::{RunOutput, SessionError};

/// Get current timestamp in the same format as tracing.
fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Truncate a string to a maximum number of characters, adding ellipsis if
/// truncated.
#[must_use]
pub fn truncate(s: &str, max_len: usize, raw_mode: bool) -> String {
    if raw_mode || s.chars().count() <= max_len {
        return s.to_string();
    }
    if max_len <= 3 {
        return "...".to_string();
    }
    let kept: String = s.chars().take(max_len - 3).collect();
    format!("{kept}...")
}

/// Print a request being dispatched.
pub fn print_dispatch(key: &str, prompt: &str, raw_mode: bool) {
    println!(
        "{} {} {}",
        timestamp().dimmed(),
        format!("[{key}]").blue().bold(),
        truncate(prompt, 60, raw_mode).dimmed()
    );
    let _ = io::stdout().flush();
}

/// Print streamed text content.
pub fn print_text(text: &str) {
    print!("{text}");
    let _ = io::stdout().flush();
}

/// Print the end of a reply.
pub fn print_reply_end(key: &str, output: &RunOutput, raw_mode: bool) {
    println!();
    println!(
        "{} {} done {}",
        timestamp().dimmed(),
        format!("[{key}]").blue().bold(),
        output
            .continuation_token
            .as_deref()
            .map_or(String::new(), |token| format!(
                "token={}",
                truncate(token, 20, raw_mode)
            ))
            .dimmed()
    );
    let _ = io::stdout().flush();
}

fn error_label(error: &SessionError) -> String {
    match error {
        SessionError::CircuitOpen { .. } => "[BREAKER]".red().bold().to_string(),
        SessionError::Timeout(_) | SessionError::Cancelled => {
            "[ABORTED]".yellow().bold().to_string()
        }
        e if e.is_transient() => "[RETRY]".yellow().bold().to_string(),
        _ => "[ERROR]".red().bold().to_string(),
    }
}

/// Print a failed request.
pub fn print_request_error(key: &str, error: &SessionError) {
    let label = error_label(error);
    println!("{} {} {} {}", timestamp().dimmed(), label, key.bold(), error);
    let _ = io::stdout().flush();
}

/// Print an informational line.
pub fn print_info(message: &str) {
    println!("{} {}", "[POOL]".cyan().bold(), message);
    let _ = io::stdout().flush();
}

/// Print an error message.
pub fn print_error(message: &str) {
    println!("{} {}", "[ERROR]".red().bold(), message);
    let _ = io::stdout().flush();
}

/// Format pool diagnostics as plain lines.
#[must_use]
pub fn format_status(status: &PoolStatus) -> Vec<String> {
    let mut lines = vec![format!("sessions {}/{}", status.size, status.capacity)];
    for channel in &status.per_channel {
        lines.push(format!(
            "  {} idle={}s alive={} busy={} queued={} crashes={}",
            channel.key,
            channel.idle_seconds,
            channel.alive,
            channel.busy,
            channel.queue_depth,
            channel.crashes
        ));
    }
    lines
}

/// Print pool diagnostics.
pub fn print_status(status: &PoolStatus) {
    for line in format_status(status) {
        println!("{} {}", "[STATUS]".magenta().bold(), line);
    }
    let _ = io::stdout().flush();
}
