//! Wire types for Claude Code's bidirectional stream-json protocol.
//!
//! A worker is launched with `--input-format stream-json` and
//! `--output-format stream-json`. Each line on stdin is a [`UserMessage`];
//! each line on stdout is a [`WorkerEvent`].

use serde::{Deserialize, Serialize};

/// Outbound request line written to the worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    #[serde(rename = "type")]
    kind: UserMessageKind,
    /// The message body.
    pub message: UserMessageBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum UserMessageKind {
    User,
}

/// Body of an outbound user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessageBody {
    /// Always `"user"`.
    pub role: String,
    /// The prompt text.
    pub content: String,
}

impl UserMessage {
    /// Create a user message carrying the given prompt.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            kind: UserMessageKind::User,
            message: UserMessageBody {
                role: "user".to_string(),
                content: prompt.into(),
            },
        }
    }

    /// Prompt text carried by this message.
    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.message.content
    }

    /// Serialize to a single newline-terminated line.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// System event data (`{"type":"system","subtype":"init",...}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    /// Event subtype (e.g., "init").
    #[serde(default)]
    pub subtype: String,
    /// Continuation token for this conversation.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Model reported by the worker.
    #[serde(default)]
    pub model: Option<String>,
}

impl SystemEvent {
    /// Returns true for the init handshake.
    #[must_use]
    pub fn is_init(&self) -> bool {
        self.subtype == "init"
    }
}

/// A content block inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Text produced by the assistant.
    Text {
        /// The text chunk.
        text: String,
    },
    /// Tool invocation issued by the assistant.
    ToolUse {
        /// Tool use identifier.
        #[serde(default)]
        id: String,
        /// Tool name.
        #[serde(default)]
        name: String,
    },
    /// Catch-all for blocks this crate does not interpret.
    #[serde(other)]
    Other,
}

/// Assistant message payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    /// Content blocks, in order.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

impl AssistantMessage {
    /// Iterate over the text chunks in this message.
    pub fn text_chunks(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Terminal result event data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    /// Result subtype (e.g., `success`, `error_max_turns`).
    #[serde(default)]
    pub subtype: Option<String>,
    /// Continuation token for this conversation.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Whether the turn failed.
    #[serde(default)]
    pub is_error: bool,
    /// Final text of the last assistant turn, or the error message.
    #[serde(default)]
    pub result: Option<String>,
    /// Total cost in USD.
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    /// Total duration in milliseconds.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Number of conversation turns.
    #[serde(default)]
    pub num_turns: Option<u32>,
}

impl ResultEvent {
    /// The final text field, empty when absent.
    #[must_use]
    pub fn final_text(&self) -> &str {
        self.result.as_deref().unwrap_or_default()
    }
}

/// Events emitted by a worker on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// System event, including the init handshake.
    System(SystemEvent),
    /// Assistant message with streamed content.
    Assistant {
        /// Message payload.
        #[serde(default)]
        message: AssistantMessage,
    },
    /// Terminal result of one request.
    Result(ResultEvent),
    /// Catch-all for event types this crate does not interpret
    /// (`user` tool results, `stream_event`, ...).
    #[serde(other)]
    Unknown,
}

impl WorkerEvent {
    /// Returns true if this event ends the current request.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_))
    }

    /// Returns the continuation token carried by this event, if any.
    #[must_use]
    pub fn continuation_token(&self) -> Option<&str> {
        match self {
            Self::System(system) if system.is_init() => system.session_id.as_deref(),
            Self::Result(result) => result.session_id.as_deref(),
            _ => None,
        }
    }
}
