//! Request, options and streaming observer types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::session::SessionError;

/// Per-request options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Conversation key. The pool's default key is used when absent.
    pub key: Option<String>,
    /// Continuation token to write into the session before dispatch.
    pub continuation_token: Option<String>,
    /// Override the configured permission-skip default for this spawn.
    pub skip_permissions: Option<bool>,
    /// Override the configured request timeout.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    /// Options targeting a specific conversation.
    #[must_use]
    pub fn for_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Resume from a stored continuation token.
    #[must_use]
    pub fn continuation_token(mut self, token: impl Into<String>) -> Self {
        self.continuation_token = Some(token.into());
        self
    }

    /// Set the permission-skip flag.
    #[must_use]
    pub fn skip_permissions(mut self, skip: bool) -> Self {
        self.skip_permissions = Some(skip);
        self
    }

    /// Set a request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    /// Streamed text merged with the final result text.
    pub text: String,
    /// Token for resuming this conversation later.
    pub continuation_token: Option<String>,
}

/// Receives streaming progress for one request.
///
/// All methods default to no-ops. Calls happen on the session's task, so
/// implementations must not block.
pub trait StreamObserver: Send + Sync {
    /// A text chunk arrived. `cumulative` is all text streamed so far.
    fn on_text(&self, _chunk: &str, _cumulative: &str) {}

    /// The request succeeded.
    fn on_complete(&self, _output: &RunOutput) {}

    /// The request failed.
    fn on_error(&self, _error: &SessionError) {}
}

/// Streaming progress forwarded over a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A text chunk and the cumulative text.
    Text {
        /// New chunk.
        chunk: String,
        /// Everything streamed so far.
        cumulative: String,
    },
    /// The request succeeded.
    Complete(RunOutput),
    /// The request failed; carries the error message.
    Error(String),
}

impl StreamObserver for mpsc::UnboundedSender<StreamEvent> {
    fn on_text(&self, chunk: &str, cumulative: &str) {
        let _ = self.send(StreamEvent::Text {
            chunk: chunk.to_string(),
            cumulative: cumulative.to_string(),
        });
    }

    fn on_complete(&self, output: &RunOutput) {
        let _ = self.send(StreamEvent::Complete(output.clone()));
    }

    fn on_error(&self, error: &SessionError) {
        let _ = self.send(StreamEvent::Error(error.to_string()));
    }
}

/// A queued unit of work owned by a session.
pub(crate) struct Request {
    pub(crate) id: Uuid,
    pub(crate) prompt: String,
    pub(crate) options: RunOptions,
    observer: Option<Arc<dyn StreamObserver>>,
    responder: oneshot::Sender<Result<RunOutput, SessionError>>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("streaming", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl Request {
    pub(crate) fn new(
        prompt: String,
        options: RunOptions,
        observer: Option<Arc<dyn StreamObserver>>,
    ) -> (Self, oneshot::Receiver<Result<RunOutput, SessionError>>) {
        let (responder, rx) = oneshot::channel();
        let request = Self {
            id: Uuid::new_v4(),
            prompt,
            options,
            observer,
            responder,
        };
        (request, rx)
    }

    pub(crate) fn on_text(&self, chunk: &str, cumulative: &str) {
        if let Some(observer) = &self.observer {
            observer.on_text(chunk, cumulative);
        }
    }

    pub(crate) fn resolve(self, output: RunOutput) {
        if let Some(observer) = &self.observer {
            observer.on_complete(&output);
        }
        if self.responder.send(Ok(output)).is_err() {
            tracing::debug!(request_id = %self.id, "Caller dropped before completion");
        }
    }

    pub(crate) fn reject(self, error: SessionError) {
        tracing::debug!(request_id = %self.id, error = %error, "Request rejected");
        if let Some(observer) = &self.observer {
            observer.on_error(&error);
        }
        let _ = self.responder.send(Err(error));
    }
}
