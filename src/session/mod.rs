//! Worker sessions: one long-lived worker process per conversation.

mod breaker;
mod error;
mod request;
mod worker;

pub use breaker::*;
pub use error::*;
pub use request::{RunOptions, RunOutput, StreamEvent, StreamObserver};
pub use worker::*;
