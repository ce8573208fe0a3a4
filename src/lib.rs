//! Claude Session Pool - long-lived Claude Code workers for concurrent chat
//! conversations.

pub mod cli;
pub mod config;
pub mod display;
pub mod merge;
pub mod pool;
pub mod session;
