//! Session pool with LRU eviction and idle sweep.

mod manager;
mod status;

pub use manager::*;
pub use status::*;
