//! Worker process spawning and stream-json protocol handling.

mod events;
mod process;
mod stream;

pub use events::*;
pub use process::*;
pub use stream::*;
