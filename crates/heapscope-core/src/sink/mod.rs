//! Event sink implementations.

pub mod json;
pub mod memory;
pub mod text;

pub use json::JsonSink;
pub use memory::{EventBuffer, MemorySink};
pub use text::TextSink;
