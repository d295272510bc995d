//! GDB/MI transport: process, parser and record types

pub mod types;
pub mod parser;
pub mod transport;
#[cfg(test)]
pub mod testing;

pub use types::*;
pub use transport::{InferiorMonitor, MiChannel, MiTransport};
