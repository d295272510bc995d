//! JSON-RPC 2.0 front end over stdin/stdout

pub mod protocol;
pub mod server;

pub use server::BridgeServer;
