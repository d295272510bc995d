//! Error types shared by the transport and the session components.

use thiserror::Error;

/// Failures raised while talking to the GDB subprocess.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// GDB answered `^error`; carries its `msg` field.
    #[error("gdb error: {message}")]
    Gdb { message: String },
    #[error("unexpected result class for `{command}`: expected {expected}, got {actual}")]
    UnexpectedClass {
        command: String,
        expected: String,
        actual: String,
    },
    #[error("malformed MI output: {0}")]
    Malformed(String),
    #[error("timed out waiting for reply to `{0}`")]
    Timeout(String),
    #[error("gdb process disconnected")]
    Disconnected,
    #[error("i/o error: {0}")]
    Io(String),
    #[error("gdb process already running")]
    AlreadyStarted,
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

impl TransportError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::Disconnected)
    }
}

/// Reasons a pending breakpoint could not be bound to a code location.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindFailure {
    #[error("unsupported breakpoint location kind: {0}")]
    UnsupportedLocation(String),
    #[error("pending breakpoint has been deleted")]
    ParentDeleted,
    #[error("no active debuggee process")]
    NoActiveProcess,
    #[error("gdb refused the location: {0}")]
    Rejected(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures of edits on an already bound breakpoint.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BreakpointError {
    #[error("unknown breakpoint {0}")]
    UnknownId(u32),
    #[error("breakpoint {0} has been deleted")]
    Deleted(u32),
    #[error("invalid pass count threshold {0}")]
    InvalidThreshold(u32),
    #[error("gdb rejected the change: {0}")]
    Rejected(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Session level failures surfaced to callers of [`crate::session::Session`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("operation `{operation}` is not valid in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    #[error("unknown thread {0}")]
    UnknownThread(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Breakpoint(#[from] BreakpointError),
    #[error(transparent)]
    Bind(#[from] BindFailure),
}
