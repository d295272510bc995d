//! GDB Session Bridge
//!
//! Drives a GDB/MI subprocess on behalf of an IDE debugger front end:
//! run-state tracking, breakpoint pass counts and conditions, thread and
//! stack caching, and expression evaluation.

pub mod error;
pub mod gdb;
pub mod rpc;
pub mod session;

pub use error::{BindFailure, BreakpointError, SessionError, TransportError};
pub use session::{Session, SessionEvent};
