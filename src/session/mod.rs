//! Session coordination on top of the MI transport

pub mod sync;
pub mod run_state;
pub mod breakpoints;
pub mod threads;
pub mod variables;
pub mod engine;

pub use breakpoints::{
    BoundBreakpoint, BreakpointCoordinator, BreakpointId, BreakpointLocation, BreakpointRequest,
    BreakpointStatus, Condition, ConditionStyle, HitDecision, PassCount, PassCountStyle, PendingId,
};
pub use engine::{Session, SessionEvent};
pub use run_state::{BreakOutcome, RunState, RunStateTracker, StepKind};
pub use threads::{DebugThread, StackFrame, ThreadCache, ThreadList, ThreadSummary};
pub use variables::{EvalResult, VariableEvaluator, VariableInfo};
