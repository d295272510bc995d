//! Run-state tracking and the interrupt/resume primitives other components
//! use to mutate state safely while the inferior runs.

use crate::error::{SessionError, TransportError};
use crate::gdb::parser::quote_mi_string;
use crate::gdb::{GdbConfig, InferiorMonitor, MiChannel, ResultClass};
use crate::session::sync::{BreakGate, GateState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Coarse session state as the IDE sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Design,
    Run,
    Break,
    Step,
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakOutcome {
    /// Nothing to do: not in Run or the inferior was not executing.
    AlreadyStopped,
    Interrupted,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Into,
    Over,
    Out,
}

pub struct RunStateTracker {
    gdb: Arc<dyn MiChannel>,
    monitor: Arc<InferiorMonitor>,
    state: Mutex<RunState>,
    gate: BreakGate,
    /// Set while an artificial break is in effect.
    needs_resume: AtomicBool,
    /// Stop sequence number at the most recent resume; older stops are stale.
    resumed_after: AtomicU64,
    interrupt_timeout: Duration,
    interrupt_attempts: u32,
    thread_group: String,
}

impl RunStateTracker {
    pub fn new(gdb: Arc<dyn MiChannel>, config: &GdbConfig) -> Self {
        let monitor = gdb.monitor();
        Self {
            gdb,
            monitor,
            state: Mutex::new(RunState::Design),
            gate: BreakGate::new(),
            needs_resume: AtomicBool::new(false),
            resumed_after: AtomicU64::new(0),
            interrupt_timeout: Duration::from_millis(config.interrupt_timeout_ms),
            interrupt_attempts: config.interrupt_attempts.max(1),
            thread_group: config.thread_group.clone(),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn set_state(&self, next: RunState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state != next {
            debug!("Run state {} -> {}", *state, next);
            // Done is terminal
            if *state != RunState::Done {
                *state = next;
            }
        }
    }

    /// True while GDB reports the inferior as executing.
    pub fn is_executing(&self) -> bool {
        self.monitor.is_running()
    }

    pub fn gate(&self) -> GateState {
        self.gate.current()
    }

    pub fn is_artificial_break(&self) -> bool {
        self.needs_resume.load(Ordering::SeqCst)
    }

    fn require(&self, operation: &'static str, allowed: &[RunState]) -> Result<RunState, SessionError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: state.to_string(),
            })
        }
    }

    fn mark_resumed(&self) {
        self.resumed_after
            .store(self.monitor.stop_count(), Ordering::SeqCst);
    }

    /// Load `program` (when given) and start it. Design -> Run.
    pub fn launch(&self, program: Option<&str>, args: &[String]) -> Result<(), SessionError> {
        self.require("launch", &[RunState::Design])?;
        if let Some(program) = program {
            self.gdb.send_expect(
                &format!("file-exec-and-symbols {}", quote_mi_string(program)),
                ResultClass::Done,
            )?;
        }
        if !args.is_empty() {
            self.gdb
                .send_expect(&format!("exec-arguments {}", args.join(" ")), ResultClass::Done)?;
        }
        self.mark_resumed();
        self.gdb.send_expect("exec-run", ResultClass::Running)?;
        self.set_state(RunState::Run);
        info!("Launched debuggee");
        Ok(())
    }

    /// Attach to a running process and let it continue. Design -> Run.
    pub fn attach(&self, pid: u32) -> Result<(), SessionError> {
        self.require("attach", &[RunState::Design])?;
        self.gdb
            .send_expect(&format!("target-attach {}", pid), ResultClass::Done)?;
        self.set_state(RunState::Break);
        self.continue_execution()?;
        info!("Attached to process {}", pid);
        Ok(())
    }

    /// Interrupt a running inferior and wait for the stop to be acknowledged.
    /// Outside Run this returns immediately.
    pub fn cause_break(&self) -> Result<BreakOutcome, TransportError> {
        if self.state() != RunState::Run || !self.monitor.is_running() {
            return Ok(BreakOutcome::AlreadyStopped);
        }
        let _gate = self.gate.acquire(GateState::BreakAllPending);

        for attempt in 1..=self.interrupt_attempts {
            let baseline = self.monitor.stop_count();
            if !self.monitor.is_running() {
                // Something else stopped it while we waited for the gate
                self.set_state(RunState::Break);
                return Ok(BreakOutcome::Interrupted);
            }
            debug!("Interrupting inferior (attempt {})", attempt);
            if let Err(e) = self.gdb.send_expect("exec-interrupt", ResultClass::Done) {
                if e.is_disconnect() {
                    return Err(e);
                }
                warn!("exec-interrupt failed: {}", e);
            }
            if self.monitor.wait_for_stop_after(baseline, self.interrupt_timeout) {
                self.set_state(RunState::Break);
                return Ok(BreakOutcome::Interrupted);
            }
            if !self.monitor.is_connected() {
                return Err(TransportError::Disconnected);
            }
        }
        warn!(
            "Inferior did not stop after {} interrupt attempts",
            self.interrupt_attempts
        );
        Ok(BreakOutcome::TimedOut)
    }

    /// Break if the inferior is running so a breakpoint can be edited.
    /// Returns true when this call introduced the break.
    pub fn prepare_to_modify_breakpoint(&self) -> Result<bool, TransportError> {
        if self.state() != RunState::Run || !self.monitor.is_running() {
            return Ok(false);
        }
        self.needs_resume.store(true, Ordering::SeqCst);
        match self.cause_break() {
            Ok(BreakOutcome::Interrupted) => Ok(true),
            Ok(outcome) => {
                self.needs_resume.store(false, Ordering::SeqCst);
                if outcome == BreakOutcome::TimedOut {
                    warn!("Editing breakpoint while the inferior is still running");
                }
                Ok(false)
            }
            Err(e) => {
                self.needs_resume.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Resume after [`prepare_to_modify_breakpoint`]. A break the user asked
    /// for is left alone.
    ///
    /// [`prepare_to_modify_breakpoint`]: Self::prepare_to_modify_breakpoint
    pub fn resume_from_interrupt(&self) -> Result<bool, TransportError> {
        if self.needs_resume.swap(false, Ordering::SeqCst) {
            self.continue_execution()
        } else {
            Ok(false)
        }
    }

    /// Scoped form of the prepare/resume pair.
    pub fn artificial_break(&self) -> Result<ArtificialBreak<'_>, TransportError> {
        let introduced = self.prepare_to_modify_breakpoint()?;
        Ok(ArtificialBreak {
            tracker: self,
            introduced,
        })
    }

    /// Resume the whole thread group. Refused (returns false) while a
    /// break-all is pending.
    pub fn continue_execution(&self) -> Result<bool, TransportError> {
        let Some(_gate) = self.gate.try_acquire(GateState::CondBpPending) else {
            debug!("Break-all pending, not resuming");
            return Ok(false);
        };
        let previous = self.state();
        if previous == RunState::Done {
            return Ok(false);
        }
        self.mark_resumed();
        self.set_state(RunState::Run);
        let command = format!("exec-continue --thread-group {}", self.thread_group);
        if let Err(e) = self.gdb.send_expect(&command, ResultClass::Running) {
            self.set_state(previous);
            return Err(e);
        }
        Ok(true)
    }

    /// Step `thread_id`. `depth` is the thread's current stack depth; step
    /// out of the outermost frame degrades to step over.
    pub fn step(&self, kind: StepKind, thread_id: &str, depth: usize) -> Result<(), SessionError> {
        self.require("step", &[RunState::Break])?;
        let command = match kind {
            StepKind::Into => format!("exec-step --thread {}", thread_id),
            StepKind::Over => format!("exec-next --thread {}", thread_id),
            StepKind::Out if depth > 1 => format!("exec-finish --thread {}", thread_id),
            StepKind::Out => format!("exec-next --thread {}", thread_id),
        };
        self.mark_resumed();
        self.set_state(RunState::Step);
        if let Err(e) = self.gdb.send_expect(&command, ResultClass::Running) {
            self.set_state(RunState::Break);
            return Err(e.into());
        }
        Ok(())
    }

    /// Whether a stop with this sequence number happened after the last
    /// resume. Stale stops must not drive state transitions.
    pub fn is_current_stop(&self, sequence: u64) -> bool {
        sequence > self.resumed_after.load(Ordering::SeqCst)
    }

    /// Kill the inferior. Any state -> Done.
    pub fn terminate(&self) -> Result<(), TransportError> {
        if self.state() == RunState::Done {
            return Ok(());
        }
        if self.monitor.is_connected() {
            self.cause_break()?;
            if let Err(e) = self
                .gdb
                .send_command(&format!("interpreter-exec console {}", quote_mi_string("kill")))
            {
                warn!("Failed to kill inferior: {}", e);
            }
        }
        self.mark_done();
        Ok(())
    }

    pub fn mark_done(&self) {
        self.set_state(RunState::Done);
        self.needs_resume.store(false, Ordering::SeqCst);
        info!("Session finished");
    }
}

/// Holds an artificial break for the duration of a breakpoint edit.
pub struct ArtificialBreak<'a> {
    tracker: &'a RunStateTracker,
    introduced: bool,
}

impl ArtificialBreak<'_> {
    pub fn introduced(&self) -> bool {
        self.introduced
    }
}

impl Drop for ArtificialBreak<'_> {
    fn drop(&mut self) {
        if self.introduced {
            if let Err(e) = self.tracker.resume_from_interrupt() {
                warn!("Failed to resume after breakpoint edit: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdb::testing::ScriptedGdb;

    fn tracker() -> (Arc<ScriptedGdb>, RunStateTracker) {
        let gdb = ScriptedGdb::new();
        gdb.on("exec-", "^running");
        gdb.on("exec-interrupt", "^done");
        gdb.on("exec-arguments", "^done");
        let config = GdbConfig {
            interrupt_timeout_ms: 20,
            interrupt_attempts: 2,
            ..Default::default()
        };
        let tracker = RunStateTracker::new(gdb.clone(), &config);
        (gdb, tracker)
    }

    fn running() -> (Arc<ScriptedGdb>, RunStateTracker) {
        let (gdb, tracker) = tracker();
        tracker.launch(Some("/tmp/a.out"), &[]).unwrap();
        gdb.clear_sent();
        (gdb, tracker)
    }

    #[test]
    fn test_launch_moves_design_to_run() {
        let (gdb, tracker) = tracker();
        tracker.launch(Some("/tmp/a.out"), &["-v".to_string()]).unwrap();
        assert_eq!(tracker.state(), RunState::Run);
        assert!(tracker.is_executing());
        assert_eq!(
            gdb.sent(),
            vec![
                "file-exec-and-symbols \"/tmp/a.out\"".to_string(),
                "exec-arguments -v".to_string(),
                "exec-run".to_string()
            ]
        );
        assert!(tracker.launch(None, &[]).is_err());
    }

    #[test]
    fn test_cause_break_in_break_is_noop() {
        let (gdb, tracker) = running();
        tracker.set_state(RunState::Break);
        assert_eq!(tracker.cause_break().unwrap(), BreakOutcome::AlreadyStopped);
        assert!(gdb.sent().is_empty());
    }

    #[test]
    fn test_cause_break_interrupts_running_inferior() {
        let (gdb, tracker) = running();
        assert_eq!(tracker.cause_break().unwrap(), BreakOutcome::Interrupted);
        assert_eq!(tracker.state(), RunState::Break);
        assert_eq!(gdb.sent_matching("exec-interrupt").len(), 1);
        assert_eq!(tracker.gate(), GateState::Idle);
    }

    #[test]
    fn test_cause_break_times_out_after_retries() {
        let (gdb, tracker) = running();
        gdb.set_ack_interrupts(false);
        assert_eq!(tracker.cause_break().unwrap(), BreakOutcome::TimedOut);
        assert_eq!(gdb.sent_matching("exec-interrupt").len(), 2);
        assert_eq!(tracker.state(), RunState::Run);
    }

    #[test]
    fn test_artificial_break_resumes_only_what_it_stopped() {
        let (gdb, tracker) = running();
        {
            let guard = tracker.artificial_break().unwrap();
            assert!(guard.introduced());
            assert_eq!(tracker.state(), RunState::Break);
            // A nested edit must not resume early
            let nested = tracker.artificial_break().unwrap();
            assert!(!nested.introduced());
        }
        assert_eq!(tracker.state(), RunState::Run);
        assert_eq!(gdb.sent_matching("exec-continue").len(), 1);

        tracker.cause_break().unwrap();
        gdb.clear_sent();
        {
            let guard = tracker.artificial_break().unwrap();
            assert!(!guard.introduced());
        }
        assert_eq!(tracker.state(), RunState::Break);
        assert!(gdb.sent_matching("exec-continue").is_empty());
    }

    #[test]
    fn test_continue_refused_while_break_all_pending() {
        let (gdb, tracker) = running();
        tracker.cause_break().unwrap();
        let _held = tracker.gate.try_acquire(GateState::BreakAllPending).unwrap();
        assert!(!tracker.continue_execution().unwrap());
        assert!(gdb.sent_matching("exec-continue").is_empty());
        assert_eq!(tracker.state(), RunState::Break);
    }

    #[test]
    fn test_stale_stops_are_detected() {
        let (gdb, tracker) = running();
        tracker.cause_break().unwrap();
        let stale = gdb.monitor().stop_count();
        tracker.continue_execution().unwrap();
        assert!(!tracker.is_current_stop(stale));
        assert!(tracker.is_current_stop(stale + 1));
    }

    #[test]
    fn test_step_out_of_outermost_frame_is_next() {
        let (gdb, tracker) = running();
        tracker.cause_break().unwrap();
        gdb.clear_sent();
        tracker.step(StepKind::Out, "1", 1).unwrap();
        assert_eq!(tracker.state(), RunState::Step);
        assert_eq!(gdb.sent(), vec!["exec-next --thread 1".to_string()]);
        tracker.set_state(RunState::Break);
        tracker.step(StepKind::Out, "1", 3).unwrap();
        assert_eq!(gdb.sent_matching("exec-finish --thread 1").len(), 1);
    }

    #[test]
    fn test_terminate_is_terminal() {
        let (_gdb, tracker) = running();
        tracker.terminate().unwrap();
        assert_eq!(tracker.state(), RunState::Done);
        tracker.set_state(RunState::Run);
        assert_eq!(tracker.state(), RunState::Done);
    }
}
