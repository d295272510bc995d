//! The debug session: wires the transport to the run-state tracker,
//! breakpoint coordinator, thread cache and evaluator, and turns GDB's
//! asynchronous records into [`SessionEvent`]s.

use crate::error::{SessionError, TransportError};
use crate::gdb::{Frame, GdbConfig, GdbEvent, MiChannel, MiTransport, OutputChannel, ResultClass, StopReason};
use crate::session::breakpoints::{BreakpointCoordinator, BreakpointId, HitDecision};
use crate::session::run_state::{BreakOutcome, RunState, RunStateTracker, StepKind};
use crate::session::threads::ThreadCache;
use crate::session::variables::{VariableEvaluator, VariableInfo};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{self as async_mpsc, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// What the IDE is told about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionEvent {
    BreakpointHit {
        breakpoint: Option<BreakpointId>,
        gdb_id: u32,
        thread_id: Option<String>,
        file: Option<String>,
        line: Option<u32>,
    },
    StepComplete {
        thread_id: Option<String>,
        file: Option<String>,
        line: Option<u32>,
    },
    AsyncBreakComplete {
        thread_id: Option<String>,
    },
    SignalReceived {
        signal: String,
        thread_id: Option<String>,
    },
    ThreadStarted {
        id: String,
    },
    ThreadExited {
        id: String,
    },
    Output {
        channel: OutputChannel,
        content: String,
    },
    ProgramExited {
        exit_code: Option<String>,
    },
    Disconnected,
}

pub struct Session {
    gdb: Arc<dyn MiChannel>,
    transport: Option<Arc<MiTransport>>,
    run_state: Arc<RunStateTracker>,
    breakpoints: Arc<BreakpointCoordinator>,
    threads: Arc<ThreadCache>,
    evaluator: Arc<VariableEvaluator>,
    events: UnboundedSender<SessionEvent>,
}

impl Session {
    /// Assemble a session over any MI channel.
    pub fn new(gdb: Arc<dyn MiChannel>, config: &GdbConfig) -> (Arc<Self>, UnboundedReceiver<SessionEvent>) {
        Self::assemble(gdb, None, config)
    }

    fn assemble(
        gdb: Arc<dyn MiChannel>,
        transport: Option<Arc<MiTransport>>,
        config: &GdbConfig,
    ) -> (Arc<Self>, UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = async_mpsc::unbounded_channel();
        let run_state = Arc::new(RunStateTracker::new(Arc::clone(&gdb), config));
        let evaluator = Arc::new(VariableEvaluator::new(Arc::clone(&gdb), config));
        let breakpoints = Arc::new(BreakpointCoordinator::new(
            Arc::clone(&gdb),
            Arc::clone(&run_state),
            Arc::clone(&evaluator),
        ));
        let threads = Arc::new(ThreadCache::new(Arc::clone(&gdb), Arc::clone(&evaluator), config));
        let session = Arc::new(Self {
            gdb,
            transport,
            run_state,
            breakpoints,
            threads,
            evaluator,
            events,
        });
        (session, receiver)
    }

    /// Spawn GDB and start pumping its events.
    pub fn start(config: GdbConfig) -> Result<(Arc<Self>, UnboundedReceiver<SessionEvent>), SessionError> {
        let transport = Arc::new(MiTransport::new(config.clone()));
        transport.start()?;
        let gdb_events = transport
            .event_receiver()
            .ok_or(TransportError::AlreadyStarted)?;
        let (session, receiver) = Self::assemble(transport.clone(), Some(transport), &config);
        session
            .spawn_pump(gdb_events)
            .map_err(TransportError::from)?;
        Ok((session, receiver))
    }

    /// Consume GDB events in arrival order on a dedicated thread.
    pub fn spawn_pump(self: &Arc<Self>, gdb_events: Receiver<GdbEvent>) -> std::io::Result<JoinHandle<()>> {
        let session = Arc::clone(self);
        thread::Builder::new()
            .name("gdb-event-pump".to_string())
            .spawn(move || {
                for event in gdb_events {
                    let last = event == GdbEvent::Disconnected;
                    for out in session.handle_event(event) {
                        if session.events.send(out).is_err() {
                            debug!("Session event receiver dropped");
                        }
                    }
                    if last {
                        break;
                    }
                }
                debug!("GDB event pump finished");
            })
    }

    pub fn run_state(&self) -> &RunStateTracker {
        &self.run_state
    }

    pub fn breakpoints(&self) -> &BreakpointCoordinator {
        &self.breakpoints
    }

    pub fn threads(&self) -> &ThreadCache {
        &self.threads
    }

    pub fn evaluator(&self) -> &Arc<VariableEvaluator> {
        &self.evaluator
    }

    pub fn state(&self) -> RunState {
        self.run_state.state()
    }

    pub fn launch(&self, program: Option<&str>, args: &[String]) -> Result<(), SessionError> {
        self.run_state.launch(program, args)
    }

    pub fn attach(&self, pid: u32) -> Result<(), SessionError> {
        self.run_state.attach(pid)
    }

    fn require_break(&self, operation: &'static str) -> Result<(), SessionError> {
        let state = self.run_state.state();
        if state == RunState::Break {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: state.to_string(),
            })
        }
    }

    pub fn continue_execution(&self) -> Result<bool, SessionError> {
        self.require_break("continue")?;
        Ok(self.run_state.continue_execution()?)
    }

    pub fn step(&self, kind: StepKind, thread_id: Option<&str>) -> Result<(), SessionError> {
        self.require_break("step")?;
        let thread_id = self.thread_or_current(thread_id);
        let depth = match kind {
            StepKind::Out => self.threads.stack_depth(&thread_id)?,
            _ => 0,
        };
        self.run_state.step(kind, &thread_id, depth)
    }

    /// Break-all requested by the user.
    pub fn break_all(&self) -> Result<BreakOutcome, SessionError> {
        Ok(self.run_state.cause_break()?)
    }

    pub fn terminate(&self) -> Result<(), SessionError> {
        self.run_state.terminate()?;
        self.breakpoints.clear();
        self.threads.clear();
        if let Some(transport) = &self.transport {
            transport.stop()?;
        }
        Ok(())
    }

    fn thread_or_current(&self, thread_id: Option<&str>) -> String {
        thread_id
            .map(str::to_string)
            .or_else(|| self.threads.current_thread())
            .or_else(|| self.gdb.monitor().current_thread())
            .unwrap_or_else(|| "1".to_string())
    }

    /// Evaluate `expr` in `level` of `thread_id` (default: current thread,
    /// innermost frame).
    pub fn evaluate(&self, expr: &str, thread_id: Option<&str>, level: u32) -> Result<VariableInfo, SessionError> {
        self.require_break("evaluate")?;
        let thread_id = self.thread_or_current(thread_id);
        // Frames are loaded before selecting so the loader's own thread
        // switching cannot undo the selection below
        self.threads.with_frame(&thread_id, level, |_| ())?;

        let current = self.threads.current_thread();
        let switch_thread = current.as_deref() != Some(thread_id.as_str());
        if switch_thread {
            self.gdb
                .send_expect(&format!("thread-select {}", thread_id), ResultClass::Done)?;
        }
        if level != 0 {
            self.gdb
                .send_expect(&format!("stack-select-frame {}", level), ResultClass::Done)?;
        }
        let result = self
            .threads
            .with_frame(&thread_id, level, |frame| self.evaluator.resolve(expr, frame));
        if level != 0 {
            if let Err(e) = self.gdb.send_command("stack-select-frame 0") {
                warn!("Failed to restore frame: {}", e);
            }
        }
        if switch_thread {
            if let Some(current) = current {
                if let Err(e) = self.gdb.send_command(&format!("thread-select {}", current)) {
                    warn!("Failed to restore thread {}: {}", current, e);
                }
            }
        }
        result
    }

    fn emit_exit(&self, exit_code: Option<String>) -> Vec<SessionEvent> {
        if self.run_state.state() == RunState::Done {
            return Vec::new();
        }
        self.run_state.mark_done();
        self.breakpoints.clear();
        self.threads.clear();
        info!("Program exited with code {:?}", exit_code);
        vec![SessionEvent::ProgramExited { exit_code }]
    }

    /// Break-mode bookkeeping shared by every kind of presented stop.
    fn enter_break(&self, frame: Option<&Frame>) {
        self.run_state.set_state(RunState::Break);
        self.threads.clean_evaluated();
        self.threads.reset_frames();
        self.threads.mark_threads_dirty();
        if let Err(e) = self.threads.refresh_threads() {
            warn!("Failed to refresh threads: {}", e);
        }
        if let Some(frame) = frame {
            self.threads.set_current_location(
                frame.fullname.clone().or_else(|| frame.file.clone()),
                frame.line,
            );
        }
    }

    fn resume_after_hit(&self) {
        match self.run_state.continue_execution() {
            Ok(true) => {}
            Ok(false) => debug!("Resume after filtered hit refused"),
            Err(e) => warn!("Failed to resume after filtered hit: {}", e),
        }
    }

    /// Apply one GDB event to the session and return what to report.
    pub fn handle_event(&self, event: GdbEvent) -> Vec<SessionEvent> {
        match event {
            GdbEvent::Stopped {
                reason,
                frame,
                thread_id,
                breakpoint_id,
                signal_name,
                sequence,
            } => {
                if !self.run_state.is_current_stop(sequence) {
                    debug!("Ignoring stale stop #{}", sequence);
                    return Vec::new();
                }
                self.handle_stop(reason, frame, thread_id, breakpoint_id, signal_name, sequence)
            }
            GdbEvent::Running { thread_id } => {
                debug!("Running: {:?}", thread_id);
                Vec::new()
            }
            GdbEvent::BreakpointModified { breakpoint } => {
                if let Some(id) = breakpoint.id() {
                    self.breakpoints.record_hit_count(id, breakpoint.times);
                }
                Vec::new()
            }
            GdbEvent::BreakpointDeleted { number } => {
                if let Ok(id) = number.parse() {
                    self.breakpoints.on_deleted_by_gdb(id);
                }
                Vec::new()
            }
            GdbEvent::ThreadCreated { id, .. } => {
                self.threads.mark_threads_dirty();
                vec![SessionEvent::ThreadStarted { id }]
            }
            GdbEvent::ThreadExited { id, .. } => {
                self.threads.mark_threads_dirty();
                vec![SessionEvent::ThreadExited { id }]
            }
            GdbEvent::ThreadSelected { id } => {
                debug!("Thread {} selected", id);
                Vec::new()
            }
            GdbEvent::Exited { exit_code } => self.emit_exit(exit_code),
            GdbEvent::Output { channel, content } => vec![SessionEvent::Output { channel, content }],
            GdbEvent::Disconnected => {
                let mut out = self.emit_exit(None);
                out.push(SessionEvent::Disconnected);
                out
            }
        }
    }

    fn handle_stop(
        &self,
        reason: StopReason,
        frame: Option<Frame>,
        thread_id: Option<String>,
        breakpoint_id: Option<u32>,
        signal_name: Option<String>,
        sequence: u64,
    ) -> Vec<SessionEvent> {
        let file = frame.as_ref().and_then(|f| f.fullname.clone().or_else(|| f.file.clone()));
        let line = frame.as_ref().and_then(|f| f.line);
        match reason {
            StopReason::BreakpointHit => {
                let Some(gdb_id) = breakpoint_id else {
                    self.enter_break(frame.as_ref());
                    return vec![SessionEvent::AsyncBreakComplete { thread_id }];
                };
                match self.breakpoints.on_hit(gdb_id) {
                    HitDecision::Stop => {
                        // An edit may have resumed the inferior while the hit was processed
                        if !self.run_state.is_current_stop(sequence) {
                            return Vec::new();
                        }
                        self.enter_break(frame.as_ref());
                        let breakpoint = self
                            .breakpoints
                            .list()
                            .into_iter()
                            .find(|b| b.gdb_id == gdb_id)
                            .map(|b| b.id);
                        vec![SessionEvent::BreakpointHit {
                            breakpoint,
                            gdb_id,
                            thread_id,
                            file,
                            line,
                        }]
                    }
                    HitDecision::Continue | HitDecision::Ignored => {
                        self.resume_after_hit();
                        Vec::new()
                    }
                }
            }
            StopReason::EndSteppingRange | StopReason::FunctionFinished | StopReason::LocationReached => {
                self.enter_break(frame.as_ref());
                vec![SessionEvent::StepComplete { thread_id, file, line }]
            }
            StopReason::SignalReceived => {
                let signal = signal_name.unwrap_or_default();
                match signal.as_str() {
                    "SIGINT" | "0" if self.run_state.is_artificial_break() => {
                        debug!("Interrupt for a breakpoint edit");
                        Vec::new()
                    }
                    "SIGINT" | "0" => {
                        self.enter_break(frame.as_ref());
                        vec![SessionEvent::AsyncBreakComplete { thread_id }]
                    }
                    "SIGKILL" => self.emit_exit(None),
                    _ => {
                        self.enter_break(frame.as_ref());
                        vec![SessionEvent::SignalReceived { signal, thread_id }]
                    }
                }
            }
            reason if reason.is_exit() => self.emit_exit(None),
            other => {
                debug!("Stop with reason {:?}", other);
                if self.run_state.is_artificial_break() {
                    return Vec::new();
                }
                self.enter_break(frame.as_ref());
                vec![SessionEvent::AsyncBreakComplete { thread_id }]
            }
        }
    }
}
