//! GDB/MI Transport
//!
//! Owns the GDB process, tags every command with a token, routes replies back
//! to the caller waiting on them and fans asynchronous records out as
//! [`GdbEvent`]s.

use crate::error::TransportError;
use crate::gdb::parser::{parse_breakpoint, parse_frame, LineAssembler, MiParser};
use crate::gdb::types::*;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

type Reply = Result<MiResponse, TransportError>;

/// Anything that can carry MI commands to GDB. Session components only see
/// this trait so they can be driven by a scripted GDB in tests.
pub trait MiChannel: Send + Sync {
    /// Send a command (without the leading `-`) and wait for its result record.
    fn send_command(&self, command: &str) -> Result<MiResponse, TransportError>;

    /// Send a command without waiting for its result record.
    fn send_command_async(&self, command: &str) -> Result<(), TransportError>;

    /// Shared view of what the reader has learnt about the inferior.
    fn monitor(&self) -> Arc<InferiorMonitor>;

    /// The reply line exactly as GDB printed it.
    fn send_raw(&self, command: &str) -> Result<String, TransportError> {
        Ok(self.send_command(command)?.raw)
    }

    /// Send a command and insist on a particular result class. `^error`
    /// becomes [`TransportError::Gdb`].
    fn send_expect(&self, command: &str, expected: ResultClass) -> Result<MiResponse, TransportError> {
        let response = self.send_command(command)?;
        if let Some(message) = response.error_message() {
            return Err(TransportError::Gdb { message });
        }
        if response.class != expected {
            return Err(TransportError::UnexpectedClass {
                command: command.to_string(),
                expected: expected.to_string(),
                actual: response.class.to_string(),
            });
        }
        Ok(response)
    }
}

/// Execution flag and stop sequence of the inferior, written only by the
/// reader and read by everyone else.
#[derive(Debug, Default)]
pub struct InferiorMonitor {
    state: Mutex<GdbSessionState>,
    changed: Condvar,
}

impl InferiorMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GdbSessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> GdbSessionState {
        self.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn stop_count(&self) -> u64 {
        self.lock().stop_count
    }

    pub fn current_thread(&self) -> Option<String> {
        self.lock().current_thread.clone()
    }

    pub fn set_connected(&self, connected: bool) {
        let mut state = self.lock();
        state.connected = connected;
        if !connected {
            state.running = false;
        }
        self.changed.notify_all();
    }

    pub fn mark_running(&self) {
        self.lock().running = true;
        self.changed.notify_all();
    }

    /// Record a stop and return its sequence number.
    pub fn mark_stopped(&self, thread_id: Option<String>) -> u64 {
        let mut state = self.lock();
        state.running = false;
        state.stop_count += 1;
        if thread_id.is_some() {
            state.current_thread = thread_id;
        }
        let seq = state.stop_count;
        drop(state);
        self.changed.notify_all();
        seq
    }

    pub fn set_current_thread(&self, thread_id: String) {
        self.lock().current_thread = Some(thread_id);
    }

    /// Block until a stop newer than `baseline` is recorded, the process
    /// disconnects, or `timeout` passes. Returns true on a stop.
    pub fn wait_for_stop_after(&self, baseline: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.stop_count > baseline {
                return true;
            }
            if !state.connected {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

struct PendingRequest {
    command: String,
    reply: Sender<Reply>,
}

type PendingMap = Arc<Mutex<BTreeMap<u64, PendingRequest>>>;

/// Routes parsed lines: result records to their waiting caller, everything
/// else to the event channel.
pub struct ReplyRouter {
    parser: MiParser,
    pending: PendingMap,
    event_tx: Sender<GdbEvent>,
    monitor: Arc<InferiorMonitor>,
}

impl ReplyRouter {
    fn new(pending: PendingMap, event_tx: Sender<GdbEvent>, monitor: Arc<InferiorMonitor>) -> Self {
        Self {
            parser: MiParser::new(),
            pending,
            event_tx,
            monitor,
        }
    }

    fn pending(&self) -> MutexGuard<'_, BTreeMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn route_line(&self, line: &str) {
        debug!("GDB output: {}", line);
        match self.parser.parse_line(line) {
            Ok(Some(MiOutputRecord::Result { token, class, results })) => {
                if class == ResultClass::Running {
                    self.monitor.mark_running();
                }
                let response = MiResponse {
                    token,
                    class,
                    results,
                    raw: line.to_string(),
                };
                self.deliver(response);
            }
            Ok(Some(record)) => self.handle_async_record(record),
            Ok(None) => {}
            Err(e) => warn!("Failed to parse line: {} - {}", line, e),
        }
    }

    fn deliver(&self, response: MiResponse) {
        let mut pending = self.pending();
        let key = match response.token {
            Some(tok) => pending.contains_key(&tok).then_some(tok),
            // Untokened replies belong to the oldest outstanding request
            None => pending.keys().next().copied(),
        };
        match key.and_then(|k| pending.remove(&k)) {
            Some(request) => {
                debug!("Reply for `{}`: {}", request.command, response.class);
                let _ = request.reply.send(Ok(response));
            }
            None => debug!("Dropping uncorrelated reply: {}", response.raw),
        }
    }

    /// Fail every outstanding request. Used once the stream has ended.
    pub fn fail_all(&self, error: TransportError) {
        let drained = std::mem::take(&mut *self.pending());
        for (_, request) in drained {
            warn!("Failing `{}`: {}", request.command, error);
            let _ = request.reply.send(Err(error.clone()));
        }
    }

    fn send_event(&self, event: GdbEvent) {
        let _ = self.event_tx.send(event);
    }

    fn handle_async_record(&self, record: MiOutputRecord) {
        match record {
            MiOutputRecord::Async { class: AsyncClass::Stopped, results, .. } => {
                let reason = find_string(&results, "reason")
                    .map(StopReason::from)
                    .unwrap_or_else(|| StopReason::Unknown("unknown".to_string()));
                let thread_id = find_string(&results, "thread-id");
                let sequence = self.monitor.mark_stopped(thread_id.clone());
                self.send_event(GdbEvent::Stopped {
                    reason,
                    frame: parse_frame(&results),
                    thread_id,
                    breakpoint_id: find_string(&results, "bkptno").and_then(|s| s.parse().ok()),
                    signal_name: find_string(&results, "signal-name"),
                    sequence,
                });
            }
            MiOutputRecord::Async { class: AsyncClass::Running, results, .. } => {
                self.monitor.mark_running();
                self.send_event(GdbEvent::Running {
                    thread_id: find_string(&results, "thread-id"),
                });
            }
            MiOutputRecord::Notification { class, results } => match class {
                NotificationClass::BreakpointModified => {
                    if let Some(breakpoint) = parse_breakpoint(&results) {
                        self.send_event(GdbEvent::BreakpointModified { breakpoint });
                    }
                }
                NotificationClass::BreakpointDeleted => {
                    if let Some(number) = find_string(&results, "id") {
                        self.send_event(GdbEvent::BreakpointDeleted { number });
                    }
                }
                NotificationClass::ThreadCreated | NotificationClass::ThreadExited => {
                    let id = find_string(&results, "id");
                    let group_id = find_string(&results, "group-id");
                    if let (Some(id), Some(group_id)) = (id, group_id) {
                        let event = if class == NotificationClass::ThreadCreated {
                            GdbEvent::ThreadCreated { id, group_id }
                        } else {
                            GdbEvent::ThreadExited { id, group_id }
                        };
                        self.send_event(event);
                    }
                }
                NotificationClass::ThreadSelected => {
                    if let Some(id) = find_string(&results, "id") {
                        self.monitor.set_current_thread(id.clone());
                        self.send_event(GdbEvent::ThreadSelected { id });
                    }
                }
                NotificationClass::ThreadGroupExited => {
                    self.send_event(GdbEvent::Exited {
                        exit_code: find_string(&results, "exit-code"),
                    });
                }
                other => debug!("Ignoring notification {:?}", other),
            },
            MiOutputRecord::Console(content) => self.send_event(GdbEvent::Output {
                channel: OutputChannel::Console,
                content,
            }),
            MiOutputRecord::Target(content) => self.send_event(GdbEvent::Output {
                channel: OutputChannel::Target,
                content,
            }),
            MiOutputRecord::Log(content) => self.send_event(GdbEvent::Output {
                channel: OutputChannel::Log,
                content,
            }),
            MiOutputRecord::Status { class, .. } => debug!("Status record: {}", class),
            MiOutputRecord::Result { .. } => {}
        }
    }

    /// Pump a byte stream until EOF, then fail what is still in flight and
    /// emit the terminal `Disconnected` event.
    pub fn run<R: Read>(&self, mut reader: R) {
        let mut assembler = LineAssembler::new();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for line in assembler.push(&buf[..n]) {
                        self.route_line(&line);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Error reading GDB output: {}", e);
                    break;
                }
            }
        }
        if let Some(rest) = assembler.finish() {
            self.route_line(&rest);
        }
        self.monitor.set_connected(false);
        self.fail_all(TransportError::Disconnected);
        self.send_event(GdbEvent::Disconnected);
        info!("GDB output reader stopped");
    }
}

/// GDB subprocess speaking MI over its stdin/stdout.
pub struct MiTransport {
    process: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    token_counter: AtomicU64,
    config: GdbConfig,
    pending: PendingMap,
    event_tx: Sender<GdbEvent>,
    event_rx: Mutex<Option<Receiver<GdbEvent>>>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    monitor: Arc<InferiorMonitor>,
}

impl MiTransport {
    pub fn new(config: GdbConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel();
        Self {
            process: Mutex::new(None),
            stdin: Mutex::new(None),
            token_counter: AtomicU64::new(1),
            config,
            pending: Arc::new(Mutex::new(BTreeMap::new())),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            reader_handle: Mutex::new(None),
            monitor: Arc::new(InferiorMonitor::new()),
        }
    }

    pub fn config(&self) -> &GdbConfig {
        &self.config
    }

    /// Spawn GDB and the reader threads, then apply the session settings.
    pub fn start(&self) -> Result<(), TransportError> {
        let mut process_slot = self.process.lock().unwrap_or_else(|p| p.into_inner());
        if process_slot.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        info!("Starting GDB: {} {:?}", self.config.gdb_path, self.config.gdb_args);

        let mut process = Command::new(&self.config.gdb_path)
            .args(&self.config.gdb_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = process.stdin.take().ok_or(TransportError::Disconnected)?;
        let stdout = process.stdout.take().ok_or(TransportError::Disconnected)?;
        let stderr = process.stderr.take().ok_or(TransportError::Disconnected)?;

        *self.stdin.lock().unwrap_or_else(|p| p.into_inner()) = Some(stdin);
        *process_slot = Some(process);
        drop(process_slot);
        self.monitor.set_connected(true);

        let router = ReplyRouter::new(
            Arc::clone(&self.pending),
            self.event_tx.clone(),
            Arc::clone(&self.monitor),
        );
        let reader_handle = thread::Builder::new()
            .name("gdb-mi-reader".to_string())
            .spawn(move || router.run(stdout))?;
        *self.reader_handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(reader_handle);

        let event_tx_stderr = self.event_tx.clone();
        thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(Result::ok) {
                debug!("GDB stderr: {}", line);
                let _ = event_tx_stderr.send(GdbEvent::Output {
                    channel: OutputChannel::Log,
                    content: line,
                });
            }
        });

        self.initialize()?;
        info!("GDB started successfully");
        Ok(())
    }

    fn initialize(&self) -> Result<(), TransportError> {
        self.send_expect("gdb-set mi-async on", ResultClass::Done)?;
        self.send_expect("gdb-set pagination off", ResultClass::Done)?;
        self.send_expect("gdb-set confirm off", ResultClass::Done)?;
        Ok(())
    }

    /// Hand out the event receiver. Only the first caller gets it.
    pub fn event_receiver(&self) -> Option<Receiver<GdbEvent>> {
        self.event_rx.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    fn write_command(&self, token: u64, command: &str) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().unwrap_or_else(|p| p.into_inner());
        let stdin = guard.as_mut().ok_or(TransportError::Disconnected)?;
        let full_command = format!("{}-{}\n", token, command);
        debug!("Sending command: {}", full_command.trim());
        stdin.write_all(full_command.as_bytes())?;
        stdin.flush()?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.process.lock().map(|p| p.is_some()).unwrap_or(false)
    }

    /// Ask GDB to exit, then make sure it is gone.
    pub fn stop(&self) -> Result<(), TransportError> {
        let process = self.process.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(mut process) = process {
            if let Some(stdin) = self.stdin.lock().unwrap_or_else(|p| p.into_inner()).as_mut() {
                let _ = stdin.write_all(b"-gdb-exit\n");
                let _ = stdin.flush();
            }

            thread::sleep(Duration::from_millis(500));

            let _ = process.kill();
            let _ = process.wait();
            *self.stdin.lock().unwrap_or_else(|p| p.into_inner()) = None;
            self.monitor.set_connected(false);

            if let Some(handle) = self.reader_handle.lock().unwrap_or_else(|p| p.into_inner()).take() {
                let _ = handle.join();
            }
            info!("GDB stopped");
        }
        Ok(())
    }
}

impl MiChannel for MiTransport {
    fn send_command(&self, command: &str) -> Result<MiResponse, TransportError> {
        if !self.monitor.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let token = self.token_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();

        // Registered before writing so a fast reply cannot be missed
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(token, PendingRequest {
                command: command.to_string(),
                reply: tx,
            });

        if let Err(e) = self.write_command(token, command) {
            self.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(&token);
            return Err(e);
        }

        let timeout = Duration::from_millis(self.config.timeout_ms);
        match rx.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                self.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(&token);
                warn!("Timeout waiting for reply to `{}`", command);
                Err(TransportError::Timeout(command.to_string()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn send_command_async(&self, command: &str) -> Result<(), TransportError> {
        if !self.monitor.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let token = self.token_counter.fetch_add(1, Ordering::SeqCst);
        self.write_command(token, command)
    }

    fn monitor(&self) -> Arc<InferiorMonitor> {
        Arc::clone(&self.monitor)
    }
}

impl Drop for MiTransport {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> (ReplyRouter, PendingMap, Receiver<GdbEvent>, Arc<InferiorMonitor>) {
        let pending: PendingMap = Arc::new(Mutex::new(BTreeMap::new()));
        let (tx, rx) = mpsc::channel();
        let monitor = Arc::new(InferiorMonitor::new());
        monitor.set_connected(true);
        let router = ReplyRouter::new(Arc::clone(&pending), tx, Arc::clone(&monitor));
        (router, pending, rx, monitor)
    }

    fn register(pending: &PendingMap, token: u64, command: &str) -> Receiver<Reply> {
        let (tx, rx) = mpsc::channel();
        pending.lock().unwrap().insert(token, PendingRequest {
            command: command.to_string(),
            reply: tx,
        });
        rx
    }

    #[test]
    fn test_tokened_reply_reaches_its_caller() {
        let (router, pending, _events, _) = router();
        let first = register(&pending, 5, "thread-info");
        let second = register(&pending, 6, "stack-list-frames");
        router.route_line(r#"6^done,stack=[]"#);
        router.route_line(r#"5^done,threads=[]"#);
        assert_eq!(second.try_recv().unwrap().unwrap().token, Some(6));
        assert!(first.try_recv().unwrap().unwrap().get("threads").is_some());
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_untokened_reply_goes_to_oldest() {
        let (router, pending, _events, _) = router();
        let older = register(&pending, 2, "exec-interrupt");
        let newer = register(&pending, 3, "thread-info");
        router.route_line("^done");
        assert!(older.try_recv().is_ok());
        assert!(newer.try_recv().is_err());
    }

    #[test]
    fn test_stop_updates_monitor_and_emits_event() {
        let (router, _pending, events, monitor) = router();
        router.route_line(r#"*running,thread-id="all""#);
        assert!(monitor.is_running());
        router.route_line(r#"*stopped,reason="breakpoint-hit",bkptno="3",thread-id="2",frame={addr="0x1",func="f",args=[]}"#);
        assert!(!monitor.is_running());
        assert_eq!(monitor.stop_count(), 1);
        assert_eq!(monitor.current_thread().as_deref(), Some("2"));
        assert!(matches!(events.try_recv().unwrap(), GdbEvent::Running { .. }));
        match events.try_recv().unwrap() {
            GdbEvent::Stopped { reason, breakpoint_id, sequence, .. } => {
                assert_eq!(reason, StopReason::BreakpointHit);
                assert_eq!(breakpoint_id, Some(3));
                assert_eq!(sequence, 1);
            }
            other => panic!("Expected stop, got {:?}", other),
        }
    }

    #[test]
    fn test_eof_fails_pending_and_disconnects() {
        let (router, pending, events, monitor) = router();
        let waiting = register(&pending, 9, "exec-continue");
        router.run(&b"=thread-created,id=\"1\",group-id=\"i1\"\n(gdb)"[..]);
        assert_eq!(waiting.try_recv().unwrap().unwrap_err(), TransportError::Disconnected);
        assert!(!monitor.is_connected());
        let all: Vec<GdbEvent> = events.try_iter().collect();
        assert!(matches!(all.first(), Some(GdbEvent::ThreadCreated { .. })));
        assert_eq!(all.last(), Some(&GdbEvent::Disconnected));
    }

    #[test]
    fn test_wait_for_stop_after_times_out() {
        let monitor = InferiorMonitor::new();
        monitor.set_connected(true);
        assert!(!monitor.wait_for_stop_after(0, Duration::from_millis(20)));
        monitor.mark_stopped(None);
        assert!(monitor.wait_for_stop_after(0, Duration::from_millis(20)));
    }

    #[test]
    fn test_send_without_process_is_disconnected() {
        let transport = MiTransport::new(GdbConfig::default());
        assert_eq!(
            transport.send_command("thread-info").unwrap_err(),
            TransportError::Disconnected
        );
    }
}
