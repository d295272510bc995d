//! Scripted stand-in for a GDB process, used by unit tests.

use crate::error::TransportError;
use crate::gdb::parser::MiParser;
use crate::gdb::transport::{InferiorMonitor, MiChannel};
use crate::gdb::types::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct Rule {
    prefix: String,
    reply: String,
    once: bool,
}

/// Answers commands by prefix and records everything it was sent. Exec
/// commands flip the shared [`InferiorMonitor`] the way the real reader would.
pub struct ScriptedGdb {
    rules: Mutex<Vec<Rule>>,
    sent: Mutex<Vec<String>>,
    monitor: Arc<InferiorMonitor>,
    parser: MiParser,
    ack_interrupts: AtomicBool,
}

impl ScriptedGdb {
    pub fn new() -> Arc<Self> {
        let monitor = Arc::new(InferiorMonitor::new());
        monitor.set_connected(true);
        Arc::new(Self {
            rules: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            monitor,
            parser: MiParser::new(),
            ack_interrupts: AtomicBool::new(true),
        })
    }

    /// Reply to every command starting with `prefix`. Later rules win.
    pub fn on(&self, prefix: &str, reply: &str) {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            reply: reply.to_string(),
            once: false,
        });
    }

    /// Reply to the next matching command only. Queued ahead of `on` rules.
    pub fn once(&self, prefix: &str, reply: &str) {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            reply: reply.to_string(),
            once: true,
        });
    }

    pub fn set_ack_interrupts(&self, ack: bool) {
        self.ack_interrupts.store(ack, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_matching(&self, prefix: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    fn record(&self, command: &str) {
        self.sent.lock().unwrap().push(command.to_string());
        let resumes = ["exec-continue", "exec-step", "exec-next", "exec-finish", "exec-run"];
        if resumes.iter().any(|p| command.starts_with(p)) {
            self.monitor.mark_running();
        } else if command.starts_with("exec-interrupt") && self.ack_interrupts.load(Ordering::SeqCst) {
            self.monitor.mark_stopped(None);
        }
    }

    fn reply_for(&self, command: &str) -> String {
        let mut rules = self.rules.lock().unwrap();
        if let Some(pos) = rules
            .iter()
            .position(|r| r.once && command.starts_with(&r.prefix))
        {
            return rules.remove(pos).reply;
        }
        rules
            .iter()
            .rev()
            .find(|r| !r.once && command.starts_with(&r.prefix))
            .map(|r| r.reply.clone())
            .unwrap_or_else(|| "^done".to_string())
    }
}

impl MiChannel for ScriptedGdb {
    fn send_command(&self, command: &str) -> Result<MiResponse, TransportError> {
        if !self.monitor.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.record(command);
        let raw = self.reply_for(command);
        match self.parser.parse_line(&raw)? {
            Some(MiOutputRecord::Result { token, class, results }) => Ok(MiResponse {
                token,
                class,
                results,
                raw,
            }),
            _ => Err(TransportError::Malformed(raw)),
        }
    }

    fn send_command_async(&self, command: &str) -> Result<(), TransportError> {
        if !self.monitor.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.record(command);
        Ok(())
    }

    fn monitor(&self) -> Arc<InferiorMonitor> {
        Arc::clone(&self.monitor)
    }
}
