//! GDB Machine Interface (MI) Type Definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// GDB/MI result class types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

impl fmt::Display for ResultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultClass::Done => "done",
            ResultClass::Running => "running",
            ResultClass::Connected => "connected",
            ResultClass::Error => "error",
            ResultClass::Exit => "exit",
        };
        f.write_str(s)
    }
}

/// GDB/MI async class types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AsyncClass {
    Stopped,
    Running,
}

/// GDB/MI notification types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationClass {
    BreakpointCreated,
    BreakpointModified,
    BreakpointDeleted,
    ThreadGroupAdded,
    ThreadGroupStarted,
    ThreadGroupExited,
    ThreadCreated,
    ThreadSelected,
    ThreadExited,
    LibraryLoaded,
    LibraryUnloaded,
    Other(String),
}

impl From<&str> for NotificationClass {
    fn from(s: &str) -> Self {
        match s {
            "breakpoint-created" => NotificationClass::BreakpointCreated,
            "breakpoint-modified" => NotificationClass::BreakpointModified,
            "breakpoint-deleted" => NotificationClass::BreakpointDeleted,
            "thread-group-added" => NotificationClass::ThreadGroupAdded,
            "thread-group-started" => NotificationClass::ThreadGroupStarted,
            "thread-group-exited" => NotificationClass::ThreadGroupExited,
            "thread-created" => NotificationClass::ThreadCreated,
            "thread-selected" => NotificationClass::ThreadSelected,
            "thread-exited" => NotificationClass::ThreadExited,
            "library-loaded" => NotificationClass::LibraryLoaded,
            "library-unloaded" => NotificationClass::LibraryUnloaded,
            other => NotificationClass::Other(other.to_string()),
        }
    }
}

/// Stop reason types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    BreakpointHit,
    FunctionFinished,
    LocationReached,
    EndSteppingRange,
    ExitedSignalled,
    Exited,
    ExitedNormally,
    SignalReceived,
    Unknown(String),
}

impl From<String> for StopReason {
    fn from(s: String) -> Self {
        match s.as_str() {
            "breakpoint-hit" => StopReason::BreakpointHit,
            "function-finished" => StopReason::FunctionFinished,
            "location-reached" => StopReason::LocationReached,
            "end-stepping-range" => StopReason::EndSteppingRange,
            "exited-signalled" => StopReason::ExitedSignalled,
            "exited" => StopReason::Exited,
            "exited-normally" => StopReason::ExitedNormally,
            "signal-received" => StopReason::SignalReceived,
            _ => StopReason::Unknown(s),
        }
    }
}

impl StopReason {
    /// True for the reasons GDB reports when the inferior is gone.
    pub fn is_exit(&self) -> bool {
        matches!(
            self,
            StopReason::Exited | StopReason::ExitedNormally | StopReason::ExitedSignalled
        )
    }
}

/// GDB/MI value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MiValue {
    String(String),
    List(Vec<MiValue>),
    Tuple(MiTuple),
    None,
}

pub type MiTuple = std::collections::HashMap<String, MiValue>;

impl MiValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MiValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&MiTuple> {
        match self {
            MiValue::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<MiValue>> {
        match self {
            MiValue::List(l) => Some(l),
            _ => None,
        }
    }
}

/// GDB/MI output record
#[derive(Debug, Clone)]
pub enum MiOutputRecord {
    Result {
        token: Option<u64>,
        class: ResultClass,
        results: Vec<MiResult>,
    },
    Async {
        token: Option<u64>,
        class: AsyncClass,
        results: Vec<MiResult>,
    },
    /// `+` status records (download progress and the like).
    Status {
        class: String,
        results: Vec<MiResult>,
    },
    Notification {
        class: NotificationClass,
        results: Vec<MiResult>,
    },
    Console(String),
    Target(String),
    Log(String),
}

/// GDB/MI result (variable=value pair)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiResult {
    pub variable: String,
    pub value: MiValue,
}

/// Find the first result named `key`.
pub fn find_result<'a>(results: &'a [MiResult], key: &str) -> Option<&'a MiValue> {
    results.iter().find(|r| r.variable == key).map(|r| &r.value)
}

/// Find the first result named `key` holding a plain string.
pub fn find_string(results: &[MiResult], key: &str) -> Option<String> {
    find_result(results, key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// A correlated reply to one command.
#[derive(Debug, Clone)]
pub struct MiResponse {
    pub token: Option<u64>,
    pub class: ResultClass,
    pub results: Vec<MiResult>,
    /// The reply line as GDB printed it.
    pub raw: String,
}

impl MiResponse {
    pub fn is_error(&self) -> bool {
        self.class == ResultClass::Error
    }

    pub fn get(&self, key: &str) -> Option<&MiValue> {
        find_result(&self.results, key)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        find_string(&self.results, key)
    }

    /// The `msg` GDB attaches to `^error`.
    pub fn error_message(&self) -> Option<String> {
        if self.is_error() {
            Some(
                self.get_string("msg")
                    .unwrap_or_else(|| "Unknown error".to_string()),
            )
        } else {
            None
        }
    }
}

/// Breakpoint record as GDB reports it (`bkpt={...}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub number: String,
    #[serde(rename = "type")]
    pub breakpoint_type: String,
    pub enabled: bool,
    #[serde(default)]
    pub addr: Option<String>,
    #[serde(default)]
    pub func: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub fullname: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub times: u32,
    #[serde(default)]
    pub original_location: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub ignore_count: Option<u32>,
}

impl Breakpoint {
    /// GDB leaves unresolved locations as `<PENDING>`.
    pub fn is_pending(&self) -> bool {
        self.addr.as_deref() == Some("<PENDING>")
    }

    pub fn id(&self) -> Option<u32> {
        self.number.parse().ok()
    }
}

/// Frame information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub level: u32,
    pub addr: String,
    #[serde(default)]
    pub func: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub fullname: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

/// Thread information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub target_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub frame: Option<Frame>,
    pub state: ThreadState,
    #[serde(default)]
    pub core: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadState {
    Stopped,
    Running,
}

/// Variable information from `-stack-list-variables`, `-var-create` or
/// `-var-list-children`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub exp: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub var_type: Option<String>,
    #[serde(default)]
    pub numchild: u32,
    #[serde(default)]
    pub is_arg: bool,
}

/// State the transport reader keeps about the inferior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GdbSessionState {
    pub connected: bool,
    pub running: bool,
    pub current_thread: Option<String>,
    /// Number of `*stopped` records seen so far.
    pub stop_count: u64,
}

/// GDB event types
#[derive(Debug, Clone, PartialEq)]
pub enum GdbEvent {
    Stopped {
        reason: StopReason,
        frame: Option<Frame>,
        thread_id: Option<String>,
        breakpoint_id: Option<u32>,
        signal_name: Option<String>,
        /// Position of this stop in the reader's stop sequence.
        sequence: u64,
    },
    Running {
        thread_id: Option<String>,
    },
    BreakpointModified {
        breakpoint: Breakpoint,
    },
    BreakpointDeleted {
        number: String,
    },
    ThreadCreated {
        id: String,
        group_id: String,
    },
    ThreadExited {
        id: String,
        group_id: String,
    },
    ThreadSelected {
        id: String,
    },
    Exited {
        exit_code: Option<String>,
    },
    Output {
        channel: OutputChannel,
        content: String,
    },
    /// The GDB process went away. Always the last event.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputChannel {
    Console,
    Target,
    Log,
}

/// GDB configuration
#[derive(Debug, Clone)]
pub struct GdbConfig {
    pub gdb_path: String,
    pub gdb_args: Vec<String>,
    pub timeout_ms: u64,
    /// How long `cause_break` waits for each interrupt to be acknowledged.
    pub interrupt_timeout_ms: u64,
    pub interrupt_attempts: u32,
    pub max_stack_frames: usize,
    pub max_children: usize,
    pub thread_group: String,
}

impl Default for GdbConfig {
    fn default() -> Self {
        Self {
            gdb_path: "gdb".to_string(),
            gdb_args: vec!["--interpreter=mi2".to_string()],
            timeout_ms: 30000,
            interrupt_timeout_ms: 1000,
            interrupt_attempts: 5,
            max_stack_frames: 30,
            max_children: 50,
            thread_group: "i1".to_string(),
        }
    }
}

impl GdbConfig {
    /// Defaults overridden by `GDB_BRIDGE_GDB`, `GDB_BRIDGE_TIMEOUT_MS` and
    /// `GDB_BRIDGE_INTERRUPT_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(path) = lookup("GDB_BRIDGE_GDB").filter(|p| !p.is_empty()) {
            config.gdb_path = path;
        }
        if let Some(ms) = lookup("GDB_BRIDGE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.timeout_ms = ms;
        }
        if let Some(ms) = lookup("GDB_BRIDGE_INTERRUPT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.interrupt_timeout_ms = ms;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("GDB_BRIDGE_GDB", "/opt/ntox86-gdb"),
            ("GDB_BRIDGE_INTERRUPT_TIMEOUT_MS", "250"),
            ("GDB_BRIDGE_TIMEOUT_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config = GdbConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.gdb_path, "/opt/ntox86-gdb");
        assert_eq!(config.interrupt_timeout_ms, 250);
        assert_eq!(config.timeout_ms, 30000);
        assert_eq!(config.max_stack_frames, 30);
    }

    #[test]
    fn test_response_error_message() {
        let response = MiResponse {
            token: Some(4),
            class: ResultClass::Error,
            results: vec![MiResult {
                variable: "msg".to_string(),
                value: MiValue::String("No symbol \"x\" in current context.".to_string()),
            }],
            raw: String::new(),
        };
        assert!(response.is_error());
        assert_eq!(
            response.error_message().as_deref(),
            Some("No symbol \"x\" in current context.")
        );
    }
}
