//! JSON-RPC request handling over a [`Session`]

use crate::gdb::GdbConfig;
use crate::rpc::protocol::*;
use crate::session::{
    BreakpointId, BreakpointRequest, Condition, ConditionStyle, PassCount, PassCountStyle, Session,
    SessionEvent, StepKind, ThreadSummary,
};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

type Params = Option<Map<String, Value>>;

/// Dispatches JSON-RPC methods to the active debug session.
pub struct BridgeServer {
    config: GdbConfig,
    session: RwLock<Option<Arc<Session>>>,
    notifications: UnboundedSender<JsonRpcNotification>,
}

impl BridgeServer {
    /// The receiver yields one notification per session event.
    pub fn new(config: GdbConfig) -> (Self, UnboundedReceiver<JsonRpcNotification>) {
        let (notifications, receiver) = mpsc::unbounded_channel();
        let server = Self {
            config,
            session: RwLock::new(None),
            notifications,
        };
        (server, receiver)
    }

    /// Make `session` the active one and forward its events.
    pub async fn install(&self, session: Arc<Session>, events: UnboundedReceiver<SessionEvent>) -> Result<()> {
        let mut guard = self.session.write().await;
        if guard.is_some() {
            anyhow::bail!("GDB session already running. Use session/terminate first.");
        }
        self.spawn_forwarder(events)?;
        *guard = Some(session);
        Ok(())
    }

    fn spawn_forwarder(&self, mut events: UnboundedReceiver<SessionEvent>) -> Result<()> {
        let notifications = self.notifications.clone();
        thread::Builder::new()
            .name("session-events".to_string())
            .spawn(move || {
                while let Some(event) = events.blocking_recv() {
                    match JsonRpcNotification::session_event(&event) {
                        Ok(note) => {
                            if notifications.send(note).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to encode session event: {}", e),
                    }
                }
                debug!("Session event forwarder finished");
            })
            .context("failed to spawn session event forwarder")?;
        Ok(())
    }

    /// Terminate the active session, if any.
    pub async fn shutdown(&self) {
        if let Some(session) = self.session.write().await.take() {
            if let Err(e) = session.terminate() {
                warn!("Failed to terminate session: {}", e);
            }
        }
    }

    async fn session(&self) -> Result<Arc<Session>> {
        let guard = self.session.read().await;
        guard
            .as_ref()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("GDB session not started"))
    }

    /// Handle one request. `Ok(None)` means nothing is sent back.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Result<Option<JsonRpcResponse>> {
        let method = request.method.as_str();
        debug!("Handling method: {}", method);

        let params = match request.params {
            Some(Value::Object(map)) => Some(map),
            Some(Value::Null) | None => None,
            Some(_) => return Err(RpcFault::InvalidParams("params must be an object".to_string()).into()),
        };

        let result = match method {
            "ping" => Ok(json!({})),
            "session/start" => self.handle_start(params).await,
            "session/launch" => self.handle_launch(params).await,
            "session/attach" => self.handle_attach(params).await,
            "session/state" => self.handle_state().await,
            "session/terminate" => self.handle_terminate().await,
            "breakpoint/bind" => self.handle_bind(params).await,
            "breakpoint/setPassCount" => self.handle_set_pass_count(params).await,
            "breakpoint/setCondition" => self.handle_set_condition(params).await,
            "breakpoint/setHitCount" => self.handle_set_hit_count(params).await,
            "breakpoint/enable" => self.handle_enable(params).await,
            "breakpoint/delete" => self.handle_delete(params).await,
            "breakpoint/hitCount" => self.handle_hit_count(params).await,
            "breakpoint/state" => self.handle_breakpoint_state(params).await,
            "breakpoint/list" => self.handle_breakpoint_list().await,
            "threads/list" => self.handle_thread_list().await,
            "threads/frames" => self.handle_frames(params).await,
            "threads/select" => self.handle_thread_select(params).await,
            "evaluate" => self.handle_evaluate(params).await,
            "execution/continue" => self.handle_continue().await,
            "execution/step" => self.handle_step(params).await,
            "execution/break" => self.handle_break().await,
            _ => {
                warn!("Unknown method: {}", method);
                Err(RpcFault::MethodNotFound(method.to_string()).into())
            }
        }
        .with_context(|| method.to_string());

        match request.id {
            Some(id) => Ok(Some(JsonRpcResponse::new(id, result?))),
            None => {
                if let Err(e) = result {
                    warn!("Notification failed: {:#}", e);
                }
                Ok(None)
            }
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    async fn handle_start(&self, args: Params) -> Result<Value> {
        let mut config = self.config.clone();
        if let Some(path) = args.as_ref().and_then(|a| a.get("gdbPath")).and_then(|v| v.as_str()) {
            config.gdb_path = path.to_string();
        }
        if self.session.read().await.is_some() {
            anyhow::bail!("GDB session already running. Use session/terminate first.");
        }

        info!("Starting GDB session with: {}", config.gdb_path);
        let (session, events) = Session::start(config)?;
        self.install(Arc::clone(&session), events).await?;
        Ok(json!({ "state": session.state() }))
    }

    async fn handle_launch(&self, args: Params) -> Result<Value> {
        let program = optional_str(&args, "program");
        let program_args: Vec<String> = optional(&args, "args")?.unwrap_or_default();
        let session = self.session().await?;
        session.launch(program.as_deref(), &program_args)?;
        Ok(json!({ "state": session.state() }))
    }

    async fn handle_attach(&self, args: Params) -> Result<Value> {
        let pid: u32 = required(&args, "pid")?;
        let session = self.session().await?;
        session.attach(pid)?;
        Ok(json!({ "state": session.state() }))
    }

    async fn handle_state(&self) -> Result<Value> {
        let session = self.session().await?;
        Ok(json!({ "state": session.state() }))
    }

    async fn handle_terminate(&self) -> Result<Value> {
        let mut guard = self.session.write().await;
        let session = guard
            .take()
            .ok_or_else(|| anyhow::anyhow!("GDB session not started"))?;
        session.terminate()?;
        info!("GDB session terminated");
        Ok(json!({ "state": session.state() }))
    }

    // ========================================================================
    // Breakpoints
    // ========================================================================

    async fn handle_bind(&self, args: Params) -> Result<Value> {
        let request: BreakpointRequest =
            serde_json::from_value(Value::Object(args.unwrap_or_default()))?;
        let session = self.session().await?;
        let bound = session.breakpoints().bind_request(request)?;
        Ok(serde_json::to_value(bound)?)
    }

    async fn handle_set_pass_count(&self, args: Params) -> Result<Value> {
        let id: BreakpointId = required(&args, "id")?;
        let style: PassCountStyle = required(&args, "style")?;
        let threshold: u32 = optional(&args, "threshold")?.unwrap_or(0);
        let session = self.session().await?;
        session
            .breakpoints()
            .set_pass_count(id, PassCount::new(style, threshold))?;
        Ok(serde_json::to_value(session.breakpoints().get(id)?)?)
    }

    async fn handle_set_condition(&self, args: Params) -> Result<Value> {
        let id: BreakpointId = required(&args, "id")?;
        let style: ConditionStyle = required(&args, "style")?;
        let expression = optional_str(&args, "expression").unwrap_or_default();
        let session = self.session().await?;
        session
            .breakpoints()
            .set_condition(id, Condition { style, expression })?;
        Ok(serde_json::to_value(session.breakpoints().get(id)?)?)
    }

    async fn handle_set_hit_count(&self, args: Params) -> Result<Value> {
        let id: BreakpointId = required(&args, "id")?;
        let hits: u32 = required(&args, "hits")?;
        let session = self.session().await?;
        session.breakpoints().set_hit_count(id, hits)?;
        Ok(serde_json::to_value(session.breakpoints().get(id)?)?)
    }

    async fn handle_enable(&self, args: Params) -> Result<Value> {
        let id: BreakpointId = required(&args, "id")?;
        let enabled: bool = optional(&args, "enabled")?.unwrap_or(true);
        let session = self.session().await?;
        session.breakpoints().enable(id, enabled)?;
        Ok(json!({ "status": session.breakpoints().state(id) }))
    }

    async fn handle_delete(&self, args: Params) -> Result<Value> {
        let id: BreakpointId = required(&args, "id")?;
        let session = self.session().await?;
        session.breakpoints().delete(id)?;
        Ok(json!({ "status": session.breakpoints().state(id) }))
    }

    async fn handle_hit_count(&self, args: Params) -> Result<Value> {
        let id: BreakpointId = required(&args, "id")?;
        let session = self.session().await?;
        Ok(json!({ "hitCount": session.breakpoints().hit_count(id)? }))
    }

    async fn handle_breakpoint_state(&self, args: Params) -> Result<Value> {
        let id: BreakpointId = required(&args, "id")?;
        let session = self.session().await?;
        Ok(json!({ "status": session.breakpoints().state(id) }))
    }

    async fn handle_breakpoint_list(&self) -> Result<Value> {
        let session = self.session().await?;
        Ok(json!({ "breakpoints": session.breakpoints().list() }))
    }

    // ========================================================================
    // Threads, frames and evaluation
    // ========================================================================

    async fn handle_thread_list(&self) -> Result<Value> {
        let session = self.session().await?;
        let Some((threads, current)) = session.threads().refresh_threads()? else {
            return Ok(json!({ "threads": [], "currentIndex": null }));
        };
        let threads: Vec<ThreadSummary> = threads.iter().map(|t| t.summary()).collect();
        Ok(json!({
            "threads": threads,
            "currentIndex": current,
            "currentThreadId": session.threads().current_thread(),
        }))
    }

    async fn handle_frames(&self, args: Params) -> Result<Value> {
        let thread_id = required_str(&args, "threadId")?;
        let flags: u32 = optional(&args, "flags")?.unwrap_or(1);
        let session = self.session().await?;
        let frames = session.threads().get_frames(&thread_id, flags)?;
        Ok(json!({ "frames": frames }))
    }

    async fn handle_thread_select(&self, args: Params) -> Result<Value> {
        let thread_id = required_str(&args, "threadId")?;
        let session = self.session().await?;
        session.threads().set_current_thread(&thread_id)?;
        Ok(json!({ "currentThreadId": thread_id }))
    }

    async fn handle_evaluate(&self, args: Params) -> Result<Value> {
        let expression = required_str(&args, "expression")?;
        let thread_id = optional_str(&args, "threadId");
        let level: u32 = optional(&args, "level")?.unwrap_or(0);
        let session = self.session().await?;
        let variable = session.evaluate(&expression, thread_id.as_deref(), level)?;
        Ok(serde_json::to_value(variable)?)
    }

    // ========================================================================
    // Execution control
    // ========================================================================

    async fn handle_continue(&self) -> Result<Value> {
        let session = self.session().await?;
        let resumed = session.continue_execution()?;
        Ok(json!({ "resumed": resumed, "state": session.state() }))
    }

    async fn handle_step(&self, args: Params) -> Result<Value> {
        let kind: StepKind = optional(&args, "kind")?.unwrap_or(StepKind::Over);
        let thread_id = optional_str(&args, "threadId");
        let session = self.session().await?;
        session.step(kind, thread_id.as_deref())?;
        Ok(json!({ "state": session.state() }))
    }

    async fn handle_break(&self) -> Result<Value> {
        let session = self.session().await?;
        let outcome = session.break_all()?;
        Ok(json!({ "outcome": outcome, "state": session.state() }))
    }
}

fn optional<T: DeserializeOwned>(args: &Params, key: &str) -> Result<Option<T>> {
    match args.as_ref().and_then(|a| a.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| RpcFault::InvalidParams(format!("{}: {}", key, e)).into()),
    }
}

fn required<T: DeserializeOwned>(args: &Params, key: &str) -> Result<T> {
    optional(args, key)?.ok_or_else(|| RpcFault::InvalidParams(format!("{} is required", key)).into())
}

fn optional_str(args: &Params, key: &str) -> Option<String> {
    args.as_ref()
        .and_then(|a| a.get(key))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn required_str(args: &Params, key: &str) -> Result<String> {
    optional_str(args, key).ok_or_else(|| RpcFault::InvalidParams(format!("{} is required", key)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdb::testing::ScriptedGdb;
    use crate::gdb::GdbEvent;
    use std::time::Duration;
    use tokio_test::block_on;

    fn request(id: i64, method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(RequestId::Number(id)),
            method: method.to_string(),
            params: Some(params),
        }
    }

    fn call(server: &BridgeServer, method: &str, params: Value) -> Result<Value> {
        let response = block_on(server.handle_request(request(1, method, params)))?;
        Ok(response.map(|r| r.result).unwrap_or(Value::Null))
    }

    fn server_with_session() -> (
        Arc<ScriptedGdb>,
        Arc<Session>,
        BridgeServer,
        UnboundedReceiver<JsonRpcNotification>,
    ) {
        let gdb = ScriptedGdb::new();
        gdb.on("exec-", "^running");
        gdb.on("exec-interrupt", "^done");
        gdb.on("exec-arguments", "^done");
        gdb.on(
            "break-insert",
            r#"^done,bkpt={number="1",type="breakpoint",disp="keep",enabled="y",addr="0x401136",func="main",file="m.c",fullname="/w/m.c",line="9",times="0"}"#,
        );
        let config = GdbConfig::default();
        let (session, events) = Session::new(gdb.clone(), &config);
        let (server, notes) = BridgeServer::new(config);
        block_on(server.install(Arc::clone(&session), events)).unwrap();
        (gdb, session, server, notes)
    }

    #[test]
    fn test_requires_session() {
        let (server, _notes) = BridgeServer::new(GdbConfig::default());
        let err = call(&server, "session/state", json!({})).unwrap_err();
        assert!(format!("{:#}", err).contains("GDB session not started"));
        assert_eq!(JsonRpcError::from_handler_error(&err).code, -32603);
    }

    #[test]
    fn test_unknown_method() {
        let (server, _notes) = BridgeServer::new(GdbConfig::default());
        let err = call(&server, "gdb/raw", json!({})).unwrap_err();
        assert_eq!(JsonRpcError::from_handler_error(&err).code, -32601);
    }

    #[test]
    fn test_notification_gets_no_response() {
        let (_gdb, _session, server, _notes) = server_with_session();
        let mut req = request(1, "session/state", json!({}));
        req.id = None;
        assert!(block_on(server.handle_request(req)).unwrap().is_none());
    }

    #[test]
    fn test_launch_bind_and_pass_count() {
        let (gdb, session, server, _notes) = server_with_session();
        let result = call(&server, "session/launch", json!({"program": "/w/a.out"})).unwrap();
        assert_eq!(result["state"], "run");
        assert_eq!(session.state(), crate::session::RunState::Run);

        let bound = call(
            &server,
            "breakpoint/bind",
            json!({"location": {"kind": "file-line", "file": "/w/m.c", "line": 9}}),
        )
        .unwrap();
        assert_eq!(bound["gdb_id"], 1);
        let id = bound["id"].as_u64().unwrap();

        gdb.clear_sent();
        let updated = call(
            &server,
            "breakpoint/setPassCount",
            json!({"id": id, "style": "modulo", "threshold": 3}),
        )
        .unwrap();
        assert_eq!(updated["pass_count"]["style"], "modulo");
        assert_eq!(gdb.sent_matching("break-after"), vec!["break-after 1 2".to_string()]);

        let hits = call(&server, "breakpoint/hitCount", json!({"id": id})).unwrap();
        assert_eq!(hits["hitCount"], 0);
        let list = call(&server, "breakpoint/list", json!({})).unwrap();
        assert_eq!(list["breakpoints"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn test_invalid_params() {
        let (_gdb, _session, server, _notes) = server_with_session();
        let err = call(&server, "breakpoint/setPassCount", json!({"style": "modulo"})).unwrap_err();
        let rpc = JsonRpcError::from_handler_error(&err);
        assert_eq!(rpc.code, -32602);
        assert_eq!(rpc.message, "id is required");

        let err = call(&server, "breakpoint/setPassCount", json!({"id": 1, "style": "sometimes"})).unwrap_err();
        assert_eq!(JsonRpcError::from_handler_error(&err).code, -32602);
    }

    #[test]
    fn test_continue_outside_break_fails() {
        let (_gdb, _session, server, _notes) = server_with_session();
        let err = call(&server, "execution/continue", json!({})).unwrap_err();
        assert!(format!("{:#}", err).contains("not valid in state"));
    }

    #[test]
    fn test_session_events_become_notifications() {
        let (_gdb, session, _server, mut notes) = server_with_session();
        let (gdb_events, receiver) = std::sync::mpsc::channel();
        let pump = session.spawn_pump(receiver).unwrap();
        gdb_events
            .send(GdbEvent::ThreadCreated {
                id: "2".to_string(),
                group_id: "i1".to_string(),
            })
            .unwrap();
        gdb_events.send(GdbEvent::Disconnected).unwrap();
        pump.join().unwrap();

        let first = block_on(async { tokio::time::timeout(Duration::from_secs(5), notes.recv()).await })
            .ok()
            .flatten()
            .unwrap();
        assert_eq!(first.method, "session/event");
        assert_eq!(first.params.unwrap()["event"], "threadStarted");
    }

    #[test]
    fn test_terminate_releases_session() {
        let (gdb, session, server, _notes) = server_with_session();
        call(&server, "session/launch", json!({})).unwrap();
        let result = call(&server, "session/terminate", json!({})).unwrap();
        assert_eq!(result["state"], "done");
        assert_eq!(session.state(), crate::session::RunState::Done);
        assert_eq!(gdb.sent_matching("exec-interrupt").len(), 1);
        assert!(call(&server, "session/state", json!({})).is_err());
    }
}
