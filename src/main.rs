//! GDB Session Bridge
//!
//! Line-delimited JSON-RPC 2.0 front end: requests arrive on stdin,
//! responses and `session/event` notifications leave on stdout. Logs go to
//! stderr (`RUST_LOG`, default `info`).
//!
//! Environment:
//!   GDB_BRIDGE_GDB                   gdb executable (default `gdb`)
//!   GDB_BRIDGE_TIMEOUT_MS            MI command timeout
//!   GDB_BRIDGE_INTERRUPT_TIMEOUT_MS  wait per interrupt attempt

use anyhow::Result;
use gdb_session_bridge::gdb::GdbConfig;
use gdb_session_bridge::rpc::protocol::*;
use gdb_session_bridge::rpc::BridgeServer;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting GDB session bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = GdbConfig::from_env();
    let (server, mut notifications) = BridgeServer::new(config);

    // Single writer so responses and notifications never interleave mid-line
    let (out, mut lines) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = lines.recv().await {
            debug!("Sending: {}", line);
            if let Err(e) = write_line(&mut stdout, &line).await {
                error!("Error writing to stdout: {}", e);
                break;
            }
        }
    });

    let note_out = out.clone();
    tokio::spawn(async move {
        while let Some(note) = notifications.recv().await {
            send(&note_out, &note);
        }
    });

    let mut reader = BufReader::new(tokio::io::stdin()).lines();
    info!("GDB session bridge ready, listening on stdin");

    loop {
        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Error reading from stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        debug!("Received: {}", line);

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                send(&out, &JsonRpcErrorResponse::new(None, JsonRpcError::parse_error()));
                continue;
            }
        };
        if request.jsonrpc != "2.0" {
            send(
                &out,
                &JsonRpcErrorResponse::new(request.id.clone(), JsonRpcError::invalid_request()),
            );
            continue;
        }

        let id = request.id.clone();
        match server.handle_request(request).await {
            Ok(Some(resp)) => send(&out, &resp),
            Ok(None) => {
                // Notification, no response needed
            }
            Err(e) => {
                error!("Error handling request: {:#}", e);
                send(&out, &JsonRpcErrorResponse::new(id, JsonRpcError::from_handler_error(&e)));
            }
        }
    }

    info!("GDB session bridge shutting down");
    server.shutdown().await;
    drop(out);
    drop(server);
    // Bounded wait: the session may still hold a notification sender
    if tokio::time::timeout(Duration::from_secs(2), writer).await.is_err() {
        warn!("Timed out flushing output");
    }
    Ok(())
}

fn send<T: Serialize>(out: &UnboundedSender<String>, message: &T) {
    match serde_json::to_string(message) {
        Ok(line) => {
            if out.send(line).is_err() {
                warn!("Output closed, dropping message");
            }
        }
        Err(e) => error!("Failed to encode message: {}", e),
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
