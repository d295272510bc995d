//! JSON-RPC 2.0 types for the line-delimited front end

use crate::session::SessionEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// JSON-RPC 2.0 Base Types
// ============================================================================

/// JSON-RPC 2.0 Request. A missing `id` makes it a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 Response (success)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: serde_json::Value,
}

impl JsonRpcResponse {
    pub fn new(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result,
        }
    }
}

/// JSON-RPC 2.0 Error Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    pub error: JsonRpcError,
}

impl JsonRpcErrorResponse {
    pub fn new(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            error,
        }
    }
}

/// JSON-RPC 2.0 Error Object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn parse_error() -> Self {
        Self {
            code: -32700,
            message: "Parse error".to_string(),
            data: None,
        }
    }

    pub fn invalid_request() -> Self {
        Self {
            code: -32600,
            message: "Invalid request".to_string(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {}", method),
            data: None,
        }
    }

    pub fn invalid_params(message: &str) -> Self {
        Self {
            code: -32602,
            message: message.to_string(),
            data: None,
        }
    }

    pub fn internal_error(message: &str) -> Self {
        Self {
            code: -32603,
            message: message.to_string(),
            data: None,
        }
    }

    /// Map a handler failure to an error object, keeping the protocol
    /// level codes for the errors that have one.
    pub fn from_handler_error(error: &anyhow::Error) -> Self {
        if let Some(RpcFault::MethodNotFound(method)) = error.downcast_ref::<RpcFault>() {
            return Self::method_not_found(method);
        }
        if let Some(RpcFault::InvalidParams(message)) = error.downcast_ref::<RpcFault>() {
            return Self::invalid_params(message);
        }
        if error.downcast_ref::<serde_json::Error>().is_some() {
            return Self::invalid_params(&error.to_string());
        }
        Self::internal_error(&format!("{:#}", error))
    }
}

/// Request-level failures with a dedicated JSON-RPC code.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcFault {
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("{0}")]
    InvalidParams(String),
}

/// Request ID type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

// ============================================================================
// Notification Types
// ============================================================================

/// Server-to-client notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn session_event(event: &SessionEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            jsonrpc: "2.0".to_string(),
            method: "session/event".to_string(),
            params: Some(serde_json::to_value(event)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_without_id_is_notification() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"session/state"}"#).unwrap();
        assert!(req.id.is_none());
        assert!(req.params.is_none());

        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"method":"evaluate","params":{"expression":"x"}}"#)
                .unwrap();
        assert_eq!(req.id, Some(RequestId::Number(7)));
    }

    #[test]
    fn test_error_codes_from_handler_errors() {
        let err = anyhow::Error::new(RpcFault::MethodNotFound("nope".to_string()));
        assert_eq!(JsonRpcError::from_handler_error(&err).code, -32601);

        let err = anyhow::Error::new(RpcFault::InvalidParams("id is required".to_string()));
        let rpc = JsonRpcError::from_handler_error(&err);
        assert_eq!(rpc.code, -32602);
        assert_eq!(rpc.message, "id is required");

        let err = anyhow::anyhow!("gdb went away").context("execution/continue");
        let rpc = JsonRpcError::from_handler_error(&err);
        assert_eq!(rpc.code, -32603);
        assert_eq!(rpc.message, "execution/continue: gdb went away");
    }

    #[test]
    fn test_session_event_notification_shape() {
        let note = JsonRpcNotification::session_event(&SessionEvent::ThreadStarted { id: "2".to_string() }).unwrap();
        let value = serde_json::to_value(&note).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "method": "session/event",
                "params": {"event": "threadStarted", "id": "2"}
            })
        );
    }
}
