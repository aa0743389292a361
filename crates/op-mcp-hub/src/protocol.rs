//! MCP Protocol Types
//!
//! JSON-RPC 2.0 message types shared by the upstream clients and the
//! group endpoints.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// MCP protocol version spoken by the hub, both upstream and downstream.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Name reported in `clientInfo` / `serverInfo`.
pub const HUB_NAME: &str = "op-mcp-hub";

pub const HUB_VERSION: &str = env!("CARGO_PKG_VERSION");

// Server-defined JSON-RPC error code for access-control failures.
pub const ACCESS_DENIED_CODE: i32 = -32001;

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params: None,
        }
    }

    /// Request with a process-unique numeric id.
    pub fn call(method: impl Into<String>, params: Option<Value>) -> Self {
        static REQUEST_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(REQUEST_ID.fetch_add(1, Ordering::SeqCst))),
            method: method.into(),
            params,
        }
    }

    /// Notification (no id, no response expected).
    pub fn notification(method: impl Into<String>) -> Self {
        Self::new(method)
    }

    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(msg: impl Into<String>) -> Self {
        Self::new(-32700, msg)
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::new(-32600, msg)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(-32601, format!("Method not found: {}", method))
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::new(-32602, msg)
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::new(-32603, msg)
    }
}

/// Tool definition as reported by an MCP server in `tools/list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    json!({ "type": "object" })
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            input_schema,
        }
    }
}

/// Parameters of `initialize` sent to upstream servers.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": HUB_NAME,
            "version": HUB_VERSION
        }
    })
}

/// Result body a hub endpoint returns for `initialize`.
pub fn initialize_result(server_name: &str, instructions: Option<&str>) -> Value {
    let mut result = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": { "listChanged": false }
        },
        "serverInfo": {
            "name": server_name,
            "version": HUB_VERSION
        }
    });
    if let Some(text) = instructions {
        result["instructions"] = json!(text);
    }
    result
}

/// MCP text content block.
pub fn text_content(text: impl Into<String>) -> Value {
    json!({ "type": "text", "text": text.into() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = JsonRpcRequest::call("tools/list", None);
        let b = JsonRpcRequest::call("tools/list", None);
        assert_ne!(a.id, b.id);
        assert!(!a.is_notification());
    }

    #[test]
    fn test_notification_has_no_id() {
        let n = JsonRpcRequest::notification("notifications/initialized");
        let text = serde_json::to_string(&n).unwrap();
        assert!(!text.contains("\"id\""));
        assert!(n.is_notification());
    }

    #[test]
    fn test_tool_definition_defaults_schema() {
        let tool: ToolDefinition = serde_json::from_value(json!({ "name": "echo" })).unwrap();
        assert_eq!(tool.input_schema, json!({ "type": "object" }));
        assert!(tool.description.is_none());
    }

    #[test]
    fn test_response_error() {
        let resp = JsonRpcResponse::error(Some(json!(1)), JsonRpcError::method_not_found("nope"));
        assert!(!resp.is_success());
        assert_eq!(resp.error.unwrap().code, -32601);
    }
}
