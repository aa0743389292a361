//! MCP client for one upstream server
//!
//! Wraps an open [`BackendTransport`] and speaks the handshake, tool
//! discovery and tool invocation parts of MCP over it.

use crate::error::{HubError, Result};
use crate::protocol::{initialize_params, JsonRpcRequest, ToolDefinition};
use crate::transport::BackendTransport;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

// Upper bound on `tools/list` pages, in case a server keeps handing out cursors.
const MAX_TOOL_PAGES: usize = 64;

/// Client for communicating with an upstream MCP server
pub struct BackendClient {
    connection_id: String,
    transport: Arc<dyn BackendTransport>,
}

impl BackendClient {
    pub fn new(connection_id: &str, transport: Arc<dyn BackendTransport>) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            transport,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Run the MCP handshake: `initialize`, then `notifications/initialized`.
    /// Returns the server's `initialize` result.
    pub async fn initialize(&self) -> Result<Value> {
        let result = self.rpc("initialize", Some(initialize_params())).await?;

        if let Some(version) = result.get("protocolVersion").and_then(Value::as_str) {
            debug!(connection_id = %self.connection_id, protocol_version = %version, "Server accepted initialize");
        }

        self.transport
            .notify(JsonRpcRequest::notification("notifications/initialized"))
            .await?;

        let server_name = result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(connection_id = %self.connection_id, server = %server_name, "MCP handshake complete");
        Ok(result)
    }

    /// List every tool the server offers, following `nextCursor`
    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.rpc("tools/list", params).await?;

            let page: Vec<ToolDefinition> = match result.get("tools") {
                Some(list) => serde_json::from_value(list.clone()).map_err(|e| {
                    HubError::protocol(format!("Invalid tools/list result: {}", e))
                })?,
                None => Vec::new(),
            };
            tools.extend(page);

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(String::from);
            if cursor.is_none() {
                debug!(connection_id = %self.connection_id, count = tools.len(), "Listed tools");
                return Ok(tools);
            }
        }

        warn!(
            connection_id = %self.connection_id,
            "tools/list still paginating after {} pages, keeping what was received",
            MAX_TOOL_PAGES
        );
        Ok(tools)
    }

    /// Invoke a tool by its raw (backend) name. Returns the MCP call result
    /// (`content`, `isError`) untouched.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        debug!(connection_id = %self.connection_id, tool = %name, "Calling tool");
        self.rpc(
            "tools/call",
            Some(json!({
                "name": name,
                "arguments": arguments
            })),
        )
        .await
    }

    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }

    pub fn closed(&self) -> watch::Receiver<bool> {
        self.transport.closed()
    }

    async fn rpc(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let response = self
            .transport
            .request(JsonRpcRequest::call(method, params))
            .await?;

        if let Some(error) = response.error {
            return Err(HubError::protocol(format!(
                "{} failed: {} (code {})",
                method, error.message, error.code
            )));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcError, JsonRpcResponse};
    use parking_lot::Mutex;

    /// Answers from a fixed script and records every message it sees
    struct ScriptedTransport {
        seen: Mutex<Vec<String>>,
        closed: watch::Sender<bool>,
    }

    impl ScriptedTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                closed: watch::channel(false).0,
            })
        }
    }

    #[async_trait::async_trait]
    impl BackendTransport for ScriptedTransport {
        async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
            self.seen.lock().push(request.method.clone());
            let cursor = request
                .params
                .as_ref()
                .and_then(|p| p.get("cursor"))
                .and_then(Value::as_str);

            let result = match (request.method.as_str(), cursor) {
                ("initialize", _) => json!({ "serverInfo": { "name": "scripted" } }),
                ("tools/list", None) => json!({ "tools": [{ "name": "a" }], "nextCursor": "p2" }),
                ("tools/list", Some("p2")) => json!({ "tools": [{ "name": "b" }] }),
                ("tools/call", _) => {
                    return Ok(JsonRpcResponse::error(
                        request.id,
                        JsonRpcError::invalid_params("bad arguments"),
                    ))
                }
                _ => json!({}),
            };
            Ok(JsonRpcResponse::success(request.id, result))
        }

        async fn notify(&self, notification: JsonRpcRequest) -> Result<()> {
            self.seen.lock().push(notification.method);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closed.send_replace(true);
            Ok(())
        }

        fn closed(&self) -> watch::Receiver<bool> {
            self.closed.subscribe()
        }
    }

    #[tokio::test]
    async fn test_handshake_sends_initialized_notification() {
        let transport = ScriptedTransport::new();
        let client = BackendClient::new("a", transport.clone());

        let info = client.initialize().await.unwrap();
        assert_eq!(info["serverInfo"]["name"], "scripted");
        assert_eq!(
            *transport.seen.lock(),
            vec!["initialize".to_string(), "notifications/initialized".to_string()]
        );
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let client = BackendClient::new("a", ScriptedTransport::new());
        let tools = client.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_rpc_error_becomes_protocol_error() {
        let client = BackendClient::new("a", ScriptedTransport::new());
        let err = client.call_tool("a", json!({})).await.unwrap_err();
        assert!(matches!(err, HubError::Protocol(_)));
        assert!(err.to_string().contains("bad arguments"));
    }

    #[tokio::test]
    async fn test_close_signals_closed() {
        let client = BackendClient::new("a", ScriptedTransport::new());
        client.close().await.unwrap();
        assert!(*client.closed().borrow());
    }
}
