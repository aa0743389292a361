//! In-memory MCP backends for integration tests

#![allow(dead_code)]

use op_mcp_hub::config::{HubConfig, ServerConfig, TransportConfig};
use op_mcp_hub::protocol::{
    text_content, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ToolDefinition, PROTOCOL_VERSION,
};
use op_mcp_hub::transport::{BackendTransport, Connector};
use op_mcp_hub::{HubError, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

pub fn tool(name: &str) -> ToolDefinition {
    ToolDefinition::new(name, &format!("{} tool", name), json!({ "type": "object" }))
}

pub fn tool_with_schema(name: &str, schema: Value) -> ToolDefinition {
    ToolDefinition::new(name, &format!("{} tool", name), schema)
}

/// A scripted backend server, shared by every transport opened to it
pub struct MockBackend {
    id: String,
    tools: Mutex<Vec<ToolDefinition>>,
    failing: AtomicBool,
    connect_calls: AtomicUsize,
    calls: Mutex<Vec<(String, Value)>>,
    live: Mutex<Vec<Arc<MockTransport>>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl MockBackend {
    fn new(id: &str, tools: Vec<ToolDefinition>) -> Self {
        Self {
            id: id.to_string(),
            tools: Mutex::new(tools),
            failing: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            live: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        }
    }

    /// Refuse every connect from now on
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Tools reported by transports opened from now on
    pub fn set_tools(&self, tools: Vec<ToolDefinition>) {
        *self.tools.lock() = tools;
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// `(raw tool name, arguments)` of every `tools/call` received
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    /// Kill every open transport, as if the server process died
    pub fn drop_connection(&self) {
        for transport in self.live.lock().drain(..) {
            transport.mark_closed();
        }
    }

    /// Hold the next connect open until the returned gate is notified.
    /// The held transport reports the tools scripted when the connect began.
    pub fn hold_next_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    /// Transports opened and not yet dropped through `drop_connection`
    pub fn transports_opened(&self) -> usize {
        self.live.lock().len()
    }

    pub fn open_transports(&self) -> usize {
        self.live
            .lock()
            .iter()
            .filter(|t| !*t.closed_tx.borrow())
            .count()
    }
}

/// Connector over a set of [`MockBackend`]s keyed by connection id
#[derive(Default)]
pub struct MockConnector {
    backends: Mutex<HashMap<String, Arc<MockBackend>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the backend reached through connection `id`
    pub fn backend(&self, id: &str, tools: Vec<ToolDefinition>) -> Arc<MockBackend> {
        let backend = Arc::new(MockBackend::new(id, tools));
        self.backends.lock().insert(id.to_string(), backend.clone());
        backend
    }

    pub fn get(&self, id: &str) -> Arc<MockBackend> {
        self.backends
            .lock()
            .get(id)
            .cloned()
            .unwrap_or_else(|| panic!("no mock backend scripted for '{}'", id))
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        connection_id: &str,
        _config: &TransportConfig,
    ) -> Result<Arc<dyn BackendTransport>> {
        let backend = self.backends.lock().get(connection_id).cloned();
        let Some(backend) = backend else {
            return Err(HubError::connection(connection_id, "no such backend"));
        };

        backend.connect_calls.fetch_add(1, Ordering::SeqCst);
        if backend.failing.load(Ordering::SeqCst) {
            return Err(HubError::connection(connection_id, "connection refused"));
        }

        let tools = backend.tools.lock().clone();
        let gate = backend.gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let (closed_tx, _) = watch::channel(false);
        let transport = Arc::new(MockTransport {
            backend: backend.clone(),
            tools,
            closed_tx,
        });
        backend.live.lock().push(transport.clone());
        Ok(transport)
    }
}

pub struct MockTransport {
    backend: Arc<MockBackend>,
    tools: Vec<ToolDefinition>,
    closed_tx: watch::Sender<bool>,
}

impl MockTransport {
    fn mark_closed(&self) {
        self.closed_tx.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn call_tool(&self, params: Option<Value>) -> Result<Value> {
        let params = params.unwrap_or(Value::Null);
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
        self.backend.calls.lock().push((name.clone(), arguments.clone()));

        match name.as_str() {
            "fail" => Ok(json!({
                "content": [text_content("tool failed")],
                "isError": true
            })),
            "crash" => {
                self.mark_closed();
                Err(HubError::transport("backend crashed"))
            }
            _ => Ok(json!({
                "content": [text_content(format!("{}:{} {}", self.backend.id, name, arguments))],
                "isError": false
            })),
        }
    }
}

#[async_trait::async_trait]
impl BackendTransport for MockTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        if self.is_closed() {
            return Err(HubError::transport("transport closed"));
        }

        let id = request.id.clone();
        let result = match request.method.as_str() {
            "initialize" => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": self.backend.id, "version": "0.0.1" }
            }),
            "tools/list" => json!({ "tools": self.tools }),
            "tools/call" => self.call_tool(request.params)?,
            other => {
                return Ok(JsonRpcResponse::error(
                    id,
                    JsonRpcError::method_not_found(other),
                ))
            }
        };
        Ok(JsonRpcResponse::success(id, result))
    }

    async fn notify(&self, _notification: JsonRpcRequest) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.mark_closed();
        Ok(())
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

/// Config with one (fake) stdio server per id
pub fn config_for(ids: &[&str]) -> op_mcp_hub::config::HubConfigBuilder {
    ids.iter().fold(HubConfig::builder(), |builder, id| {
        builder.server(id, ServerConfig::stdio("mock-mcp-server", vec![]))
    })
}

/// Poll until `check` holds, yielding to spawned tasks in between
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(check(), "condition not reached in time");
}
