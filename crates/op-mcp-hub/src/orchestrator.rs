//! Hub orchestrator - ties together the connection manager and tool catalog
//!
//! This is the primary interface for the hub. Group endpoints, status jobs
//! and the admin surface all go through it.

use crate::catalog::{parse_qualified, ToolCatalog, ToolDescriptor, ToolFilter};
use crate::config::{HubConfig, TransportConfig};
use crate::connection::{Connection, PoolStats, ReconnectPolicy};
use crate::error::{HubError, Result};
use crate::manager::ConnectionManager;
use crate::protocol::text_content;
use crate::transport::Connector;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Summary returned by [`HubOrchestrator::initialize_from_config`]
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    pub attempted: usize,
    pub connected: usize,
    /// `(connection id, reason)` for every backend that did not connect
    pub failed: Vec<(String, String)>,
    pub disabled: Vec<String>,
}

/// Service status consumed by health-check jobs
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub initialized: bool,
    pub server_count: usize,
    pub active_connections: usize,
    pub tool_count: usize,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Hub-side failure attached to a [`ToolResult`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Result of a tool call. Failures are values, never panics or raised
/// errors: `is_error` is set and, when the hub itself failed the call,
/// `error` carries a stable code.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub content: Vec<Value>,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResult {
    /// Hub-side failure for `tool_name`
    pub fn failure(tool_name: &str, connection_id: Option<&str>, err: &HubError) -> Self {
        let details = match err {
            HubError::Validation { errors, .. } => Some(json!(errors)),
            HubError::AmbiguousToolName { candidates, .. } => Some(json!(candidates)),
            _ => None,
        };
        Self {
            tool_name: tool_name.to_string(),
            connection_id: connection_id.map(String::from),
            content: vec![text_content(err.to_string())],
            is_error: true,
            error: Some(ToolError {
                code: err.code().to_string(),
                message: err.to_string(),
                details,
            }),
        }
    }

    fn from_backend(tool: &ToolDescriptor, result: Value) -> Self {
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let content = match result.get("content") {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
            None => vec![text_content(result.to_string())],
        };
        Self {
            tool_name: tool.qualified_name.clone(),
            connection_id: Some(tool.owner_connection_id.clone()),
            content,
            is_error,
            error: None,
        }
    }

    /// Stable error code, if the hub failed the call
    pub fn code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }

    /// MCP `tools/call` result body
    pub fn to_mcp(&self) -> Value {
        json!({
            "content": self.content,
            "isError": self.is_error,
        })
    }
}

struct ServiceState {
    initialized: bool,
    last_updated: DateTime<Utc>,
    error: Option<String>,
}

/// The hub's public coordinator
pub struct HubOrchestrator {
    manager: ConnectionManager,
    catalog: Arc<ToolCatalog>,
    state: RwLock<ServiceState>,
}

impl HubOrchestrator {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let catalog = Arc::new(ToolCatalog::new());
        let manager = ConnectionManager::new(connector, policy, catalog.clone());
        Self {
            manager,
            catalog,
            state: RwLock::new(ServiceState {
                initialized: false,
                last_updated: Utc::now(),
                error: None,
            }),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    fn touch(&self) {
        self.state.write().last_updated = Utc::now();
    }

    /// Connect every enabled backend of `config` concurrently.
    ///
    /// Configuration problems fail before anything is connected. After
    /// that, only "servers were required but none connected" is an error;
    /// individual failures are reported in the [`InitReport`] and left to
    /// the reconnect policy.
    pub async fn initialize_from_config(&self, config: &HubConfig) -> Result<InitReport> {
        let specs = config.validate()?;
        for spec in &specs {
            if self.manager.contains(&spec.id) {
                return Err(HubError::DuplicateConnection(spec.id.clone()));
            }
        }

        let mut report = InitReport::default();
        let mut backends = Vec::new();
        for spec in specs {
            if spec.enabled {
                backends.push((spec.id, spec.transport));
            } else {
                info!(connection_id = %spec.id, "Skipping disabled server");
                report.disabled.push(spec.id);
            }
        }
        report.attempted = backends.len();

        info!("Initializing hub with {} servers", report.attempted);
        for outcome in self.manager.register_all(backends).await {
            if outcome.is_connected() {
                report.connected += 1;
            } else {
                let reason = match &outcome.result {
                    Err(e) => e.to_string(),
                    Ok(connection) => format!("status {}", connection.status),
                };
                report.failed.push((outcome.id, reason));
            }
        }

        if config.require_backend && report.attempted > 0 && report.connected == 0 {
            let err = HubError::NoBackendsAvailable {
                attempted: report.attempted,
            };
            error!(error = %err, "Hub initialization failed");
            self.manager.shutdown().await;
            self.catalog.clear();
            let mut state = self.state.write();
            state.error = Some(err.to_string());
            state.last_updated = Utc::now();
            return Err(err);
        }

        {
            let mut state = self.state.write();
            state.initialized = true;
            state.error = None;
            state.last_updated = Utc::now();
        }

        info!(
            "Hub initialized: {}/{} servers connected, {} tools",
            report.connected,
            report.attempted,
            self.catalog.len()
        );
        Ok(report)
    }

    /// Add a backend at runtime. Connecting happens in the background.
    pub fn register_server(&self, id: &str, transport_config: TransportConfig) -> Result<Connection> {
        let connection = self.manager.register(id, transport_config)?;
        self.touch();
        Ok(connection)
    }

    pub async fn unregister_server(&self, id: &str) -> Result<()> {
        self.manager.remove(id).await?;
        self.touch();
        Ok(())
    }

    /// Manual retry. Resets the attempt counter; a failed attempt shows up in
    /// the returned status, not as an error.
    pub async fn reconnect_server(&self, id: &str) -> Result<Connection> {
        let result = self.manager.connect(id).await;
        self.touch();
        match result {
            Ok(connection) => Ok(connection),
            Err(e @ HubError::ConnectionNotFound(_)) => Err(e),
            Err(e) => {
                debug!(connection_id = %id, error = %e, "Manual reconnect failed");
                self.manager.get(id)
            }
        }
    }

    /// Tools of currently `CONNECTED` backends
    pub fn get_all_tools(&self, filter: Option<&ToolFilter>) -> Vec<ToolDescriptor> {
        let connected: HashSet<String> = self.manager.connected_ids().into_iter().collect();
        self.catalog
            .list(filter)
            .into_iter()
            .filter(|tool| connected.contains(&tool.owner_connection_id))
            .collect()
    }

    /// Find the tool `name` refers to.
    ///
    /// With `connection_id`, `name` must be that connection's exact qualified
    /// name. Otherwise a qualified name is taken as-is, and anything else is
    /// matched by raw name across connected backends, which must be unique.
    pub fn resolve_tool(&self, name: &str, connection_id: Option<&str>) -> Result<ToolDescriptor> {
        let connected: HashSet<String> = self.manager.connected_ids().into_iter().collect();
        let reachable = |tool: &ToolDescriptor| connected.contains(&tool.owner_connection_id);

        if let Some(connection_id) = connection_id {
            return match self.catalog.get(name) {
                Ok(tool) if tool.owner_connection_id == connection_id && reachable(&tool) => {
                    Ok(tool)
                }
                _ => Err(HubError::ToolNotFound(name.to_string())),
            };
        }

        if parse_qualified(name).is_some() {
            if let Ok(tool) = self.catalog.get(name) {
                if reachable(&tool) {
                    return Ok(tool);
                }
            }
        }

        let mut candidates: Vec<ToolDescriptor> = self
            .catalog
            .find_by_raw_name(name)
            .into_iter()
            .filter(|tool| reachable(tool))
            .collect();

        match candidates.len() {
            0 => Err(HubError::ToolNotFound(name.to_string())),
            1 => Ok(candidates.remove(0)),
            _ => Err(HubError::AmbiguousToolName {
                name: name.to_string(),
                candidates: candidates.into_iter().map(|t| t.qualified_name).collect(),
            }),
        }
    }

    /// Resolve, validate and dispatch a tool call
    pub async fn execute_tool_call(
        &self,
        name: &str,
        args: Value,
        connection_id: Option<&str>,
    ) -> ToolResult {
        let tool = match self.resolve_tool(name, connection_id) {
            Ok(tool) => tool,
            Err(e) => {
                debug!(tool = %name, error = %e, "Tool resolution failed");
                return ToolResult::failure(name, connection_id, &e);
            }
        };

        match self.catalog.validate_args(&tool.qualified_name, &args) {
            Ok(validation) if validation.valid => {}
            Ok(validation) => {
                let err = HubError::Validation {
                    tool: tool.qualified_name.clone(),
                    errors: validation.errors,
                };
                return ToolResult::failure(
                    &tool.qualified_name,
                    Some(&tool.owner_connection_id),
                    &err,
                );
            }
            Err(e) => {
                return ToolResult::failure(&tool.qualified_name, Some(&tool.owner_connection_id), &e)
            }
        }

        let Some(client) = self.manager.client(&tool.owner_connection_id) else {
            let err = HubError::connection(&tool.owner_connection_id, "Connection is not available");
            return ToolResult::failure(&tool.qualified_name, Some(&tool.owner_connection_id), &err);
        };

        let args = if args.is_null() { json!({}) } else { args };
        debug!(tool = %tool.qualified_name, "Dispatching tool call");
        match client.call_tool(&tool.raw_name, args).await {
            Ok(result) => ToolResult::from_backend(&tool, result),
            Err(e) => {
                warn!(tool = %tool.qualified_name, error = %e, "Tool call failed");
                ToolResult::failure(&tool.qualified_name, Some(&tool.owner_connection_id), &e)
            }
        }
    }

    pub fn get_service_status(&self) -> ServiceStatus {
        let stats = self.manager.pool_stats();
        let state = self.state.read();
        ServiceStatus {
            initialized: state.initialized,
            server_count: stats.total,
            active_connections: stats.connected,
            tool_count: self.catalog.len(),
            last_updated: state.last_updated,
            error: state.error.clone(),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.manager.pool_stats()
    }

    pub fn list_connections(&self) -> Vec<Connection> {
        self.manager.list_all()
    }

    /// Close every connection, clear the catalog and mark the hub
    /// uninitialized. Safe to call more than once.
    pub async fn shutdown(&self) -> Vec<(String, HubError)> {
        if !self.is_initialized() && self.manager.is_empty() {
            debug!("Hub already shut down");
            return Vec::new();
        }

        info!("Shutting down hub");
        let failures = self.manager.shutdown().await;
        self.catalog.clear();

        let mut state = self.state.write();
        state.initialized = false;
        state.last_updated = Utc::now();
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolDefinition;

    #[test]
    fn test_failure_carries_code_and_details() {
        let err = HubError::AmbiguousToolName {
            name: "x".into(),
            candidates: vec!["A_x".into(), "B_x".into()],
        };
        let result = ToolResult::failure("x", None, &err);
        assert!(result.is_error);
        assert_eq!(result.code(), Some("AMBIGUOUS_TOOL_NAME"));
        assert_eq!(result.error.unwrap().details, Some(json!(["A_x", "B_x"])));
    }

    #[test]
    fn test_backend_result_mapping() {
        let tool = ToolDescriptor {
            qualified_name: "A_x".into(),
            raw_name: "x".into(),
            description: None,
            input_schema: json!({}),
            owner_connection_id: "A".into(),
        };
        let result = ToolResult::from_backend(
            &tool,
            json!({ "content": [{ "type": "text", "text": "boom" }], "isError": true }),
        );
        assert!(result.is_error);
        assert!(result.code().is_none());
        assert_eq!(result.to_mcp()["content"][0]["text"], "boom");
    }

    #[tokio::test]
    async fn test_resolution_without_backends() {
        struct Offline;

        #[async_trait::async_trait]
        impl Connector for Offline {
            async fn connect(
                &self,
                connection_id: &str,
                _config: &TransportConfig,
            ) -> Result<Arc<dyn crate::transport::BackendTransport>> {
                Err(HubError::connection(connection_id, "offline"))
            }
        }

        let hub = HubOrchestrator::new(Arc::new(Offline), ReconnectPolicy::disabled());
        // Catalog entries of a connection that is not connected are invisible.
        hub.catalog()
            .add_from_connection("A", &[ToolDefinition::new("x", "x", json!({}))]);

        assert!(hub.get_all_tools(None).is_empty());
        let result = hub.execute_tool_call("A_x", json!({}), None).await;
        assert_eq!(result.code(), Some("TOOL_NOT_FOUND"));
    }
}
