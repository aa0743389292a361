//! Group endpoints - curated, access-controlled views of the hub
//!
//! Each group is exposed as its own MCP endpoint. A group only ever shows
//! tools owned by its member connections, optionally narrowed by a raw-name
//! whitelist, and may require a validation key.
//!
//! Endpoints are built lazily on first access from the group definition and
//! dropped (never patched) when the definition changes. The tool view itself
//! is recomputed from the live catalog on every read.

use crate::catalog::{ToolDescriptor, ToolFilter};
use crate::config::{validate_group_id, GroupConfig};
use crate::connection::ConnectionStatus;
use crate::error::{HubError, Result};
use crate::orchestrator::{HubOrchestrator, ToolResult};
use crate::protocol::{
    initialize_result, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ToolDefinition,
    ACCESS_DENIED_CODE, HUB_NAME,
};
use crate::validation::{ValidationKeyStore, ValidationStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A built group endpoint
#[derive(Debug)]
struct GroupEndpoint {
    members: Vec<String>,
    whitelist: HashSet<String>,
    built_at: DateTime<Utc>,
}

impl GroupEndpoint {
    fn build(config: &GroupConfig) -> Self {
        Self {
            members: config.servers.clone(),
            whitelist: config.tools.iter().cloned().collect(),
            built_at: Utc::now(),
        }
    }

    fn allows(&self, tool: &ToolDescriptor) -> bool {
        self.members.contains(&tool.owner_connection_id)
            && (self.whitelist.is_empty() || self.whitelist.contains(&tool.raw_name))
    }
}

/// Overall state of a group's members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    /// Every member connected
    Healthy,
    /// Some members connected
    Degraded,
    /// No member connected, or no members
    Unhealthy,
}

/// Health of one member connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberHealth {
    pub connection_id: String,
    /// `None` when the member isn't registered with the hub
    pub status: Option<ConnectionStatus>,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupHealth {
    pub group_id: String,
    pub healthy: bool,
    pub health_score: f64,
    pub state: GroupState,
    pub connections: Vec<MemberHealth>,
}

/// Listing entry for a group
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub servers: Vec<String>,
    pub tools: Vec<String>,
    pub built: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub built_at: Option<DateTime<Utc>>,
    pub validation: ValidationStatus,
}

/// All group endpoints of the hub
pub struct GroupExposure {
    hub: Arc<HubOrchestrator>,
    keys: Arc<ValidationKeyStore>,
    definitions: RwLock<BTreeMap<String, GroupConfig>>,
    endpoints: RwLock<HashMap<String, Arc<GroupEndpoint>>>,
}

impl GroupExposure {
    pub fn new(hub: Arc<HubOrchestrator>, keys: Arc<ValidationKeyStore>) -> Self {
        Self {
            hub,
            keys,
            definitions: RwLock::new(BTreeMap::new()),
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Load group definitions, seeding validation keys from configuration
    pub fn from_config(
        hub: Arc<HubOrchestrator>,
        keys: Arc<ValidationKeyStore>,
        groups: &BTreeMap<String, GroupConfig>,
    ) -> Result<Self> {
        let exposure = Self::new(hub, keys);
        for (id, group) in groups {
            exposure.upsert_group(id, group.clone())?;
        }
        Ok(exposure)
    }

    pub fn hub(&self) -> &Arc<HubOrchestrator> {
        &self.hub
    }

    pub fn keys(&self) -> &Arc<ValidationKeyStore> {
        &self.keys
    }

    /// Create or replace a group. Its endpoint is rebuilt on next access.
    pub fn upsert_group(&self, group_id: &str, group: GroupConfig) -> Result<()> {
        validate_group_id(group_id)?;

        if let Some(validation) = &group.validation {
            match &validation.key_hash {
                Some(hash) => {
                    self.keys.seed_hash(group_id, hash, validation.enabled)?;
                }
                None => {
                    self.keys.set_enabled(group_id, validation.enabled);
                }
            }
        }

        let mut definitions = self.definitions.write();
        definitions.insert(group_id.to_string(), group);
        self.endpoints.write().remove(group_id);
        info!(group_id = %group_id, "Group defined");
        Ok(())
    }

    /// Delete a group together with its validation key
    pub fn remove_group(&self, group_id: &str) -> Result<()> {
        let mut definitions = self.definitions.write();
        if definitions.remove(group_id).is_none() {
            return Err(HubError::GroupNotFound(group_id.to_string()));
        }
        self.endpoints.write().remove(group_id);
        self.keys.remove(group_id);
        info!(group_id = %group_id, "Group removed");
        Ok(())
    }

    pub fn group(&self, group_id: &str) -> Option<GroupConfig> {
        self.definitions.read().get(group_id).cloned()
    }

    pub fn contains(&self, group_id: &str) -> bool {
        self.definitions.read().contains_key(group_id)
    }

    pub fn is_built(&self, group_id: &str) -> bool {
        self.endpoints.read().contains_key(group_id)
    }

    pub fn list_groups(&self) -> Vec<GroupSummary> {
        let definitions = self.definitions.read();
        let endpoints = self.endpoints.read();
        definitions
            .iter()
            .map(|(id, group)| GroupSummary {
                id: id.clone(),
                name: group.name.clone(),
                description: group.description.clone(),
                servers: group.servers.clone(),
                tools: group.tools.clone(),
                built: endpoints.contains_key(id),
                built_at: endpoints.get(id).map(|e| e.built_at),
                validation: self.keys.status(id),
            })
            .collect()
    }

    fn endpoint(&self, group_id: &str) -> Result<Arc<GroupEndpoint>> {
        if let Some(endpoint) = self.endpoints.read().get(group_id) {
            return Ok(endpoint.clone());
        }

        // Lock order is always definitions, then endpoints.
        let definitions = self.definitions.read();
        let definition = definitions
            .get(group_id)
            .ok_or_else(|| HubError::GroupNotFound(group_id.to_string()))?;

        let mut endpoints = self.endpoints.write();
        let endpoint = endpoints
            .entry(group_id.to_string())
            .or_insert_with(|| {
                debug!(group_id = %group_id, "Building group endpoint");
                Arc::new(GroupEndpoint::build(definition))
            })
            .clone();
        Ok(endpoint)
    }

    /// Tools the group exposes right now
    pub fn resolve_tools(&self, group_id: &str) -> Result<Vec<ToolDescriptor>> {
        let endpoint = self.endpoint(group_id)?;
        let filter = ToolFilter::new().connections(endpoint.members.iter().cloned());
        Ok(self
            .hub
            .get_all_tools(Some(&filter))
            .into_iter()
            .filter(|tool| endpoint.allows(tool))
            .collect())
    }

    /// Check the key, then the tool's membership, then dispatch.
    ///
    /// `tool_name` is normally the qualified name the group advertises; a
    /// raw name is accepted when it is unique within the group.
    pub async fn handle_call(
        &self,
        group_id: &str,
        tool_name: &str,
        args: Value,
        supplied_key: Option<&str>,
    ) -> Result<ToolResult> {
        self.endpoint(group_id)?;

        if !self.keys.validate(group_id, supplied_key) {
            warn!(group_id = %group_id, "Rejected call without a valid key");
            return Err(HubError::AccessDenied(group_id.to_string()));
        }

        let tools = self.resolve_tools(group_id)?;
        let tool = match tools.iter().find(|t| t.qualified_name == tool_name) {
            Some(tool) => tool,
            None => {
                let by_raw: Vec<&ToolDescriptor> =
                    tools.iter().filter(|t| t.raw_name == tool_name).collect();
                match by_raw.as_slice() {
                    [tool] => *tool,
                    [] => {
                        return Err(HubError::ToolNotInGroup {
                            group_id: group_id.to_string(),
                            tool: tool_name.to_string(),
                        })
                    }
                    many => {
                        return Err(HubError::AmbiguousToolName {
                            name: tool_name.to_string(),
                            candidates: many.iter().map(|t| t.qualified_name.clone()).collect(),
                        })
                    }
                }
            }
        };

        debug!(group_id = %group_id, tool = %tool.qualified_name, "Group tool call");
        Ok(self
            .hub
            .execute_tool_call(&tool.qualified_name, args, Some(&tool.owner_connection_id))
            .await)
    }

    /// Connected members / all members. No members means unhealthy.
    pub fn get_health(&self, group_id: &str) -> Result<GroupHealth> {
        let endpoint = self.endpoint(group_id)?;
        let manager = self.hub.manager();

        let connections: Vec<MemberHealth> = endpoint
            .members
            .iter()
            .map(|id| match manager.get(id) {
                Ok(connection) => MemberHealth {
                    connection_id: id.clone(),
                    status: Some(connection.status),
                    tool_count: if connection.status.is_connected() {
                        connection.discovered_tools.len()
                    } else {
                        0
                    },
                    last_error: connection.last_error,
                },
                Err(_) => MemberHealth {
                    connection_id: id.clone(),
                    status: None,
                    tool_count: 0,
                    last_error: None,
                },
            })
            .collect();

        let total = connections.len();
        let connected = connections
            .iter()
            .filter(|c| c.status.map_or(false, |s| s.is_connected()))
            .count();
        let health_score = if total == 0 {
            0.0
        } else {
            connected as f64 / total as f64
        };
        let state = match connected {
            0 => GroupState::Unhealthy,
            n if n == total => GroupState::Healthy,
            _ => GroupState::Degraded,
        };

        Ok(GroupHealth {
            group_id: group_id.to_string(),
            healthy: state != GroupState::Unhealthy,
            health_score,
            state,
            connections,
        })
    }

    /// Serve one JSON-RPC message on the group's endpoint.
    ///
    /// `Err` is reserved for a missing group and for tool methods reaching a
    /// hub that is not (or no longer) initialized; everything else, access
    /// errors included, comes back as a JSON-RPC response. Notifications
    /// yield `Ok(None)`.
    pub async fn handle_request(
        &self,
        group_id: &str,
        request: JsonRpcRequest,
        supplied_key: Option<&str>,
    ) -> Result<Option<JsonRpcResponse>> {
        let group = self
            .group(group_id)
            .ok_or_else(|| HubError::GroupNotFound(group_id.to_string()))?;

        if request.is_notification() || request.method.starts_with("notifications/") {
            debug!(group_id = %group_id, method = %request.method, "Notification");
            return Ok(None);
        }

        if matches!(request.method.as_str(), "tools/list" | "tools/call")
            && !self.hub.is_initialized()
        {
            return Err(HubError::NotInitialized);
        }

        let id = request.id.clone();
        let response = match request.method.as_str() {
            "initialize" => {
                let name = format!("{}/{}", HUB_NAME, group_id);
                let instructions = group.description.as_deref().unwrap_or(group.name.as_str());
                JsonRpcResponse::success(id, initialize_result(&name, Some(instructions)))
            }
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => {
                if !self.keys.validate(group_id, supplied_key) {
                    return Ok(Some(access_error_response(
                        id,
                        &HubError::AccessDenied(group_id.to_string()),
                    )));
                }
                let tools: Vec<ToolDefinition> = self
                    .resolve_tools(group_id)?
                    .iter()
                    .map(ToolDescriptor::to_definition)
                    .collect();
                JsonRpcResponse::success(id, json!({ "tools": tools }))
            }
            "tools/call" => self.handle_tools_call(group_id, id, request.params, supplied_key).await?,
            other => JsonRpcResponse::error(id, JsonRpcError::method_not_found(other)),
        };
        Ok(Some(response))
    }

    async fn handle_tools_call(
        &self,
        group_id: &str,
        id: Option<Value>,
        params: Option<Value>,
        supplied_key: Option<&str>,
    ) -> Result<JsonRpcResponse> {
        let params = params.unwrap_or(Value::Null);
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Ok(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_params("tools/call requires a 'name'"),
            ));
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        match self.handle_call(group_id, name, arguments, supplied_key).await {
            Ok(result) => Ok(tool_result_response(id, &result)),
            Err(e @ HubError::GroupNotFound(_)) => Err(e),
            Err(e) => Ok(access_error_response(id, &e)),
        }
    }
}

/// JSON-RPC error for an access or lookup failure, carrying the stable code
fn access_error_response(id: Option<Value>, err: &HubError) -> JsonRpcResponse {
    let code = match err {
        HubError::AccessDenied(_) => ACCESS_DENIED_CODE,
        _ => -32602,
    };
    let mut data = json!({ "code": err.code() });
    if let HubError::AmbiguousToolName { candidates, .. } = err {
        data["candidates"] = json!(candidates);
    }
    JsonRpcResponse::error(id, JsonRpcError::new(code, err.to_string()).with_data(data))
}

/// Hub-side lookup and validation failures become JSON-RPC errors; backend
/// and transport failures stay tool results with `isError`.
fn tool_result_response(id: Option<Value>, result: &ToolResult) -> JsonRpcResponse {
    match &result.error {
        Some(error)
            if matches!(
                error.code.as_str(),
                "TOOL_NOT_FOUND" | "AMBIGUOUS_TOOL_NAME" | "VALIDATION_FAILED"
            ) =>
        {
            let mut data = json!({ "code": error.code });
            if let Some(details) = &error.details {
                data["details"] = details.clone();
            }
            JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_params(error.message.clone()).with_data(data),
            )
        }
        _ => JsonRpcResponse::success(id, result.to_mcp()),
    }
}
