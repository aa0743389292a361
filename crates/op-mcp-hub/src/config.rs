//! Configuration for the MCP Hub
//!
//! Supports loading from JSON/YAML files. Raw server entries are turned into
//! a [`TransportConfig`] exactly once, in [`HubConfig::validate`]; everything
//! downstream matches on that sum type.

use crate::connection::ReconnectPolicy;
use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Main configuration for the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    /// Upstream MCP servers, keyed by connection id
    #[serde(default)]
    pub servers: ServersSection,

    /// Groups exposed as their own endpoints, keyed by group id
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,

    /// Reconnection backoff
    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Timeout for a single upstream request, in seconds
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,

    /// Fail startup when servers are declared but none can be connected
    #[serde(default = "default_true")]
    pub require_backend: bool,

    /// Address the group endpoints listen on
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

fn default_bind() -> String {
    "127.0.0.1:3100".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            servers: ServersSection::default(),
            groups: BTreeMap::new(),
            reconnect: ReconnectPolicy::default(),
            request_timeout_secs: default_timeout(),
            require_backend: true,
            bind: default_bind(),
        }
    }
}

impl HubConfig {
    /// Load configuration from a JSON or YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            HubError::config(format!("Failed to read config from {}: {}", path.display(), e))
        })?;

        let is_yaml = path
            .extension()
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);

        let config: Self = if is_yaml {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };

        info!("Loaded hub config from {}", path.display());
        Ok(config)
    }

    /// Load from default paths, falling back to an empty configuration
    pub fn load_default() -> Result<Self> {
        let paths = [
            "/etc/op-mcp-hub/hub.json",
            "/etc/op-mcp-hub/hub.yaml",
            "hub.json",
        ];

        for path in paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        info!("No hub config found, using defaults");
        Ok(Self::default())
    }

    /// Create a builder for programmatic configuration
    pub fn builder() -> HubConfigBuilder {
        HubConfigBuilder::default()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Check the whole configuration and resolve every server entry into a
    /// [`ServerSpec`]. Nothing is connected here; any error is fatal.
    pub fn validate(&self) -> Result<Vec<ServerSpec>> {
        let entries = self.servers.entries();
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(entries.len());

        for (id, server) in entries {
            validate_connection_id(id)?;
            if !seen.insert(id.to_string()) {
                return Err(HubError::config(format!(
                    "Server id '{}' is declared more than once",
                    id
                )));
            }
            specs.push(ServerSpec {
                id: id.to_string(),
                transport: server.to_transport(id)?,
                enabled: server.enabled,
            });
        }

        for (group_id, group) in &self.groups {
            validate_group_id(group_id)?;
            for member in &group.servers {
                if !seen.contains(member) {
                    warn!(
                        group_id = %group_id,
                        server = %member,
                        "Group references a server that is not configured"
                    );
                }
            }
        }

        Ok(specs)
    }
}

/// Builder for HubConfig
#[derive(Default)]
pub struct HubConfigBuilder {
    config: HubConfig,
    servers: Vec<ServerEntry>,
}

impl HubConfigBuilder {
    pub fn server(mut self, id: &str, server: ServerConfig) -> Self {
        self.servers.push(ServerEntry {
            id: id.to_string(),
            server,
        });
        self
    }

    pub fn group(mut self, id: &str, group: GroupConfig) -> Self {
        self.config.groups.insert(id.to_string(), group);
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn require_backend(mut self, required: bool) -> Self {
        self.config.require_backend = required;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn build(mut self) -> HubConfig {
        // The list form keeps duplicates visible to `validate`.
        self.config.servers = ServersSection::List(self.servers);
        self.config
    }
}

/// `servers` accepts a map keyed by id (the usual form) or a list of
/// entries carrying their own `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServersSection {
    Map(BTreeMap<String, ServerConfig>),
    List(Vec<ServerEntry>),
}

impl Default for ServersSection {
    fn default() -> Self {
        Self::Map(BTreeMap::new())
    }
}

impl ServersSection {
    pub fn entries(&self) -> Vec<(&str, &ServerConfig)> {
        match self {
            Self::Map(map) => map.iter().map(|(id, s)| (id.as_str(), s)).collect(),
            Self::List(list) => list.iter().map(|e| (e.id.as_str(), &e.server)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Map(map) => map.len(),
            Self::List(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A server entry in list form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    #[serde(flatten)]
    pub server: ServerConfig,
}

/// Raw configuration of an upstream MCP server, as written in the file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Transport kind; inferred from `command`/`url` when absent
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ServerKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment for stdio servers (values may be `${VAR}` references)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Extra headers for network servers (values may be `${VAR}` references)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ServerConfig {
    /// A stdio server launched from `command`
    pub fn stdio(command: &str, args: Vec<&str>) -> Self {
        Self {
            kind: Some(ServerKind::Stdio),
            command: Some(command.to_string()),
            args: args.into_iter().map(String::from).collect(),
            enabled: true,
            ..Default::default()
        }
    }

    /// An HTTP + Server-Sent Events server
    pub fn sse(url: &str) -> Self {
        Self {
            kind: Some(ServerKind::Sse),
            url: Some(url.to_string()),
            enabled: true,
            ..Default::default()
        }
    }

    /// A WebSocket server
    pub fn websocket(url: &str) -> Self {
        Self {
            kind: Some(ServerKind::Websocket),
            url: Some(url.to_string()),
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn resolved_kind(&self) -> Option<ServerKind> {
        self.kind.or_else(|| {
            if self.command.is_some() {
                Some(ServerKind::Stdio)
            } else if self.url.is_some() {
                Some(ServerKind::Sse)
            } else {
                None
            }
        })
    }

    /// Decide the transport for this entry, rejecting malformed shapes
    pub fn to_transport(&self, id: &str) -> Result<TransportConfig> {
        let kind = self.resolved_kind().ok_or_else(|| {
            HubError::config(format!(
                "Server '{}' needs a 'type', a 'command' or a 'url'",
                id
            ))
        })?;

        match kind {
            ServerKind::Stdio => {
                let command = self
                    .command
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| {
                        HubError::config(format!("Stdio server '{}' is missing 'command'", id))
                    })?;
                Ok(TransportConfig::Stdio {
                    command: command.to_string(),
                    args: self.args.clone(),
                    env: resolve_map(&self.env),
                })
            }
            ServerKind::Sse | ServerKind::Websocket => {
                let network_kind = if kind == ServerKind::Sse {
                    NetworkKind::Sse
                } else {
                    NetworkKind::Websocket
                };
                let url = self.url.as_deref().map(str::trim).ok_or_else(|| {
                    HubError::config(format!("Server '{}' is missing 'url'", id))
                })?;
                let parsed = reqwest::Url::parse(url).map_err(|e| {
                    HubError::config(format!("Server '{}' has an invalid url '{}': {}", id, url, e))
                })?;
                let scheme_ok = match network_kind {
                    NetworkKind::Sse => matches!(parsed.scheme(), "http" | "https"),
                    NetworkKind::Websocket => {
                        matches!(parsed.scheme(), "ws" | "wss" | "http" | "https")
                    }
                };
                if !scheme_ok {
                    return Err(HubError::config(format!(
                        "Server '{}' url scheme '{}' does not fit a {} transport",
                        id,
                        parsed.scheme(),
                        network_kind
                    )));
                }
                Ok(TransportConfig::Network {
                    url: url.to_string(),
                    headers: resolve_map(&self.headers),
                    kind: network_kind,
                })
            }
        }
    }
}

/// Transport kind as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Stdio,
    Sse,
    Websocket,
}

/// Network transport flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    /// HTTP + Server-Sent Events
    Sse,
    /// WebSocket
    Websocket,
}

impl std::fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sse => write!(f, "sse"),
            Self::Websocket => write!(f, "websocket"),
        }
    }
}

/// How the hub reaches a backend. Decided once from [`ServerConfig`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        #[serde(skip_serializing)]
        env: BTreeMap<String, String>,
    },
    Network {
        url: String,
        #[serde(skip_serializing)]
        headers: BTreeMap<String, String>,
        kind: NetworkKind,
    },
}

impl TransportConfig {
    pub fn stdio(command: &str, args: Vec<&str>) -> Self {
        Self::Stdio {
            command: command.to_string(),
            args: args.into_iter().map(String::from).collect(),
            env: BTreeMap::new(),
        }
    }

    pub fn sse(url: &str) -> Self {
        Self::Network {
            url: url.to_string(),
            headers: BTreeMap::new(),
            kind: NetworkKind::Sse,
        }
    }

    pub fn websocket(url: &str) -> Self {
        Self::Network {
            url: url.to_string(),
            headers: BTreeMap::new(),
            kind: NetworkKind::Websocket,
        }
    }

    /// Short label for logs and status output
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Network {
                kind: NetworkKind::Sse,
                ..
            } => "sse",
            Self::Network {
                kind: NetworkKind::Websocket,
                ..
            } => "websocket",
        }
    }
}

/// A validated server declaration
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub id: String,
    pub transport: TransportConfig,
    pub enabled: bool,
}

/// Group configuration - a curated, access-controlled subset of tools
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Member connection ids
    #[serde(default)]
    pub servers: Vec<String>,

    /// Raw tool names allowed (empty = every tool of the members)
    #[serde(default)]
    pub tools: Vec<String>,

    /// Initial validation key state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<GroupValidationConfig>,
}

impl GroupConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_servers(mut self, servers: Vec<&str>) -> Self {
        self.servers = servers.into_iter().map(String::from).collect();
        self
    }

    pub fn with_tools(mut self, tools: Vec<&str>) -> Self {
        self.tools = tools.into_iter().map(String::from).collect();
        self
    }
}

/// Validation settings carried in group configuration. Only a hash is
/// ever written to disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupValidationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_hash: Option<String>,
}

/// Connection ids become the prefix of qualified tool names, so they must
/// not contain the `_` separator.
pub fn validate_connection_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(HubError::config("Server id must not be empty"));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(HubError::config(format!(
            "Server id '{}' may only contain ASCII letters, digits and '-'",
            id
        )));
    }
    Ok(())
}

/// Path segments the HTTP surface uses for its own routes
pub const RESERVED_GROUP_IDS: &[&str] = &["admin", "health", "mcp"];

/// Group ids appear as a URL path segment.
pub fn validate_group_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') || id.chars().any(char::is_whitespace) {
        return Err(HubError::config(format!("Invalid group id '{}'", id)));
    }
    if RESERVED_GROUP_IDS.contains(&id) {
        return Err(HubError::config(format!("Group id '{}' is reserved", id)));
    }
    Ok(())
}

fn resolve_map(values: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), resolve_env_var(v)))
        .collect()
}

/// Resolve environment variable references like ${VAR_NAME}
fn resolve_env_var(value: &str) -> String {
    match value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        Some(var_name) => std::env::var(var_name).unwrap_or_else(|_| value.to_string()),
        None => value.to_string(),
    }
}
