//! Error types for op-mcp-hub

use thiserror::Error;

/// Main error type for hub operations
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection '{0}' is already registered")]
    DuplicateConnection(String),

    #[error("Connection '{0}' not found")]
    ConnectionNotFound(String),

    #[error("Connection error ({connection_id}): {message}")]
    Connection {
        connection_id: String,
        message: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection '{connection_id}' declared tool '{raw_name}' more than once")]
    DuplicateTool {
        connection_id: String,
        raw_name: String,
    },

    #[error("Tool '{0}' not found")]
    ToolNotFound(String),

    #[error("Tool name '{name}' is ambiguous, candidates: {}", candidates.join(", "))]
    AmbiguousToolName {
        name: String,
        candidates: Vec<String>,
    },

    #[error("Invalid arguments for '{tool}': {}", errors.join("; "))]
    Validation { tool: String, errors: Vec<String> },

    #[error("Group '{0}' not found")]
    GroupNotFound(String),

    #[error("Group id is required")]
    MissingGroupId,

    #[error("Access denied to group '{0}'")]
    AccessDenied(String),

    #[error("Tool '{tool}' is not exposed by group '{group_id}'")]
    ToolNotInGroup { group_id: String, tool: String },

    #[error("Invalid validation key: {0}")]
    InvalidKey(String),

    #[error("No backend could be connected ({attempted} attempted)")]
    NoBackendsAvailable { attempted: usize },

    #[error("Hub is not initialized")]
    NotInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias using [`HubError`]
pub type Result<T> = std::result::Result<T, HubError>;

impl HubError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn connection(connection_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connection {
            connection_id: connection_id.into(),
            message: msg.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Stable machine-readable code, used in tool results and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::Yaml(_) => "CONFIG_ERROR",
            Self::DuplicateConnection(_) => "DUPLICATE_CONNECTION",
            Self::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            Self::Connection { .. } => "CONNECTION_ERROR",
            Self::Transport(_) | Self::Io(_) => "TRANSPORT_ERROR",
            Self::Protocol(_) | Self::Json(_) => "PROTOCOL_ERROR",
            Self::DuplicateTool { .. } => "DUPLICATE_TOOL",
            Self::ToolNotFound(_) => "TOOL_NOT_FOUND",
            Self::AmbiguousToolName { .. } => "AMBIGUOUS_TOOL_NAME",
            Self::Validation { .. } => "VALIDATION_FAILED",
            Self::GroupNotFound(_) => "GROUP_NOT_FOUND",
            Self::MissingGroupId => "MISSING_GROUP_ID",
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::ToolNotInGroup { .. } => "TOOL_NOT_IN_GROUP",
            Self::InvalidKey(_) => "INVALID_KEY",
            Self::NoBackendsAvailable { .. } => "NO_BACKENDS_AVAILABLE",
            Self::NotInitialized => "HUB_NOT_INITIALIZED",
        }
    }

    /// Whether this is one of the access errors a group endpoint reports
    /// (not found, not allowed, not exposed).
    pub fn is_access_error(&self) -> bool {
        matches!(
            self,
            Self::GroupNotFound(_)
                | Self::MissingGroupId
                | Self::AccessDenied(_)
                | Self::ToolNotInGroup { .. }
        )
    }
}
