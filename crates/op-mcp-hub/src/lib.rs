//! op-mcp-hub: MCP Hub
//!
//! Connects to many upstream MCP servers at once, merges the tools they
//! report into one catalog, and re-exposes named subsets of that catalog
//! ("groups") as their own MCP endpoints, optionally guarded by a
//! validation key.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        op-mcp-hub                           │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │  HTTP: /{groupId}/mcp  /{groupId}/status  /admin/...   │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │                           │                                 │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │  GroupExposure  ──  ValidationKeyStore                 │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │                           │                                 │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │  HubOrchestrator                                       │  │
//! │  │    ConnectionManager  ──(discoveries/losses)──▶ Catalog │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │                           │                                 │
//! │  ┌─────────┐ ┌─────────┐ ┌───────────┐                      │
//! │  │  stdio  │ │   SSE   │ │ WebSocket │   upstream servers   │
//! │  └─────────┘ └─────────┘ └───────────┘                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Tools are published as `{connectionId}_{rawName}`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use op_mcp_hub::{HubConfig, HubContext};
//!
//! let config = HubConfig::load("/etc/op-mcp-hub/hub.yaml")?;
//! let (context, report) = HubContext::with_transports(config).await?;
//! println!("{} of {} backends connected", report.connected, report.attempted);
//!
//! let result = context
//!     .hub()
//!     .execute_tool_call("github_search_repos", serde_json::json!({"q": "mcp"}), None)
//!     .await;
//! ```

pub mod catalog;
pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod groups;
pub mod http;
pub mod manager;
pub mod orchestrator;
pub mod protocol;
pub mod transport;
pub mod validation;

// Re-exports
pub use catalog::{qualify, parse_qualified, ToolCatalog, ToolDescriptor, ToolFilter};
pub use client::BackendClient;
pub use config::{GroupConfig, HubConfig, ServerConfig, TransportConfig};
pub use connection::{Connection, ConnectionStatus, PoolStats, ReconnectPolicy};
pub use context::HubContext;
pub use error::{HubError, Result};
pub use groups::{GroupExposure, GroupHealth, GroupState};
pub use manager::{ConnectionEvent, ConnectionManager, ConnectionObserver};
pub use orchestrator::{HubOrchestrator, InitReport, ServiceStatus, ToolResult};
pub use transport::{BackendTransport, Connector, TransportConnector};
pub use validation::{analyze_key_complexity, KeyStrength, ValidationKeyStore, ValidationStatus};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::{
        Connection, ConnectionStatus, GroupConfig, GroupExposure, HubConfig, HubContext,
        HubError, HubOrchestrator, ReconnectPolicy, ServerConfig, ToolDescriptor, ToolFilter,
        ToolResult, ValidationKeyStore,
    };
}
