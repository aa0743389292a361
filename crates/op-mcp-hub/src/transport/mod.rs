//! Upstream Transport Layer
//!
//! Client-side transports used to reach backend MCP servers:
//! - Stdio (child process, newline-delimited JSON-RPC)
//! - SSE (HTTP GET event stream + POST)
//! - WebSocket (full duplex text frames)

mod pending;
mod sse;
mod stdio;
mod websocket;

pub use pending::PendingRequests;
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

use crate::config::{NetworkKind, TransportConfig};
use crate::error::Result;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// An open link to one backend server
#[async_trait::async_trait]
pub trait BackendTransport: Send + Sync {
    /// Send a request and wait for the response with the same id
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn notify(&self, notification: JsonRpcRequest) -> Result<()>;

    /// Close the transport and release its resources
    async fn close(&self) -> Result<()>;

    /// Flips to `true` once the transport is gone, whoever closed it
    fn closed(&self) -> watch::Receiver<bool>;
}

/// Opens transports. Production code uses [`TransportConnector`]; tests
/// substitute in-memory backends.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        connection_id: &str,
        config: &TransportConfig,
    ) -> Result<Arc<dyn BackendTransport>>;
}

/// Connector that opens real stdio / SSE / WebSocket transports
pub struct TransportConnector {
    request_timeout: Duration,
}

impl TransportConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for TransportConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait::async_trait]
impl Connector for TransportConnector {
    async fn connect(
        &self,
        connection_id: &str,
        config: &TransportConfig,
    ) -> Result<Arc<dyn BackendTransport>> {
        let transport: Arc<dyn BackendTransport> = match config {
            TransportConfig::Stdio { command, args, env } => Arc::new(
                StdioTransport::spawn(connection_id, command, args, env, self.request_timeout)
                    .await?,
            ),
            TransportConfig::Network {
                url,
                headers,
                kind: NetworkKind::Sse,
            } => Arc::new(
                SseTransport::connect(connection_id, url, headers, self.request_timeout).await?,
            ),
            TransportConfig::Network {
                url,
                headers,
                kind: NetworkKind::Websocket,
            } => Arc::new(
                WebSocketTransport::connect(connection_id, url, headers, self.request_timeout)
                    .await?,
            ),
        };
        Ok(transport)
    }
}
