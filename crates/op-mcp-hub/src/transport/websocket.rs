//! WebSocket Transport
//!
//! Full-duplex JSON-RPC over text frames.

use super::{BackendTransport, PendingRequests};
use crate::error::{HubError, Result};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// WebSocket transport
pub struct WebSocketTransport {
    connection_id: String,
    sink: Mutex<Option<WsSink>>,
    pending: Arc<PendingRequests>,
    closed_tx: Arc<watch::Sender<bool>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

/// `http(s)://` urls are accepted in config and mapped onto `ws(s)://`.
fn websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        url.to_string()
    }
}

impl WebSocketTransport {
    pub async fn connect(
        connection_id: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let target = websocket_url(url);
        let mut request = target
            .as_str()
            .into_client_request()
            .map_err(|e| HubError::connection(connection_id, format!("Invalid url: {}", e)))?;

        for (name, value) in headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                HubError::connection(connection_id, format!("Invalid header name '{}'", name))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|_| {
                HubError::connection(connection_id, format!("Invalid value for header '{}'", name))
            })?;
            request.headers_mut().insert(header_name, header_value);
        }

        info!(connection_id = %connection_id, url = %target, "Opening WebSocket");

        let (stream, _) = tokio::time::timeout(request_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| HubError::connection(connection_id, "Timed out opening WebSocket"))?
            .map_err(|e| HubError::connection(connection_id, format!("WebSocket handshake failed: {}", e)))?;

        let (sink, mut source) = stream.split();
        let pending = Arc::new(PendingRequests::new());
        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let reader = {
            let pending = pending.clone();
            let closed_tx = closed_tx.clone();
            let id = connection_id.to_string();
            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    match frame {
                        Ok(Message::Text(text)) => pending.dispatch(&id, &text),
                        Ok(Message::Binary(bytes)) => {
                            pending.dispatch(&id, &String::from_utf8_lossy(&bytes))
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(connection_id = %id, frame = ?frame, "WebSocket close frame");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(connection_id = %id, error = %e, "WebSocket read failed");
                            break;
                        }
                    }
                }
                info!(connection_id = %id, "WebSocket closed");
                pending.fail_all();
                closed_tx.send_replace(true);
            })
        };

        Ok(Self {
            connection_id: connection_id.to_string(),
            sink: Mutex::new(Some(sink)),
            pending,
            closed_tx,
            reader: parking_lot::Mutex::new(Some(reader)),
            request_timeout,
        })
    }

    async fn send(&self, message: &JsonRpcRequest) -> Result<()> {
        let text = serde_json::to_string(message)?;
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| HubError::transport("WebSocket is closed"))?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| HubError::transport(format!("WebSocket send failed: {}", e)))
    }
}

#[async_trait::async_trait]
impl BackendTransport for WebSocketTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| HubError::protocol("Request without id"))?;
        let rx = self.pending.register(&id)?;

        debug!(connection_id = %self.connection_id, method = %request.method, "WebSocket request");
        if let Err(e) = self.send(&request).await {
            self.pending.cancel(&id);
            return Err(e);
        }

        self.pending.wait(&id, rx, self.request_timeout).await
    }

    async fn notify(&self, notification: JsonRpcRequest) -> Result<()> {
        self.send(&notification).await
    }

    async fn close(&self) -> Result<()> {
        self.pending.fail_all();

        let sink = self.sink.lock().await.take();
        let result = match sink {
            Some(mut sink) => sink
                .close()
                .await
                .map_err(|e| HubError::transport(format!("WebSocket close failed: {}", e))),
            None => Ok(()),
        };

        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            handle.abort();
        }
        self.closed_tx.send_replace(true);
        result
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}
