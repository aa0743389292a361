//! SSE Transport
//!
//! HTTP + Server-Sent Events client: a long-lived `GET` delivers an
//! `endpoint` event and then `message` events carrying responses; requests
//! are `POST`ed to the announced endpoint.

use super::{BackendTransport, PendingRequests};
use crate::error::{HubError, Result};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL};
use reqwest::Url;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One parsed server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser
#[derive(Default)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    /// Feed a chunk, returning every event it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = Self::parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }

    fn parse_block(block: &str) -> Option<SseEvent> {
        let mut event = String::from("message");
        let mut data: Vec<&str> = Vec::new();

        for line in block.lines() {
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => event = value.to_string(),
                "data" => data.push(value),
                _ => {}
            }
        }

        if data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event,
            data: data.join("\n"),
        })
    }
}

/// SSE transport
pub struct SseTransport {
    connection_id: String,
    client: reqwest::Client,
    endpoint: Url,
    pending: Arc<PendingRequests>,
    closed_tx: Arc<watch::Sender<bool>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

fn header_map(connection_id: &str, headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            HubError::connection(connection_id, format!("Invalid header name '{}'", name))
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            HubError::connection(connection_id, format!("Invalid value for header '{}'", name))
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its endpoint
    pub async fn connect(
        connection_id: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let base = Url::parse(url)
            .map_err(|e| HubError::connection(connection_id, format!("Invalid url: {}", e)))?;

        let client = reqwest::Client::builder()
            .default_headers(header_map(connection_id, headers)?)
            .build()
            .map_err(|e| HubError::connection(connection_id, format!("Failed to build HTTP client: {}", e)))?;

        info!(connection_id = %connection_id, url = %url, "Opening SSE stream");

        let response = client
            .get(base.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| HubError::connection(connection_id, format!("Failed to open SSE stream: {}", e)))?;

        if !response.status().is_success() {
            return Err(HubError::connection(
                connection_id,
                format!("SSE endpoint returned {}", response.status()),
            ));
        }

        let pending = Arc::new(PendingRequests::new());
        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        let reader = {
            let pending = pending.clone();
            let closed_tx = closed_tx.clone();
            let id = connection_id.to_string();
            let mut stream = response.bytes_stream();
            tokio::spawn(async move {
                let mut parser = SseParser::default();
                let mut endpoint_tx = Some(endpoint_tx);

                while let Some(chunk) = stream.next().await {
                    let chunk = match chunk {
                        Ok(c) => c,
                        Err(e) => {
                            warn!(connection_id = %id, error = %e, "SSE stream error");
                            break;
                        }
                    };
                    for event in parser.feed(&chunk) {
                        match event.event.as_str() {
                            "endpoint" => {
                                if let Some(tx) = endpoint_tx.take() {
                                    let _ = tx.send(event.data);
                                }
                            }
                            "message" => pending.dispatch(&id, &event.data),
                            other => debug!(connection_id = %id, event = %other, "Ignoring SSE event"),
                        }
                    }
                }

                info!(connection_id = %id, "SSE stream ended");
                pending.fail_all();
                closed_tx.send_replace(true);
            })
        };

        let endpoint = match tokio::time::timeout(request_timeout, endpoint_rx).await {
            Ok(Ok(path)) => base.join(path.trim()).map_err(|e| {
                HubError::connection(connection_id, format!("Invalid endpoint '{}': {}", path, e))
            }),
            Ok(Err(_)) => Err(HubError::connection(
                connection_id,
                "SSE stream closed before the endpoint was announced",
            )),
            Err(_) => Err(HubError::connection(
                connection_id,
                "Timed out waiting for the SSE endpoint event",
            )),
        };

        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(e) => {
                reader.abort();
                return Err(e);
            }
        };

        debug!(connection_id = %connection_id, endpoint = %endpoint, "SSE endpoint announced");

        Ok(Self {
            connection_id: connection_id.to_string(),
            client,
            endpoint,
            pending,
            closed_tx,
            reader: parking_lot::Mutex::new(Some(reader)),
            request_timeout,
        })
    }

    async fn post(&self, message: &JsonRpcRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(message)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| HubError::transport(format!("Failed to POST to {}: {}", self.endpoint, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HubError::transport(format!("HTTP error {}: {}", status, body)));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl BackendTransport for SseTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| HubError::protocol("Request without id"))?;
        let rx = self.pending.register(&id)?;

        debug!(connection_id = %self.connection_id, method = %request.method, "SSE request");
        let response = match self.post(&request).await {
            Ok(r) => r,
            Err(e) => {
                self.pending.cancel(&id);
                return Err(e);
            }
        };

        // Some servers answer inline instead of on the event stream.
        if let Ok(body) = response.bytes().await {
            if let Ok(inline) = serde_json::from_slice::<JsonRpcResponse>(&body) {
                if inline.id.as_ref() == Some(&id) {
                    self.pending.resolve(inline);
                }
            }
        }

        self.pending.wait(&id, rx, self.request_timeout).await
    }

    async fn notify(&self, notification: JsonRpcRequest) -> Result<()> {
        self.post(&notification).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        self.pending.fail_all();
        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            handle.abort();
        }
        self.closed_tx.send_replace(true);
        Ok(())
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_handles_split_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"event: endpoint\ndata: /mes").is_empty());
        let events = parser.feed(b"sage?session=1\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: "endpoint".into(),
                data: "/message?session=1".into()
            }]
        );
    }

    #[test]
    fn test_parser_defaults_to_message_and_joins_data() {
        let mut parser = SseParser::default();
        let events = parser.feed(b": keepalive\n\ndata: {\"a\":\r\ndata: 1}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"a\":\n1}");
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(header_map("a", &headers).is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let result = SseTransport::connect(
            "down",
            "http://127.0.0.1:9/sse",
            &BTreeMap::new(),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(HubError::Connection { .. })));
    }
}
