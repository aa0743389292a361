//! Correlation of in-flight requests with their responses.

use crate::error::{HubError, Result};
use crate::protocol::JsonRpcResponse;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Requests waiting for a response, keyed by JSON-RPC id
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<PendingInner>,
}

#[derive(Default)]
struct PendingInner {
    waiting: HashMap<String, oneshot::Sender<JsonRpcResponse>>,
    closed: bool,
}

fn key_for(id: &Value) -> String {
    id.to_string()
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for `id`; fails once the transport is closed
    pub fn register(&self, id: &Value) -> Result<oneshot::Receiver<JsonRpcResponse>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(HubError::transport("Connection closed"));
        }
        let (tx, rx) = oneshot::channel();
        inner.waiting.insert(key_for(id), tx);
        Ok(rx)
    }

    /// Drop the slot for `id` without answering it
    pub fn cancel(&self, id: &Value) {
        self.inner.lock().waiting.remove(&key_for(id));
    }

    /// Hand a response to whoever is waiting for it
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id.as_ref() else {
            return false;
        };
        let sender = self.inner.lock().waiting.remove(&key_for(id));
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!(id = %id, "Response for unknown request id");
                false
            }
        }
    }

    /// Fail every waiter and refuse new registrations
    pub fn fail_all(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        // Dropping the senders wakes the receivers with an error.
        inner.waiting.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the response to `id`, bounded by `timeout`
    pub async fn wait(
        &self,
        id: &Value,
        rx: oneshot::Receiver<JsonRpcResponse>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(HubError::transport("Connection closed before response")),
            Err(_) => {
                self.cancel(id);
                Err(HubError::transport(format!(
                    "Request timed out after {}s",
                    timeout.as_secs_f32()
                )))
            }
        }
    }

    /// Route one incoming text message. Responses are matched to waiters;
    /// server-initiated requests and notifications are only logged.
    pub fn dispatch(&self, connection_id: &str, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Unparseable message from backend");
                return;
            }
        };

        if value.get("method").is_some() {
            debug!(
                connection_id = %connection_id,
                method = %value["method"],
                "Ignoring server-initiated message"
            );
            return;
        }

        match serde_json::from_value::<JsonRpcResponse>(value) {
            Ok(response) => {
                self.resolve(response);
            }
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Malformed response from backend");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_matches_id() {
        let pending = PendingRequests::new();
        let rx = pending.register(&json!(7)).unwrap();

        pending.dispatch("a", r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#);

        let response = pending
            .wait(&json!(7), rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["ok"], true);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_wakes_waiters() {
        let pending = PendingRequests::new();
        let rx = pending.register(&json!(1)).unwrap();
        pending.fail_all();

        let err = pending
            .wait(&json!(1), rx, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Transport(_)));
        assert!(pending.register(&json!(2)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_slot() {
        let pending = PendingRequests::new();
        let rx = pending.register(&json!("abc")).unwrap();
        let err = pending
            .wait(&json!("abc"), rx, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(pending.is_empty());
    }
}
