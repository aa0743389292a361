//! Stdio Transport
//!
//! Spawns a backend MCP server as a child process and speaks
//! newline-delimited JSON-RPC over its stdin/stdout.

use super::{BackendTransport, PendingRequests};
use crate::error::{HubError, Result};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Stdio transport - writes requests to the child's stdin, reads responses from stdout
pub struct StdioTransport {
    connection_id: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: Arc<PendingRequests>,
    closed_tx: Arc<watch::Sender<bool>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl StdioTransport {
    /// Spawn `command` and start reading its output
    pub async fn spawn(
        connection_id: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        info!(connection_id = %connection_id, command = %command, "Spawning stdio MCP server");

        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HubError::connection(connection_id, format!("Failed to spawn '{}': {}", command, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HubError::connection(connection_id, "Failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HubError::connection(connection_id, "Failed to get stdout handle"))?;

        if let Some(stderr) = child.stderr.take() {
            let id = connection_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(connection_id = %id, "stderr: {}", line);
                }
            });
        }

        let pending = Arc::new(PendingRequests::new());
        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let reader = {
            let pending = pending.clone();
            let closed_tx = closed_tx.clone();
            let id = connection_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if !line.is_empty() {
                                pending.dispatch(&id, line);
                            }
                        }
                        Ok(None) => {
                            info!(connection_id = %id, "Stdio server closed its output");
                            break;
                        }
                        Err(e) => {
                            warn!(connection_id = %id, error = %e, "Failed to read from stdio server");
                            break;
                        }
                    }
                }
                pending.fail_all();
                closed_tx.send_replace(true);
            })
        };

        Ok(Self {
            connection_id: connection_id.to_string(),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            pending,
            closed_tx,
            reader: parking_lot::Mutex::new(Some(reader)),
            request_timeout,
        })
    }

    async fn write_message(&self, message: &JsonRpcRequest) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| HubError::transport("Stdin not available"))?;
        stdin
            .write_all(&line)
            .await
            .map_err(|e| HubError::transport(format!("Failed to write to stdin: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| HubError::transport(format!("Failed to flush stdin: {}", e)))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BackendTransport for StdioTransport {
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| HubError::protocol("Request without id"))?;
        let rx = self.pending.register(&id)?;

        debug!(connection_id = %self.connection_id, method = %request.method, "stdio request");
        if let Err(e) = self.write_message(&request).await {
            self.pending.cancel(&id);
            return Err(e);
        }

        self.pending.wait(&id, rx, self.request_timeout).await
    }

    async fn notify(&self, notification: JsonRpcRequest) -> Result<()> {
        self.write_message(&notification).await
    }

    async fn close(&self) -> Result<()> {
        self.pending.fail_all();
        // Dropping stdin closes the pipe, which most servers treat as EOF.
        self.stdin.lock().await.take();

        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            handle.abort();
        }

        let result = match self.child.lock().await.take() {
            Some(mut child) => match child.try_wait() {
                Ok(Some(_)) => Ok(()),
                _ => child.kill().await.map_err(|e| {
                    HubError::transport(format!(
                        "Failed to stop stdio server '{}': {}",
                        self.connection_id, e
                    ))
                }),
            },
            None => Ok(()),
        };

        self.closed_tx.send_replace(true);
        result
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}
