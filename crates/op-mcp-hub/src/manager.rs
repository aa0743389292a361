//! Connection manager
//!
//! Owns every backend [`Connection`], drives its state machine and retries
//! failed or dropped connections with exponential backoff.
//!
//! Each connection carries a generation number drawn from one manager-wide
//! counter, so a number is never handed out twice, not even to an id that
//! was removed and registered again. Anything that changes who "owns" a
//! connection (a new attempt, a disconnect, a removal) takes a fresh one, and
//! every background task (reconnect timer, transport monitor, in-flight
//! attempt) checks it before touching state. A task from an older
//! generation just goes away.

use crate::client::BackendClient;
use crate::config::{validate_connection_id, TransportConfig};
use crate::connection::{Connection, ConnectionStatus, PoolStats, ReconnectPolicy};
use crate::error::{HubError, Result};
use crate::protocol::ToolDefinition;
use crate::transport::Connector;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receives discovery results and losses from the manager.
///
/// Called synchronously while the manager holds its own lock, so
/// implementations must not block or call back into the manager.
pub trait ConnectionObserver: Send + Sync {
    /// A connection finished its handshake and reported `tools`. Returns
    /// the descriptors that were rejected.
    fn tools_discovered(&self, connection_id: &str, tools: &[ToolDefinition]) -> Vec<HubError>;

    /// A connection is no longer reachable
    fn connection_lost(&self, connection_id: &str);
}

/// Observer that ignores everything
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {
    fn tools_discovered(&self, _connection_id: &str, _tools: &[ToolDefinition]) -> Vec<HubError> {
        Vec::new()
    }

    fn connection_lost(&self, _connection_id: &str) {}
}

/// Status change notification
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub connection_id: String,
    pub status: ConnectionStatus,
    pub at: DateTime<Utc>,
}

/// Outcome of one registration in a batch
#[derive(Debug)]
pub struct RegistrationOutcome {
    pub id: String,
    pub result: Result<Connection>,
}

impl RegistrationOutcome {
    pub fn is_connected(&self) -> bool {
        self.result
            .as_ref()
            .map(|c| c.status.is_connected())
            .unwrap_or(false)
    }
}

struct Entry {
    connection: Connection,
    client: Option<Arc<BackendClient>>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl Entry {
    fn new(id: &str, transport_config: TransportConfig, generation: u64) -> Self {
        Self {
            connection: Connection {
                id: id.to_string(),
                transport_config,
                status: ConnectionStatus::Disconnected,
                last_connected_at: None,
                last_error: None,
                reconnect_attempts: 0,
                discovered_tools: Vec::new(),
            },
            client: None,
            generation,
            timer: None,
            monitor: None,
        }
    }

    fn cancel_tasks(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

#[derive(Default)]
struct ManagerState {
    entries: HashMap<String, Entry>,
    // Registration order
    order: Vec<String>,
}

struct ManagerInner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    observer: Arc<dyn ConnectionObserver>,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<ConnectionEvent>,
    generations: AtomicU64,
}

/// Manages connections to backend MCP servers
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                policy,
                observer,
                state: Mutex::new(ManagerState::default()),
                events,
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Register a backend without connecting it
    pub fn add(&self, id: &str, transport_config: TransportConfig) -> Result<Connection> {
        validate_connection_id(id)?;

        let mut state = self.inner.state.lock();
        if state.entries.contains_key(id) {
            return Err(HubError::DuplicateConnection(id.to_string()));
        }
        let entry = Entry::new(id, transport_config, self.inner.next_generation());
        let snapshot = entry.connection.clone();
        state.entries.insert(id.to_string(), entry);
        state.order.push(id.to_string());
        debug!(connection_id = %id, transport = %snapshot.transport_config.kind_label(), "Registered connection");
        Ok(snapshot)
    }

    /// Register a backend and start connecting it in the background. The
    /// returned snapshot is `CONNECTING`; progress is visible through
    /// [`get_status`](Self::get_status) and [`subscribe`](Self::subscribe).
    pub fn register(&self, id: &str, transport_config: TransportConfig) -> Result<Connection> {
        self.add(id, transport_config)?;

        let snapshot = {
            let mut state = self.inner.state.lock();
            let entry = state
                .entries
                .get_mut(id)
                .ok_or_else(|| HubError::ConnectionNotFound(id.to_string()))?;
            self.inner.set_status(entry, ConnectionStatus::Connecting);
            entry.connection.clone()
        };

        let inner = self.inner.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let _ = inner.attempt(&id).await;
        });
        Ok(snapshot)
    }

    /// Register and connect a batch, waiting for every attempt to settle.
    /// One failure never stops the others.
    pub async fn register_all(
        &self,
        backends: Vec<(String, TransportConfig)>,
    ) -> Vec<RegistrationOutcome> {
        let mut outcomes = Vec::with_capacity(backends.len());
        let mut to_connect = Vec::new();

        for (id, transport_config) in backends {
            match self.add(&id, transport_config) {
                Ok(_) => to_connect.push(id),
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "Registration rejected");
                    outcomes.push(RegistrationOutcome { id, result: Err(e) });
                }
            }
        }

        let attempts = to_connect.into_iter().map(|id| async move {
            let result = self.inner.attempt(&id).await;
            RegistrationOutcome { id, result }
        });
        outcomes.extend(join_all(attempts).await);
        outcomes
    }

    /// Connect now. Cancels any pending reconnect timer and resets the
    /// attempt counter.
    pub async fn connect(&self, id: &str) -> Result<Connection> {
        {
            let mut state = self.inner.state.lock();
            let entry = state
                .entries
                .get_mut(id)
                .ok_or_else(|| HubError::ConnectionNotFound(id.to_string()))?;
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.connection.reconnect_attempts = 0;
        }
        info!(connection_id = %id, "Manual connect");
        self.inner.attempt(id).await
    }

    /// Close the transport and leave the connection `DISCONNECTED`.
    /// No reconnect is scheduled.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        let client = {
            let mut state = self.inner.state.lock();
            let entry = state
                .entries
                .get_mut(id)
                .ok_or_else(|| HubError::ConnectionNotFound(id.to_string()))?;
            entry.generation = self.inner.next_generation();
            entry.cancel_tasks();
            self.inner.set_status(entry, ConnectionStatus::Disconnected);
            self.inner.observer.connection_lost(id);
            entry.client.take()
        };

        info!(connection_id = %id, "Disconnected");
        close_client(id, client).await;
        Ok(())
    }

    /// Close and forget a connection
    pub async fn remove(&self, id: &str) -> Result<()> {
        let client = {
            let mut state = self.inner.state.lock();
            let mut entry = state
                .entries
                .remove(id)
                .ok_or_else(|| HubError::ConnectionNotFound(id.to_string()))?;
            state.order.retain(|existing| existing != id);
            entry.cancel_tasks();
            self.inner.observer.connection_lost(id);
            entry.client.take()
        };

        info!(connection_id = %id, "Removed connection");
        close_client(id, client).await;
        Ok(())
    }

    pub fn get_status(&self, id: &str) -> Result<ConnectionStatus> {
        self.get(id).map(|c| c.status)
    }

    pub fn get(&self, id: &str) -> Result<Connection> {
        self.inner
            .state
            .lock()
            .entries
            .get(id)
            .map(|e| e.connection.clone())
            .ok_or_else(|| HubError::ConnectionNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.state.lock().entries.contains_key(id)
    }

    /// Snapshot of every connection, in registration order
    pub fn list_all(&self) -> Vec<Connection> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(|e| e.connection.clone())
            .collect()
    }

    pub fn pool_stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let mut stats = PoolStats::default();
        for entry in state.entries.values() {
            stats.record(entry.connection.status);
        }
        stats
    }

    /// Client of a `CONNECTED` connection
    pub fn client(&self, id: &str) -> Option<Arc<BackendClient>> {
        let state = self.inner.state.lock();
        state
            .entries
            .get(id)
            .filter(|e| e.connection.status.is_connected())
            .and_then(|e| e.client.clone())
    }

    pub fn connected_ids(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter(|id| {
                state
                    .entries
                    .get(*id)
                    .map_or(false, |e| e.connection.status.is_connected())
            })
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.state.lock().order.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every connection and forget them all. Every close is attempted
    /// and awaited; failures are returned, not raised.
    pub async fn shutdown(&self) -> Vec<(String, HubError)> {
        let clients: Vec<(String, Arc<BackendClient>)> = {
            let mut state = self.inner.state.lock();
            let order = std::mem::take(&mut state.order);
            let mut clients = Vec::new();
            for id in order {
                let Some(mut entry) = state.entries.remove(&id) else {
                    continue;
                };
                entry.cancel_tasks();
                self.inner.observer.connection_lost(&id);
                self.inner.emit(&id, ConnectionStatus::Disconnected);
                if let Some(client) = entry.client.take() {
                    clients.push((id, client));
                }
            }
            state.entries.clear();
            clients
        };

        info!("Closing {} backend connections", clients.len());
        let closes = clients.iter().map(|(id, client)| async move {
            (id.clone(), client.close().await)
        });

        let mut failures = Vec::new();
        for (id, result) in join_all(closes).await {
            if let Err(e) = result {
                error!(connection_id = %id, error = %e, "Failed to close connection");
                failures.push((id, e));
            }
        }
        failures
    }
}

async fn close_client(id: &str, client: Option<Arc<BackendClient>>) {
    if let Some(client) = client {
        if let Err(e) = client.close().await {
            warn!(connection_id = %id, error = %e, "Error while closing transport");
        }
    }
}

impl ManagerInner {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn emit(&self, id: &str, status: ConnectionStatus) {
        let _ = self.events.send(ConnectionEvent {
            connection_id: id.to_string(),
            status,
            at: Utc::now(),
        });
    }

    fn set_status(&self, entry: &mut Entry, status: ConnectionStatus) {
        if entry.connection.status != status {
            entry.connection.status = status;
            self.emit(&entry.connection.id, status);
        }
    }

    /// One connection attempt: open the transport, handshake, discover tools,
    /// then mark `CONNECTED`. Strictly sequential for one connection.
    async fn attempt(self: &Arc<Self>, id: &str) -> Result<Connection> {
        let (generation, transport_config, previous) = {
            let mut state = self.state.lock();
            let entry = state
                .entries
                .get_mut(id)
                .ok_or_else(|| HubError::ConnectionNotFound(id.to_string()))?;
            entry.generation = self.next_generation();
            entry.cancel_tasks();
            let previous = entry.client.take();
            if previous.is_some() {
                self.observer.connection_lost(id);
            }
            self.set_status(entry, ConnectionStatus::Connecting);
            (
                entry.generation,
                entry.connection.transport_config.clone(),
                previous,
            )
        };
        close_client(id, previous).await;

        info!(connection_id = %id, transport = %transport_config.kind_label(), "Connecting");
        let outcome = self.handshake(id, &transport_config).await;

        let mut superseded = Vec::new();
        let result = {
            let mut state = self.state.lock();
            match state.entries.get_mut(id) {
                Some(entry) if entry.generation == generation => match outcome {
                    Ok((client, tools)) => {
                        let rejected = self.observer.tools_discovered(id, &tools);
                        entry.connection.last_connected_at = Some(Utc::now());
                        entry.connection.last_error = None;
                        entry.connection.reconnect_attempts = 0;
                        entry.connection.discovered_tools = tools;
                        if let Some(monitor) = entry.monitor.take() {
                            monitor.abort();
                        }
                        superseded.extend(entry.client.take());
                        entry.monitor = Some(self.spawn_monitor(id, generation, &client));
                        entry.client = Some(client);
                        self.set_status(entry, ConnectionStatus::Connected);
                        info!(
                            connection_id = %id,
                            tools = entry.connection.discovered_tools.len(),
                            rejected = rejected.len(),
                            "Connected"
                        );
                        Ok(entry.connection.clone())
                    }
                    Err(e) => {
                        warn!(connection_id = %id, error = %e, "Connection attempt failed");
                        entry.connection.last_error = Some(e.to_string());
                        self.set_status(entry, ConnectionStatus::Error);
                        self.schedule_reconnect(entry);
                        Err(e)
                    }
                },
                _ => {
                    if let Ok((client, _)) = outcome {
                        superseded.push(client);
                    }
                    debug!(connection_id = %id, "Discarding superseded connection attempt");
                    Err(HubError::connection(id, "Connection attempt was superseded"))
                }
            }
        };

        for client in superseded {
            close_client(id, Some(client)).await;
        }
        result
    }

    async fn handshake(
        &self,
        id: &str,
        transport_config: &TransportConfig,
    ) -> Result<(Arc<BackendClient>, Vec<ToolDefinition>)> {
        let transport = self
            .connector
            .connect(id, transport_config)
            .await
            .map_err(|e| as_connection_error(id, e))?;
        let client = Arc::new(BackendClient::new(id, transport));

        let discovered = async {
            client.initialize().await?;
            client.list_tools().await
        }
        .await;

        match discovered {
            Ok(tools) => Ok((client, tools)),
            Err(e) => {
                close_client(id, Some(client)).await;
                Err(as_connection_error(id, e))
            }
        }
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        id: &str,
        generation: u64,
        client: &BackendClient,
    ) -> JoinHandle<()> {
        let mut closed = client.closed();
        let inner = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            // A dropped sender counts as closed too.
            let _ = closed.wait_for(|c| *c).await;
            inner.connection_lost(&id, generation).await;
        })
    }

    async fn connection_lost(self: &Arc<Self>, id: &str, generation: u64) {
        let client = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(id) else {
                return;
            };
            if entry.generation != generation || !entry.connection.status.is_connected() {
                return;
            }
            // This runs inside the monitor task; drop its handle rather than abort it.
            entry.monitor = None;
            entry.connection.last_error = Some("Transport closed".to_string());
            self.set_status(entry, ConnectionStatus::Disconnected);
            self.observer.connection_lost(id);
            self.schedule_reconnect(entry);
            entry.client.take()
        };

        warn!(connection_id = %id, "Connection lost");
        close_client(id, client).await;
    }

    /// Arm the backoff timer for `entry`, unless its attempts are used up
    fn schedule_reconnect(self: &Arc<Self>, entry: &mut Entry) {
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }

        let id = entry.connection.id.clone();
        if !self.policy.allows(entry.connection.reconnect_attempts) {
            warn!(
                connection_id = %id,
                attempts = entry.connection.reconnect_attempts,
                "Reconnect attempts exhausted, waiting for a manual connect"
            );
            return;
        }

        entry.connection.reconnect_attempts += 1;
        let attempt = entry.connection.reconnect_attempts;
        let delay = self.policy.delay_for(attempt);
        let expected = entry.generation;
        debug!(connection_id = %id, attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

        let inner = Arc::clone(self);
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let current = {
                let mut state = inner.state.lock();
                match state.entries.get_mut(&id) {
                    Some(entry) if entry.generation == expected => {
                        // Detach this task's own handle so the attempt doesn't abort it.
                        entry.timer = None;
                        true
                    }
                    _ => false,
                }
            };

            if current {
                let _ = inner.attempt(&id).await;
            }
        }));
    }
}

fn as_connection_error(id: &str, error: HubError) -> HubError {
    match error {
        HubError::Connection { .. } => error,
        other => HubError::connection(id, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BackendTransport;

    struct Unreachable;

    #[async_trait::async_trait]
    impl Connector for Unreachable {
        async fn connect(
            &self,
            connection_id: &str,
            _config: &TransportConfig,
        ) -> Result<Arc<dyn BackendTransport>> {
            Err(HubError::connection(connection_id, "unreachable"))
        }
    }

    fn manager() -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(Unreachable),
            ReconnectPolicy::disabled(),
            Arc::new(NoopObserver),
        )
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates_and_bad_ids() {
        let manager = manager();
        manager.add("a", TransportConfig::stdio("x", vec![])).unwrap();

        assert!(matches!(
            manager.add("a", TransportConfig::stdio("y", vec![])),
            Err(HubError::DuplicateConnection(_))
        ));
        assert!(matches!(
            manager.add("bad_id", TransportConfig::stdio("y", vec![])),
            Err(HubError::Config(_))
        ));
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.get_status("a").unwrap(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_connect_sets_error() {
        let manager = manager();
        manager.add("a", TransportConfig::stdio("x", vec![])).unwrap();

        let err = manager.connect("a").await.unwrap_err();
        assert!(matches!(err, HubError::Connection { .. }));

        let connection = manager.get("a").unwrap();
        assert_eq!(connection.status, ConnectionStatus::Error);
        assert!(connection.last_error.unwrap().contains("unreachable"));
        assert_eq!(connection.reconnect_attempts, 0);
        assert!(manager.client("a").is_none());
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let manager = manager();
        assert!(matches!(
            manager.connect("nope").await,
            Err(HubError::ConnectionNotFound(_))
        ));
        assert!(manager.remove("nope").await.is_err());
        assert!(manager.get_status("nope").is_err());
    }
}
