//! Application context
//!
//! Everything the hub needs at runtime is built once here and handed to the
//! HTTP layer. Nothing in the crate reaches for a global.

use crate::config::HubConfig;
use crate::error::Result;
use crate::groups::GroupExposure;
use crate::orchestrator::{HubOrchestrator, InitReport};
use crate::transport::{Connector, TransportConnector};
use crate::validation::ValidationKeyStore;
use axum::Router;
use std::sync::Arc;
use tracing::{info, warn};

pub struct HubContext {
    config: HubConfig,
    hub: Arc<HubOrchestrator>,
    keys: Arc<ValidationKeyStore>,
    groups: Arc<GroupExposure>,
}

impl HubContext {
    /// Build the context around `connector` and connect every enabled
    /// backend. Fails on configuration errors, or when backends are required
    /// and none came up.
    pub async fn initialize(
        config: HubConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, InitReport)> {
        // Groups reference servers by id, so reject a bad file before spawning anything
        config.validate()?;

        let hub = Arc::new(HubOrchestrator::new(connector, config.reconnect));
        let keys = Arc::new(ValidationKeyStore::new());
        let groups = Arc::new(GroupExposure::from_config(
            hub.clone(),
            keys.clone(),
            &config.groups,
        )?);

        let report = hub.initialize_from_config(&config).await?;
        info!(
            groups = config.groups.len(),
            connected = report.connected,
            attempted = report.attempted,
            "Hub context ready"
        );

        Ok((
            Self {
                config,
                hub,
                keys,
                groups,
            },
            report,
        ))
    }

    /// [`initialize`](Self::initialize) with the real stdio/SSE/WebSocket transports
    pub async fn with_transports(config: HubConfig) -> Result<(Self, InitReport)> {
        let connector = Arc::new(TransportConnector::new(config.request_timeout()));
        Self::initialize(config, connector).await
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<HubOrchestrator> {
        &self.hub
    }

    pub fn keys(&self) -> &Arc<ValidationKeyStore> {
        &self.keys
    }

    pub fn groups(&self) -> &Arc<GroupExposure> {
        &self.groups
    }

    pub fn router(&self) -> Router {
        crate::http::router(self.groups.clone())
    }

    /// Close every backend. Safe to call more than once.
    pub async fn shutdown(&self) {
        let failures = self.hub.shutdown().await;
        for (connection_id, error) in &failures {
            warn!(connection_id = %connection_id, error = %error, "Backend did not close cleanly");
        }
        info!("Hub context shut down");
    }
}
