//! op-mcp-hub: serve tool groups from many upstream MCP servers
//!
//!   op-mcp-hub --config /etc/op-mcp-hub/hub.yaml
//!   op-mcp-hub --config hub.json --bind 0.0.0.0:3100
//!   op-mcp-hub --config hub.json --check     # validate and exit
//!
//! Each configured group is served at `POST /{groupId}/mcp`.

use anyhow::{Context, Result};
use clap::Parser;
use op_mcp_hub::{HubConfig, HubContext};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "op-mcp-hub")]
#[command(about = "Aggregate MCP servers and expose tool groups")]
struct Cli {
    /// Configuration file (JSON, or YAML by extension)
    #[arg(long, short, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listen address, overrides `bind` from the configuration
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stderr, so nothing interleaves with a terminal-attached stdio backend
    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,op_mcp_hub=debug")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => HubConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => HubConfig::load_default().context("Failed to load default configuration")?,
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    let specs = config.validate().context("Invalid configuration")?;
    if cli.check {
        info!(
            servers = specs.len(),
            groups = config.groups.len(),
            "Configuration is valid"
        );
        return Ok(());
    }

    let bind = config.bind.clone();
    let (context, report) = HubContext::with_transports(config)
        .await
        .context("Failed to initialize hub")?;

    for (connection_id, reason) in &report.failed {
        warn!(connection_id = %connection_id, reason = %reason, "Backend not connected at startup");
    }
    for group in context.groups().list_groups() {
        info!(group_id = %group.id, path = %format!("/{}/mcp", group.id), "Serving group");
    }

    let served = op_mcp_hub::http::serve(&bind, context.groups().clone(), shutdown_signal()).await;
    context.shutdown().await;

    served.with_context(|| format!("HTTP server on {} failed", bind))?;
    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
