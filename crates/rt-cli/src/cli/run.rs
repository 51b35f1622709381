//! Listen / Send Command Implementation

use anyhow::{Context, Result};
use rt_core::brand::PRODUCT_NAME;
use rt_core::{RtcPeerFactory, SocketIoClient, TunnelConfig};
use rt_daemon::{OrchestratorCommand, OrchestratorEvent, TunnelMode, TunnelOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Run the orchestrator in `mode` until Ctrl-C
pub async fn run(config_path: Option<PathBuf>, mode: TunnelMode) -> Result<()> {
    let path = match config_path {
        Some(path) => path,
        None => TunnelConfig::locate().context("no configuration file found")?,
    };
    let config = TunnelConfig::load(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config.validate()?;

    info!("{} {:?} mode, config {}", PRODUCT_NAME, mode, path.display());
    if mode == TunnelMode::Listen {
        for mapping in &config.mapping {
            info!("Mapping {}", mapping);
        }
    }

    let signaling = Arc::new(SocketIoClient::connect(config.signaling()));
    let peers = Arc::new(RtcPeerFactory::new());

    let mut orchestrator = TunnelOrchestrator::new(config, mode, signaling, peers);
    let command_tx = orchestrator.command_sender();
    let event_rx = orchestrator
        .take_event_receiver()
        .context("orchestrator events already taken")?;

    tokio::spawn(log_events(event_rx));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            let _ = command_tx.send(OrchestratorCommand::Shutdown).await;
        }
    });

    orchestrator.run().await?;
    Ok(())
}

async fn log_events(mut event_rx: mpsc::Receiver<OrchestratorEvent>) {
    while let Some(event) = event_rx.recv().await {
        match event {
            OrchestratorEvent::Listening { id, address, mapping } => {
                info!("Session {}: {} => {}", id, address, mapping.remote_addr());
            }
            OrchestratorEvent::SessionClosed { id, role, reason } => {
                warn!("{} session {} closed: {}", role, id, reason);
            }
            OrchestratorEvent::Error { message } => error!("{}", message),
            OrchestratorEvent::Shutdown => break,
            _ => {}
        }
    }
}
