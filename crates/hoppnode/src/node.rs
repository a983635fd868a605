use anyhow::{Context, Result};
use hoppmesh_protocol::{DeviceClass, Node, NodeId};
use hoppmesh_routing::{Collaborators, MeshNetwork};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::config::Config;
use crate::simulation::{LoggingForwarder, SimulatedTransport, StaticDiscoveryFeed};
use crate::storage::{load_ledger, save_ledger, FileMessageStore};

/// Build the local node description from configuration
///
/// Relay bots announce themselves under a `Relay-<id prefix>` name.
pub fn local_node(config: &Config) -> Result<Node> {
    let id = NodeId::new(config.node.id.as_str()).context("Invalid node id")?;
    let node = if config.node.relay_bot {
        let name = format!("Relay-{}", id.prefix(8));
        Node::new(id, name).with_device_class(DeviceClass::RelayBot)
    } else {
        Node::new(id, config.node.name.as_str()).with_device_class(DeviceClass::Computer)
    };
    Ok(node
        .with_internet(config.node.internet_access)
        .with_trust(1.0))
}

/// Main node orchestrator
pub struct HoppNode {
    config: Config,
    network: MeshNetwork,
    store: Arc<FileMessageStore>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl HoppNode {
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing node components...");

        let local = local_node(&config)?;

        let store = Arc::new(FileMessageStore::new(config.outbox_dir()).await?);
        info!("✓ Outbox initialized");

        let ledger = load_ledger(&config.ledger_path(), config.router.ledger_capacity).await?;
        info!("✓ Performance ledger loaded ({} paths)", ledger.len());

        let feed = StaticDiscoveryFeed::new(local.id.clone(), &config.peers)?;
        info!("✓ Discovery feed with {} configured peers", feed.peer_count());

        let collaborators = Collaborators {
            transport: Arc::new(SimulatedTransport::new(&config.simulation)),
            forwarder: Arc::new(LoggingForwarder::new(config.simulation.forward_method)),
            store: store.clone(),
        };

        let network = MeshNetwork::new(local, config.router.clone(), collaborators, Arc::new(feed))
            .await?
            .with_ledger(ledger);
        info!("✓ Mesh network initialized");

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Ok(Self {
            config,
            network,
            store,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn network(&self) -> &MeshNetwork {
        &self.network
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Starting HoppNode services...");
        self.network.start().await?;

        let local = self.network.status().await.local_node;
        info!("═══════════════════════════════════════════════");
        info!("  HoppNode is now running");
        info!("═══════════════════════════════════════════════");
        info!("  Node: {} ({})", local.name, local.id);
        info!("  Device: {:?}", local.device_class);
        info!("  Data Dir: {}", self.config.data_directory.display());
        info!("═══════════════════════════════════════════════");

        self.wait_for_shutdown().await;

        info!("Shutting down HoppNode...");
        self.shutdown().await
    }

    async fn wait_for_shutdown(&mut self) {
        let period = Duration::from_secs(self.config.node.status_interval_secs.max(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires at once; skip it so the banner stands alone
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C signal");
                    break;
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.log_status().await;
                }
            }
        }
    }

    async fn log_status(&self) {
        let status = self.network.status().await;
        let stats = self.network.stats().await;
        let outbox = match self.store.pending_count().await {
            Ok(count) => count,
            Err(e) => {
                error!("Failed to inspect outbox: {}", e);
                0
            }
        };
        info!(
            "Status: {} nodes, {} links, {} gateways, {} queued, {} in outbox | delivered {}, stored {}, dropped {}",
            status.discovered_node_count,
            status.active_connection_count,
            status.gateway_count,
            status.queued_message_count,
            outbox,
            stats.messages_delivered,
            stats.messages_stored,
            stats.messages_dropped,
        );
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!("Stopping mesh network...");
        if let Some(ledger) = self.network.shutdown().await {
            info!("Saving performance ledger...");
            save_ledger(&self.config.ledger_path(), &ledger).await?;
        }

        info!("Shutdown complete");
        Ok(())
    }

    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }
}
