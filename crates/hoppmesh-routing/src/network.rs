//! Mesh network service
//!
//! Owns the topology store, the router loop and the discovery refresh for
//! one local node. Both periodic tasks are spawned by [`MeshNetwork::start`]
//! and stopped together by [`MeshNetwork::shutdown`].

use hoppmesh_protocol::{Message, MessageId, Node, NodeId, Priority, Recipient};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::RouterConfig;
use crate::discovery::{DiscoveryFeed, DiscoveryRefresher};
use crate::error::{Result, RoutingError};
use crate::ledger::PerformanceLedger;
use crate::router::{DeliveryReport, MessageOutcome, Router, RouterShared, RouterStats};
use crate::topology::TopologyStore;
use crate::transport::Collaborators;

/// Snapshot of the service for status displays
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkStatus {
    pub is_active: bool,
    /// Known nodes other than the local one
    pub discovered_node_count: usize,
    /// Direct neighbors of the local node
    pub active_connection_count: usize,
    pub gateway_count: usize,
    /// Accepted messages not yet delivered, stored or dropped
    pub queued_message_count: usize,
    pub local_node: Node,
}

/// A running (or ready to run) mesh node
pub struct MeshNetwork {
    local_node: Node,
    config: RouterConfig,
    topology: Arc<TopologyStore>,
    feed: Arc<dyn DiscoveryFeed>,
    shared: RouterShared,
    router: Mutex<Option<Router>>,
    shutdown_tx: broadcast::Sender<()>,
    router_task: RwLock<Option<JoinHandle<PerformanceLedger>>>,
    discovery_task: RwLock<Option<JoinHandle<()>>>,
    active: AtomicBool,
}

impl MeshNetwork {
    /// Build the service and register the local node in its topology
    pub async fn new(
        local_node: Node,
        config: RouterConfig,
        collaborators: Collaborators,
        feed: Arc<dyn DiscoveryFeed>,
    ) -> Result<Self> {
        let topology = Arc::new(TopologyStore::new());
        topology.upsert_node(local_node.clone()).await?;

        let router = Router::new(
            local_node.id.clone(),
            config.clone(),
            Arc::clone(&topology),
            collaborators,
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(MeshNetwork {
            shared: router.shared(),
            router: Mutex::new(Some(router)),
            local_node,
            config,
            topology,
            feed,
            shutdown_tx,
            router_task: RwLock::new(None),
            discovery_task: RwLock::new(None),
            active: AtomicBool::new(false),
        })
    }

    /// Seed the router with previously learned path history
    pub fn with_ledger(mut self, ledger: PerformanceLedger) -> Self {
        if let Some(router) = self.router.get_mut().take() {
            *self.router.get_mut() = Some(router.with_ledger(ledger));
        }
        self
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_node.id
    }

    pub fn topology(&self) -> Arc<TopologyStore> {
        Arc::clone(&self.topology)
    }

    /// Spawn the router loop and the discovery refresh
    ///
    /// A service can be started once; starting it again is an error.
    pub async fn start(&self) -> Result<()> {
        let router = self.router.lock().await.take().ok_or(RoutingError::Shutdown)?;

        info!(
            "Starting mesh network for {} ({})",
            self.local_node.name, self.local_node.id
        );

        let shutdown_rx = self.shutdown_tx.subscribe();
        let router_handle = tokio::spawn(router.run(shutdown_rx));
        *self.router_task.write().await = Some(router_handle);

        let refresher = DiscoveryRefresher::new(
            Arc::clone(&self.feed),
            Arc::clone(&self.topology),
            self.local_node.id.clone(),
            self.config.poll_timeout(),
            self.config.freshness_window(),
        );
        let period = self.config.discovery_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let discovery_handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Discovery refresh shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = refresher.refresh().await {
                            warn!("Discovery refresh failed: {}", e);
                        }
                    }
                }
            }
        });
        *self.discovery_task.write().await = Some(discovery_handle);

        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Queue a new message from the local node
    pub fn enqueue(
        &self,
        content: impl Into<String>,
        recipient: Recipient,
        priority: Priority,
        requires_internet: bool,
    ) -> MessageId {
        let ttl = self.config.ttl_for(priority.is_emergency());
        let message = Message::new(
            self.local_node.id.clone(),
            recipient,
            content,
            priority,
            requires_internet,
        )
        .with_ttl(ttl);
        self.enqueue_message(message)
    }

    /// Queue a fully built message as is
    pub fn enqueue_message(&self, message: Message) -> MessageId {
        self.shared.submit(message)
    }

    pub fn outcome(&self, id: &MessageId) -> Option<MessageOutcome> {
        self.shared.outcome(id)
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<DeliveryReport> {
        self.shared.subscribe()
    }

    pub async fn stats(&self) -> RouterStats {
        self.shared.stats().await
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> NetworkStatus {
        let graph = self.topology.snapshot().await;
        let local_id = &self.local_node.id;

        NetworkStatus {
            is_active: self.is_active(),
            discovered_node_count: graph.nodes().filter(|n| &n.id != local_id).count(),
            active_connection_count: graph.neighbors(local_id).len(),
            gateway_count: graph.gateway_count(),
            queued_message_count: self.shared.pending(),
            local_node: graph
                .node(local_id)
                .cloned()
                .unwrap_or_else(|| self.local_node.clone()),
        }
    }

    /// Stop both tasks and wait for them
    ///
    /// Returns the router's ledger so it can be persisted, or `None` if the
    /// service was never started or already shut down.
    pub async fn shutdown(&self) -> Option<PerformanceLedger> {
        info!("Shutting down mesh network...");
        let _ = self.shutdown_tx.send(());
        self.active.store(false, Ordering::SeqCst);

        if let Some(handle) = self.discovery_task.write().await.take() {
            if let Err(e) = handle.await {
                warn!("Discovery task ended abnormally: {}", e);
            }
        }

        let handle = self.router_task.write().await.take()?;
        match handle.await {
            Ok(ledger) => {
                info!("Router stopped with {} learned paths", ledger.len());
                Some(ledger)
            }
            Err(e) => {
                warn!("Router task ended abnormally: {}", e);
                None
            }
        }
    }
}
