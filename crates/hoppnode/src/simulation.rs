//! Stand-in collaborators for running a node without radio hardware

use anyhow::Result;
use async_trait::async_trait;
use hoppmesh_protocol::{Edge, Message, Node, NodeId, Route};
use hoppmesh_routing::{DiscoveryEvent, DiscoveryFeed, InternetForwarder, RoutingError, Transport};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{ForwardMethod, PeerConfig, SimulationConfig};

/// Transport that accepts a configurable share of sends after a random delay
pub struct SimulatedTransport {
    success_rate: f64,
    min_latency_ms: u64,
    max_latency_ms: u64,
}

impl SimulatedTransport {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            success_rate: config.success_rate.clamp(0.0, 1.0),
            min_latency_ms: config.min_latency_ms,
            max_latency_ms: config.max_latency_ms.max(config.min_latency_ms),
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn send(&self, route: &Route, message: &Message) -> hoppmesh_routing::Result<()> {
        let (latency, accepted) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(self.min_latency_ms..=self.max_latency_ms),
                rng.gen_bool(self.success_rate),
            )
        };
        tokio::time::sleep(Duration::from_millis(latency)).await;

        if accepted {
            debug!("Sent {} over {} in {}ms", message.id, route.path_key(), latency);
            Ok(())
        } else {
            Err(RoutingError::AttemptFailed {
                path: route.path_key(),
                reason: "simulated link loss".to_string(),
            })
        }
    }
}

/// Forwarder that logs the hand-off instead of contacting a real service
pub struct LoggingForwarder {
    method: ForwardMethod,
    forwarded: AtomicU64,
}

impl LoggingForwarder {
    pub fn new(method: ForwardMethod) -> Self {
        Self {
            method,
            forwarded: AtomicU64::new(0),
        }
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl InternetForwarder for LoggingForwarder {
    async fn forward(&self, gateway: &NodeId, message: &Message) -> hoppmesh_routing::Result<()> {
        info!(
            "Forwarding {} to the internet via {} through gateway {}",
            message.id, self.method, gateway
        );
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Discovery feed that re-announces configured peers on every poll
///
/// Each peer is sighted afresh with the current time, so configured peers
/// never age out of the topology while the node runs.
pub struct StaticDiscoveryFeed {
    local_id: NodeId,
    peers: Vec<(NodeId, PeerConfig)>,
}

impl StaticDiscoveryFeed {
    pub fn new(local_id: NodeId, peers: &[PeerConfig]) -> Result<Self> {
        let peers = peers
            .iter()
            .map(|peer| Ok((NodeId::new(peer.id.as_str())?, peer.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { local_id, peers })
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[async_trait]
impl DiscoveryFeed for StaticDiscoveryFeed {
    async fn poll(&self) -> hoppmesh_routing::Result<Vec<DiscoveryEvent>> {
        let mut events = Vec::with_capacity(self.peers.len() * 2);
        for (id, peer) in &self.peers {
            let node = Node::new(id.clone(), peer.name.as_str())
                .with_internet(peer.internet_access)
                .with_trust(peer.trust);
            events.push(DiscoveryEvent::NodeSighting(node));
        }
        for (id, peer) in &self.peers {
            events.push(DiscoveryEvent::Link(Edge::new(
                self.local_id.clone(),
                id.clone(),
                peer.reliability,
                peer.bandwidth,
                peer.transport,
            )));
        }
        Ok(events)
    }
}
