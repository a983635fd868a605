//! Topology store: known nodes and the links between them
//!
//! Discovery writes, the router reads. Readers never see a half-applied
//! update: every routing decision is made against an immutable
//! [`TopologyGraph`] snapshot. Writers clone-on-write behind the lock, so a
//! snapshot handed out earlier keeps its view after later mutations.

use chrono::{DateTime, Duration, Utc};
use hoppmesh_protocol::node::DEFAULT_TRUST_SCORE;
use hoppmesh_protocol::{Edge, Node, NodeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::error::Result;

/// Result of [`TopologyStore::upsert_node`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeUpsert {
    Inserted,
    Refreshed,
}

/// Result of [`TopologyStore::upsert_edge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeUpsert {
    Inserted,
    Refreshed,
    /// One of the endpoints is not a known node
    Dropped,
}

/// Immutable view of the mesh
#[derive(Debug, Clone, Default)]
pub struct TopologyGraph {
    nodes: HashMap<NodeId, Node>,
    edges: HashMap<NodeId, Vec<Edge>>,
}

impl TopologyGraph {
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Outgoing edges of a node
    pub fn edges_from(&self, id: &NodeId) -> &[Edge] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    /// Direct neighbors of a node, sorted
    pub fn neighbors(&self, id: &NodeId) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.edges_from(id).iter().map(|e| e.to.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Nodes with internet access, sorted
    pub fn gateway_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.has_internet_access)
            .map(|n| n.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn gateway_count(&self) -> usize {
        self.nodes.values().filter(|n| n.has_internet_access).count()
    }

    /// Trust score of a node, or the neutral default when unknown
    pub fn trust_of(&self, id: &NodeId) -> f64 {
        self.nodes
            .get(id)
            .map(|n| n.trust_score)
            .unwrap_or(DEFAULT_TRUST_SCORE)
    }

    fn upsert_node(&mut self, node: Node) -> NodeUpsert {
        match self.nodes.get_mut(&node.id) {
            Some(existing) => {
                existing.refresh_from(node);
                NodeUpsert::Refreshed
            }
            None => {
                self.nodes.insert(node.id.clone(), node);
                NodeUpsert::Inserted
            }
        }
    }

    fn upsert_edge(&mut self, edge: Edge) -> EdgeUpsert {
        if !self.contains(&edge.from) || !self.contains(&edge.to) {
            return EdgeUpsert::Dropped;
        }

        let out = self.edges.entry(edge.from.clone()).or_default();
        match out.iter_mut().find(|e| e.to == edge.to) {
            Some(existing) => {
                *existing = edge;
                EdgeUpsert::Refreshed
            }
            None => {
                out.push(edge);
                EdgeUpsert::Inserted
            }
        }
    }

    fn remove_node(&mut self, id: &NodeId) {
        self.nodes.remove(id);
        self.edges.remove(id);
        for out in self.edges.values_mut() {
            out.retain(|e| &e.to != id);
        }
    }
}

/// Shared, read-mostly topology with snapshot reads
pub struct TopologyStore {
    graph: RwLock<Arc<TopologyGraph>>,
    gateways_tx: watch::Sender<usize>,
}

impl TopologyStore {
    pub fn new() -> Self {
        let (gateways_tx, _) = watch::channel(0);
        TopologyStore {
            graph: RwLock::new(Arc::new(TopologyGraph::default())),
            gateways_tx,
        }
    }

    /// Insert a node or refresh its reported attributes
    ///
    /// The stored trust score survives refreshes.
    pub async fn upsert_node(&self, node: Node) -> Result<NodeUpsert> {
        node.validate()?;

        let mut guard = self.graph.write().await;
        let graph = Arc::make_mut(&mut guard);
        let outcome = graph.upsert_node(node);
        self.publish_gateways(graph);
        Ok(outcome)
    }

    /// Insert or refresh a directed edge
    ///
    /// Edges that reference an unknown node are dropped whole.
    pub async fn upsert_edge(&self, edge: Edge) -> Result<EdgeUpsert> {
        edge.validate()?;

        let mut guard = self.graph.write().await;
        if !guard.contains(&edge.from) || !guard.contains(&edge.to) {
            debug!("Dropping edge {} -> {}: unknown endpoint", edge.from, edge.to);
            return Ok(EdgeUpsert::Dropped);
        }
        Ok(Arc::make_mut(&mut guard).upsert_edge(edge))
    }

    /// Insert an edge in both directions
    pub async fn upsert_link(&self, edge: Edge) -> Result<EdgeUpsert> {
        edge.validate()?;
        let reverse = edge.reversed();

        let mut guard = self.graph.write().await;
        if !guard.contains(&edge.from) || !guard.contains(&edge.to) {
            debug!("Dropping link {} <-> {}: unknown endpoint", edge.from, edge.to);
            return Ok(EdgeUpsert::Dropped);
        }
        let graph = Arc::make_mut(&mut guard);
        let outcome = graph.upsert_edge(edge);
        graph.upsert_edge(reverse);
        Ok(outcome)
    }

    /// Remove nodes not seen within `window`, along with their edges
    ///
    /// `keep` is never evicted (the local node). Returns the evicted ids.
    pub async fn evict_stale(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        keep: &NodeId,
    ) -> Vec<NodeId> {
        let mut guard = self.graph.write().await;
        let stale: Vec<NodeId> = guard
            .nodes()
            .filter(|n| &n.id != keep && n.is_stale(now, window))
            .map(|n| n.id.clone())
            .collect();

        if stale.is_empty() {
            return stale;
        }

        let graph = Arc::make_mut(&mut guard);
        for id in &stale {
            graph.remove_node(id);
        }
        self.publish_gateways(graph);
        stale
    }

    /// Consistent view for a single routing decision
    pub async fn snapshot(&self) -> Arc<TopologyGraph> {
        Arc::clone(&*self.graph.read().await)
    }

    /// Current gateways, always derived from node state
    pub async fn gateway_ids(&self) -> Vec<NodeId> {
        self.graph.read().await.gateway_ids()
    }

    pub async fn node(&self, id: &NodeId) -> Option<Node> {
        self.graph.read().await.node(id).cloned()
    }

    /// Watch the number of gateways
    pub fn subscribe_gateways(&self) -> watch::Receiver<usize> {
        self.gateways_tx.subscribe()
    }

    fn publish_gateways(&self, graph: &TopologyGraph) {
        let count = graph.gateway_count();
        self.gateways_tx.send_if_modified(|current| {
            if *current != count {
                *current = count;
                true
            } else {
                false
            }
        });
    }
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new()
    }
}
