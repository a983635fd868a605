//! Discovery ingestion
//!
//! A [`DiscoveryFeed`] reports what the radios have seen; each refresh polls
//! it under a timeout, applies the events to the [`TopologyStore`], and then
//! evicts nodes that have fallen out of the freshness window.

use async_trait::async_trait;
use chrono::Utc;
use hoppmesh_protocol::{Edge, Node, NodeId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, RoutingError};
use crate::topology::{EdgeUpsert, NodeUpsert, TopologyStore};
use crate::transport::bounded;

/// One observation from the discovery layer
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// A node was sighted, possibly with fresh attributes
    NodeSighting(Node),
    /// Quality report for one direction of a link
    EdgeQuality(Edge),
    /// A symmetric link, applied in both directions
    Link(Edge),
}

/// Source of discovery events
#[async_trait]
pub trait DiscoveryFeed: Send + Sync {
    /// Events observed since the last poll
    async fn poll(&self) -> Result<Vec<DiscoveryEvent>>;
}

/// What one refresh changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub nodes_inserted: usize,
    pub nodes_refreshed: usize,
    pub edges_applied: usize,
    pub edges_dropped: usize,
    pub rejected: usize,
    pub evicted: Vec<NodeId>,
}

/// Apply events in order; sightings should precede the edges that use them
pub async fn apply_events(
    store: &TopologyStore,
    events: Vec<DiscoveryEvent>,
    summary: &mut RefreshSummary,
) {
    for event in events {
        let outcome = match event {
            DiscoveryEvent::NodeSighting(node) => {
                store.upsert_node(node).await.map(|o| match o {
                    NodeUpsert::Inserted => summary.nodes_inserted += 1,
                    NodeUpsert::Refreshed => summary.nodes_refreshed += 1,
                })
            }
            DiscoveryEvent::EdgeQuality(edge) => {
                store.upsert_edge(edge).await.map(|o| tally(o, summary))
            }
            DiscoveryEvent::Link(edge) => store.upsert_link(edge).await.map(|o| tally(o, summary)),
        };

        if let Err(e) = outcome {
            warn!("Rejected discovery event: {}", e);
            summary.rejected += 1;
        }
    }
}

fn tally(outcome: EdgeUpsert, summary: &mut RefreshSummary) {
    match outcome {
        EdgeUpsert::Inserted | EdgeUpsert::Refreshed => summary.edges_applied += 1,
        EdgeUpsert::Dropped => summary.edges_dropped += 1,
    }
}

/// Periodic topology refresh driven by one feed
pub struct DiscoveryRefresher {
    feed: Arc<dyn DiscoveryFeed>,
    topology: Arc<TopologyStore>,
    local_id: NodeId,
    poll_timeout: Duration,
    freshness_window: chrono::Duration,
}

impl DiscoveryRefresher {
    pub fn new(
        feed: Arc<dyn DiscoveryFeed>,
        topology: Arc<TopologyStore>,
        local_id: NodeId,
        poll_timeout: Duration,
        freshness_window: chrono::Duration,
    ) -> Self {
        DiscoveryRefresher {
            feed,
            topology,
            local_id,
            poll_timeout,
            freshness_window,
        }
    }

    /// Poll, apply and evict once
    ///
    /// A failed or timed-out poll still runs eviction.
    pub async fn refresh(&self) -> Result<RefreshSummary> {
        let mut summary = RefreshSummary::default();

        let poll_error = match bounded(self.poll_timeout, self.feed.poll()).await {
            Ok(events) => {
                apply_events(&self.topology, events, &mut summary).await;
                None
            }
            Err(e) => Some(e),
        };

        summary.evicted = self
            .topology
            .evict_stale(Utc::now(), self.freshness_window, &self.local_id)
            .await;

        if !summary.evicted.is_empty() {
            info!("Evicted {} stale nodes", summary.evicted.len());
        }
        debug!(
            "Discovery refresh: {} new, {} refreshed, {} edges, {} dropped",
            summary.nodes_inserted,
            summary.nodes_refreshed,
            summary.edges_applied,
            summary.edges_dropped
        );

        match poll_error {
            Some(e) => Err(RoutingError::Discovery(e.to_string())),
            None => Ok(summary),
        }
    }
}
