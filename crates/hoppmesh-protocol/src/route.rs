//! Candidate routes through the mesh

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::types::NodeId;

/// Separator used when joining a path into a ledger key
pub const PATH_KEY_SEPARATOR: &str = "-";

/// An ordered path from sender to target plus derived quality metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    path: Vec<NodeId>,
    /// Product of per-node factors along the path (0.0-1.0)
    pub reliability: f64,
    pub estimated_delivery_ms: u64,
    pub energy_cost: f64,
    /// Path terminates at or passes through an internet gateway
    pub has_internet_path: bool,
}

impl Route {
    pub fn new(
        path: Vec<NodeId>,
        reliability: f64,
        estimated_delivery_ms: u64,
        energy_cost: f64,
        has_internet_path: bool,
    ) -> Result<Self> {
        if path.is_empty() {
            return Err(ProtocolError::EmptyRoute);
        }
        Ok(Route {
            path,
            reliability,
            estimated_delivery_ms,
            energy_cost,
            has_internet_path,
        })
    }

    /// The "nothing reachable, stay local" route
    pub fn local(origin: NodeId) -> Self {
        Route {
            path: vec![origin],
            reliability: 0.0,
            estimated_delivery_ms: 0,
            energy_cost: 0.0,
            has_internet_path: false,
        }
    }

    pub fn path(&self) -> &[NodeId] {
        &self.path
    }

    pub fn hop_count(&self) -> usize {
        self.path.len() - 1
    }

    pub fn is_local(&self) -> bool {
        self.path.len() == 1
    }

    pub fn origin(&self) -> &NodeId {
        &self.path[0]
    }

    pub fn target(&self) -> &NodeId {
        &self.path[self.path.len() - 1]
    }

    /// First node after the origin
    pub fn next_hop(&self) -> Option<&NodeId> {
        self.path.get(1)
    }

    /// Identity of this path in the performance ledger
    pub fn path_key(&self) -> String {
        self.path
            .iter()
            .map(NodeId::as_str)
            .collect::<Vec<_>>()
            .join(PATH_KEY_SEPARATOR)
    }
}
