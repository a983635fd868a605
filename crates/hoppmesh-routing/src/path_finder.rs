//! Weighted shortest-path search over a topology snapshot
//!
//! A single Dijkstra pass from the origin reaches every requested target.
//! Edge weights depend on the message being routed (bulk payloads are
//! penalised on thin links), so they are recomputed on every traversal
//! instead of being stored on the graph. The weighting is a fixed heuristic
//! identified by [`EDGE_WEIGHTING_VERSION`]; nothing here is learned.

use hoppmesh_protocol::{Edge, Message, NodeId, Route};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};

use crate::error::{Result, RoutingError};
use crate::topology::TopologyGraph;

/// Version tag of [`edge_weight`]
pub const EDGE_WEIGHTING_VERSION: &str = "edge-heuristic-v1";

/// Bandwidth (kbit/s) at which a bulk payload pays no penalty
pub const BULK_BANDWIDTH_REFERENCE: f64 = 100.0;

/// Estimated delivery time contributed by each node on a path
pub const DELIVERY_MS_PER_NODE: u64 = 2000;

/// Battery floor used when estimating energy cost
pub const MIN_BATTERY_LEVEL: f64 = 0.1;

/// Cost of traversing `edge` with `message`
///
/// `(2 - reliability)`, multiplied by `100 / max(bandwidth, 1)` when the
/// message is large.
pub fn edge_weight(edge: &Edge, message: &Message) -> f64 {
    let mut weight = 2.0 - edge.reliability;
    if message.is_large() {
        weight *= BULK_BANDWIDTH_REFERENCE / edge.bandwidth.max(1.0);
    }
    weight
}

/// Nodes a message should be routed towards
///
/// The recipient when it is known, plus every gateway when the message needs
/// the internet or is an SOS. The origin is never its own target.
pub fn targets_for(origin: &NodeId, message: &Message, graph: &TopologyGraph) -> BTreeSet<NodeId> {
    let mut targets = BTreeSet::new();

    if message.needs_gateway() {
        targets.extend(graph.gateway_ids());
    }

    if let Some(recipient) = message.recipient.node_id() {
        if graph.contains(recipient) {
            targets.insert(recipient.clone());
        }
    }

    targets.remove(origin);
    targets
}

/// Derive route metrics from a path
///
/// Reliability multiplies `(trust + 0.5) / 1.5` over the known nodes, so it
/// can only shrink as the path grows.
pub fn build_route(path: Vec<NodeId>, graph: &TopologyGraph) -> Result<Route> {
    let mut reliability = 1.0;
    let mut energy_cost = 0.0;
    let mut has_internet = false;

    for node in path.iter().filter_map(|id| graph.node(id)) {
        reliability *= (node.trust_score + 0.5) / 1.5;
        energy_cost += 1.0 / node.battery_level.max(MIN_BATTERY_LEVEL);
        has_internet |= node.has_internet_access;
    }

    let estimated_delivery_ms = path.len() as u64 * DELIVERY_MS_PER_NODE;
    Route::new(
        path,
        reliability,
        estimated_delivery_ms,
        energy_cost,
        has_internet,
    )
    .map_err(RoutingError::from)
}

/// Best known way to reach a node during the search
#[derive(Debug, Clone)]
struct Label {
    cost: f64,
    path: Vec<NodeId>,
}

impl Label {
    /// Lower cost, then fewer hops, then the lexicographically smaller path
    fn rank(&self, other: &Label) -> Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then_with(|| self.path.len().cmp(&other.path.len()))
            .then_with(|| self.path.cmp(&other.path))
    }
}

/// Min-heap adapter for [`Label`]
struct Frontier(Label);

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.rank(&self.0)
    }
}

/// Dijkstra-based route discovery
#[derive(Debug, Clone, Default)]
pub struct PathFinder;

impl PathFinder {
    pub fn new() -> Self {
        PathFinder
    }

    /// One route per reachable target, ordered by target id
    ///
    /// Unreachable targets are skipped; an unknown origin yields nothing.
    pub fn find_routes(
        &self,
        origin: &NodeId,
        targets: &BTreeSet<NodeId>,
        message: &Message,
        graph: &TopologyGraph,
    ) -> Result<Vec<Route>> {
        if targets.is_empty() || !graph.contains(origin) {
            return Ok(Vec::new());
        }

        let mut best: HashMap<NodeId, Label> = HashMap::new();
        let mut settled: HashSet<NodeId> = HashSet::new();
        let mut found: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        let mut heap = BinaryHeap::new();

        let start = Label {
            cost: 0.0,
            path: vec![origin.clone()],
        };
        best.insert(origin.clone(), start.clone());
        heap.push(Frontier(start));

        while let Some(Frontier(label)) = heap.pop() {
            let current = label.path[label.path.len() - 1].clone();
            if !settled.insert(current.clone()) {
                continue;
            }

            if targets.contains(&current) {
                found.insert(current.clone(), label.path.clone());
                if found.len() == targets.len() {
                    break;
                }
            }

            for edge in graph.edges_from(&current) {
                if settled.contains(&edge.to) || !graph.contains(&edge.to) {
                    continue;
                }

                let mut path = label.path.clone();
                path.push(edge.to.clone());
                let candidate = Label {
                    cost: label.cost + edge_weight(edge, message),
                    path,
                };

                let improves = best
                    .get(&edge.to)
                    .map_or(true, |known| candidate.rank(known) == Ordering::Less);
                if improves {
                    best.insert(edge.to.clone(), candidate.clone());
                    heap.push(Frontier(candidate));
                }
            }
        }

        found
            .into_values()
            .map(|path| build_route(path, graph))
            .collect()
    }
}
