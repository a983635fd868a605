//! Decision assembly: from ranked routes to a single routing verdict

use hoppmesh_protocol::{Message, NodeId, Route};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, RoutingError};
use crate::ledger::PerformanceLedger;
use crate::path_finder::{targets_for, PathFinder};
use crate::scorer::{rank_routes, HeuristicScorer, ScoringModel};
use crate::topology::TopologyGraph;

/// Number of ranked alternatives kept behind the selected route
pub const MAX_ALTERNATIVES: usize = 3;

const SHORT_PATH_HOPS: usize = 2;
const CONFIDENCE_SHORT_PATH_HOPS: usize = 3;
const HIGH_RELIABILITY: f64 = 0.8;
const IMMEDIATE_RELIABILITY: f64 = 0.7;
const STORE_BELOW_RELIABILITY: f64 = 0.5;

/// Policy applied when every attempted route fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Immediate,
    Backoff,
    Broadcast,
    WaitForGateway,
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetryStrategy::Immediate => "immediate",
            RetryStrategy::Backoff => "backoff",
            RetryStrategy::Broadcast => "broadcast",
            RetryStrategy::WaitForGateway => "wait_for_gateway",
        };
        f.write_str(s)
    }
}

/// The router's verdict for one message
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub selected_route: Route,
    /// 0.0-1.0
    pub confidence: f64,
    pub reasoning: String,
    /// Next best routes, best first
    pub alternative_routes: Vec<Route>,
    /// Hold the message instead of attempting delivery
    pub should_store: bool,
    pub retry_strategy: RetryStrategy,
    /// Scoring model that ranked the routes
    pub model_version: &'static str,
}

impl RoutingDecision {
    /// Selected route followed by the alternatives
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        std::iter::once(&self.selected_route).chain(self.alternative_routes.iter())
    }
}

/// `0.6 × reliability`, `+0.3` for a required internet path, `+0.1` for
/// three hops or fewer, capped at 1.0
pub fn confidence(route: &Route, message: &Message) -> f64 {
    let mut confidence = route.reliability * 0.6;

    if route.has_internet_path && message.requires_internet {
        confidence += 0.3;
    }

    if route.hop_count() <= CONFIDENCE_SHORT_PATH_HOPS {
        confidence += 0.1;
    }

    confidence.min(1.0)
}

/// Human-readable justification built from route properties
pub fn reasoning(route: &Route, message: &Message) -> String {
    let mut reasons = Vec::new();

    if route.has_internet_path {
        reasons.push("Route has internet gateway access");
    }

    if route.hop_count() <= SHORT_PATH_HOPS {
        reasons.push("Short path with minimal hops");
    }

    if route.reliability > HIGH_RELIABILITY {
        reasons.push("High reliability based on node history");
    }

    if message.priority.is_emergency() {
        reasons.push("Emergency message prioritized");
    }

    if reasons.is_empty() {
        "Default routing selected".to_string()
    } else {
        reasons.join("; ")
    }
}

/// Whether the message should be held rather than attempted
pub fn should_store(route: &Route, message: &Message) -> bool {
    route.reliability < STORE_BELOW_RELIABILITY
        || (message.requires_internet && !route.has_internet_path)
}

/// Retry policy for when every attempt fails
pub fn retry_strategy(route: &Route, message: &Message, gateway_count: usize) -> RetryStrategy {
    if message.priority.is_emergency() {
        return RetryStrategy::Broadcast;
    }

    if route.has_internet_path && route.reliability > IMMEDIATE_RELIABILITY {
        return RetryStrategy::Immediate;
    }

    if gateway_count == 0 {
        return RetryStrategy::WaitForGateway;
    }

    RetryStrategy::Backoff
}

/// Path finder, scorer and assembler wired together
#[derive(Clone)]
pub struct DecisionEngine {
    path_finder: PathFinder,
    model: Arc<dyn ScoringModel>,
    max_alternatives: usize,
}

impl DecisionEngine {
    /// Engine using the built-in heuristic scorer
    pub fn new() -> Self {
        Self::with_model(Arc::new(HeuristicScorer))
    }

    pub fn with_model(model: Arc<dyn ScoringModel>) -> Self {
        DecisionEngine {
            path_finder: PathFinder::new(),
            model,
            max_alternatives: MAX_ALTERNATIVES,
        }
    }

    pub fn with_max_alternatives(mut self, max_alternatives: usize) -> Self {
        self.max_alternatives = max_alternatives;
        self
    }

    pub fn model_version(&self) -> &'static str {
        self.model.version()
    }

    /// Decide how `message` should leave `origin`
    ///
    /// When nothing is reachable the selected route is the local-only route
    /// and the message is marked for storage.
    pub fn decide(
        &self,
        origin: &NodeId,
        message: &Message,
        graph: &TopologyGraph,
        ledger: &PerformanceLedger,
    ) -> Result<RoutingDecision> {
        let targets = targets_for(origin, message, graph);
        let routes = self
            .path_finder
            .find_routes(origin, &targets, message, graph)?;

        let mut ranked = rank_routes(self.model.as_ref(), routes, message, ledger, graph)
            .into_iter()
            .map(|scored| scored.route);

        let selected_route = match ranked.next() {
            Some(route) => route,
            None => {
                debug!(
                    "{} for message {} ({} targets)",
                    RoutingError::NoRouteFound,
                    message.id,
                    targets.len()
                );
                Route::local(origin.clone())
            }
        };
        let alternative_routes: Vec<Route> = ranked.take(self.max_alternatives).collect();

        Ok(RoutingDecision {
            confidence: confidence(&selected_route, message),
            reasoning: reasoning(&selected_route, message),
            should_store: should_store(&selected_route, message),
            retry_strategy: retry_strategy(&selected_route, message, graph.gateway_count()),
            selected_route,
            alternative_routes,
            model_version: self.model.version(),
        })
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new()
    }
}
