//! Route scoring
//!
//! Scoring sits behind [`ScoringModel`] so the fixed heuristic below can be
//! replaced by a trained model without touching the decision assembler.

use hoppmesh_protocol::{Message, Route};
use std::cmp::Ordering;

use crate::ledger::{PathStats, PerformanceLedger};
use crate::topology::TopologyGraph;

pub const BASE_SCORE: f64 = 100.0;
pub const HOP_PENALTY: f64 = 5.0;
pub const RELIABILITY_WEIGHT: f64 = 30.0;
pub const INTERNET_BONUS: f64 = 50.0;
pub const EMERGENCY_INTERNET_BONUS: f64 = 40.0;
pub const EMERGENCY_SHORT_PATH_BONUS: f64 = 20.0;
pub const EMERGENCY_SHORT_PATH_HOPS: usize = 3;
pub const ENERGY_PENALTY: f64 = 0.1;
pub const HISTORY_SUCCESS_WEIGHT: f64 = 20.0;
pub const HISTORY_LATENCY_PENALTY: f64 = 0.001;
pub const TRUST_WEIGHT: f64 = 15.0;

/// Everything a model may consult when scoring one route
pub struct ScoringContext<'a> {
    pub message: &'a Message,
    pub history: Option<&'a PathStats>,
    pub graph: &'a TopologyGraph,
}

/// A versioned route scoring function
pub trait ScoringModel: Send + Sync {
    /// Identifier recorded alongside decisions
    fn version(&self) -> &'static str;

    /// Desirability of `route`; higher is better, never negative
    fn score(&self, route: &Route, ctx: &ScoringContext<'_>) -> f64;
}

/// Additive heuristic from a base of 100, floored at 0
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicScorer;

impl ScoringModel for HeuristicScorer {
    fn version(&self) -> &'static str {
        "route-heuristic-v1"
    }

    fn score(&self, route: &Route, ctx: &ScoringContext<'_>) -> f64 {
        let hops = route.hop_count();
        let mut score = BASE_SCORE;

        score -= hops as f64 * HOP_PENALTY;
        score += route.reliability * RELIABILITY_WEIGHT;

        if ctx.message.requires_internet && route.has_internet_path {
            score += INTERNET_BONUS;
        }

        if ctx.message.priority.is_emergency() {
            if route.has_internet_path {
                score += EMERGENCY_INTERNET_BONUS;
            }
            if hops <= EMERGENCY_SHORT_PATH_HOPS {
                score += EMERGENCY_SHORT_PATH_BONUS;
            }
        }

        score -= route.energy_cost * ENERGY_PENALTY;

        if let Some(history) = ctx.history {
            score += history.success_rate * HISTORY_SUCCESS_WEIGHT;
            score -= history.average_latency_ms * HISTORY_LATENCY_PENALTY;
        }

        let path = route.path();
        let trust = path.iter().map(|id| ctx.graph.trust_of(id)).sum::<f64>() / path.len() as f64;
        score += trust * TRUST_WEIGHT;

        score.max(0.0)
    }
}

/// A route annotated with its score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRoute {
    pub route: Route,
    pub score: f64,
}

/// Score every route and sort best first
///
/// Equal scores are ordered by fewer hops.
pub fn rank_routes(
    model: &dyn ScoringModel,
    routes: Vec<Route>,
    message: &Message,
    ledger: &PerformanceLedger,
    graph: &TopologyGraph,
) -> Vec<ScoredRoute> {
    let mut scored: Vec<ScoredRoute> = routes
        .into_iter()
        .map(|route| {
            let key = route.path_key();
            let ctx = ScoringContext {
                message,
                history: ledger.get(&key),
                graph,
            };
            let score = model.score(&route, &ctx);
            ScoredRoute { route, score }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.route.hop_count().cmp(&b.route.hop_count()))
    });

    scored
}
