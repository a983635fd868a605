//! HoppMesh Message Routing
//!
//! Decides how each message leaves the local node and drives delivery:
//! - Topology store with snapshot reads
//! - Dijkstra path finding towards recipients and internet gateways
//! - Versioned route scoring informed by per-path delivery history
//! - Routing decisions with confidence, reasoning and a retry strategy
//! - Router loop with TTL accounting, fallbacks, backoff and store-and-forward
//!
//! [`MeshNetwork`] ties these together for one local node; the transport,
//! internet forwarder, message store and discovery feed are supplied by the
//! embedding application through the traits in [`transport`] and
//! [`discovery`].

pub mod config;
pub mod decision;
pub mod discovery;
pub mod error;
pub mod ledger;
pub mod network;
pub mod path_finder;
pub mod queue;
pub mod router;
pub mod scorer;
pub mod topology;
pub mod transport;

pub use config::RouterConfig;
pub use decision::{DecisionEngine, RetryStrategy, RoutingDecision};
pub use discovery::{DiscoveryEvent, DiscoveryFeed, DiscoveryRefresher, RefreshSummary};
pub use error::{Result, RoutingError};
pub use ledger::{PathStats, PerformanceLedger};
pub use network::{MeshNetwork, NetworkStatus};
pub use path_finder::PathFinder;
pub use queue::{MessageQueue, QueueStats, QueuedMessage};
pub use router::{
    DeliveryReport, MessageOutcome, MessageState, Router, RouterShared, RouterStats,
};
pub use scorer::{HeuristicScorer, ScoredRoute, ScoringContext, ScoringModel};
pub use topology::{TopologyGraph, TopologyStore};
pub use transport::{Collaborators, InternetForwarder, MemoryMessageStore, MessageStore, Transport};
