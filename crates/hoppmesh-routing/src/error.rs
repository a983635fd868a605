//! Routing error types

use hoppmesh_protocol::NodeId;
use thiserror::Error;

/// Routing-specific errors
///
/// Only `Protocol` and `Shutdown` escape to callers; the delivery variants
/// are absorbed by the router loop and surface as terminal message states.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    #[error("No route to any target")]
    NoRouteFound,

    #[error("Attempt via {path} failed: {reason}")]
    AttemptFailed { path: String, reason: String },

    #[error("All routes exhausted after {attempts} attempts")]
    AllRoutesExhausted { attempts: usize },

    #[error("TTL expired")]
    TtlExpired,

    #[error("Gateway {gateway} unavailable: {reason}")]
    GatewayUnavailable { gateway: NodeId, reason: String },

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Router is shut down")]
    Shutdown,

    #[error("Protocol error: {0}")]
    Protocol(#[from] hoppmesh_protocol::ProtocolError),
}

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, RoutingError>;
