//! HoppNode - a single HoppMesh node as a long-running daemon
//!
//! Wires the routing library to a YAML configuration, a file-backed outbox,
//! persisted path history and simulated radio collaborators.

pub mod config;
pub mod node;
pub mod simulation;
pub mod storage;
