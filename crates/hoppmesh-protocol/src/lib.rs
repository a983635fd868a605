//! HoppMesh Protocol Module
//!
//! Core data structures shared by the router and its collaborators:
//! node and link descriptions, messages, and candidate routes.

pub mod error;
pub mod message;
pub mod node;
pub mod route;
pub mod types;

pub use error::{ProtocolError, Result};
pub use message::{Message, MessageId, Recipient};
pub use node::{Capability, Edge, Node};
pub use route::Route;
pub use types::{DeviceClass, MessageKind, NodeId, Priority, TransportKind};
