//! Core protocol types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, Result};

/// Maximum length of a node identifier in bytes
pub const MAX_NODE_ID_LEN: usize = 128;

/// An opaque identifier for a node in the mesh
///
/// Identifiers come from the discovery side (radio addresses, generated
/// local ids) so they are kept as strings. Ordering is lexicographic, which
/// the path finder relies on for deterministic tie-breaking.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Create a NodeId, rejecting empty or oversized identifiers
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_NODE_ID_LEN || id.chars().any(char::is_whitespace) {
            return Err(ProtocolError::InvalidNodeId(id));
        }
        Ok(NodeId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `len` characters, used for short display names
    pub fn prefix(&self, len: usize) -> &str {
        match self.0.char_indices().nth(len) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        NodeId::new(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        NodeId::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// Message priority
///
/// Ordered so that `Emergency > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Emergency,
}

impl Priority {
    pub fn is_emergency(&self) -> bool {
        matches!(self, Priority::Emergency)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "emergency" => Ok(Priority::Emergency),
            other => Err(ProtocolError::DeserializationFailed(format!(
                "unknown priority: {}",
                other
            ))),
        }
    }
}

/// Class of device a node runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    #[default]
    Phone,
    Tablet,
    Computer,
    RelayBot,
}

/// Transport a capability or edge runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Short-range radio (Bluetooth)
    Bluetooth,
    /// Peer-to-peer WiFi
    WifiDirect,
    /// Long-range low-bandwidth radio
    Lora,
    Cellular,
    InternetGateway,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::WifiDirect => "wifi_direct",
            TransportKind::Lora => "lora",
            TransportKind::Cellular => "cellular",
            TransportKind::InternetGateway => "internet_gateway",
        };
        f.write_str(s)
    }
}

/// Kind of application payload a message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Location,
    Sos,
    File,
    Command,
}

/// Check that a value lies in the unit interval
pub(crate) fn check_unit(field: &'static str, value: f64) -> Result<f64> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ProtocolError::OutOfRange { field, value })
    }
}
