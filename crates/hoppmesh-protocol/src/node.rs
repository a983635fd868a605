//! Mesh node and link descriptions

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{check_unit, DeviceClass, NodeId, TransportKind};

/// Trust score assigned to a node that has no history yet
pub const DEFAULT_TRUST_SCORE: f64 = 0.5;

/// One transport a node can speak
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub kind: TransportKind,
    /// Relative strength (0.0-1.0)
    pub strength: f64,
    /// Range in meters
    pub range: f64,
    pub active: bool,
}

impl Capability {
    pub fn new(kind: TransportKind, strength: f64, range: f64) -> Self {
        Capability {
            kind,
            strength,
            range,
            active: true,
        }
    }
}

/// A node in the mesh as last reported by discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub device_class: DeviceClass,
    /// Battery level (0.0-1.0)
    pub battery_level: f64,
    /// Signal strength (0.0-1.0)
    pub signal_strength: f64,
    pub is_gateway: bool,
    pub has_internet_access: bool,
    pub last_seen: DateTime<Utc>,
    pub capabilities: Vec<Capability>,
    /// Historical good behavior (0.0-1.0)
    pub trust_score: f64,
}

impl Node {
    /// Create a node sighted just now with neutral defaults
    pub fn new(id: NodeId, name: impl Into<String>) -> Self {
        Node {
            id,
            name: name.into(),
            device_class: DeviceClass::Phone,
            battery_level: 1.0,
            signal_strength: 1.0,
            is_gateway: false,
            has_internet_access: false,
            last_seen: Utc::now(),
            capabilities: Vec::new(),
            trust_score: DEFAULT_TRUST_SCORE,
        }
    }

    pub fn with_device_class(mut self, device_class: DeviceClass) -> Self {
        self.device_class = device_class;
        self
    }

    pub fn with_battery(mut self, battery_level: f64) -> Self {
        self.battery_level = battery_level;
        self
    }

    pub fn with_signal(mut self, signal_strength: f64) -> Self {
        self.signal_strength = signal_strength;
        self
    }

    pub fn with_trust(mut self, trust_score: f64) -> Self {
        self.trust_score = trust_score;
        self
    }

    /// Mark the node as an internet gateway
    pub fn with_internet(mut self, has_internet_access: bool) -> Self {
        self.has_internet_access = has_internet_access;
        self.is_gateway = has_internet_access;
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_last_seen(mut self, last_seen: DateTime<Utc>) -> Self {
        self.last_seen = last_seen;
        self
    }

    /// Check that all unit-interval fields are in range
    pub fn validate(&self) -> Result<()> {
        check_unit("battery_level", self.battery_level)?;
        check_unit("signal_strength", self.signal_strength)?;
        check_unit("trust_score", self.trust_score)?;
        Ok(())
    }

    /// Apply a re-sighting of the same node
    ///
    /// Every reported attribute is taken from the sighting except the trust
    /// score, which is history owned by this side of the mesh.
    pub fn refresh_from(&mut self, sighting: Node) {
        let trust_score = self.trust_score;
        *self = sighting;
        self.trust_score = trust_score;
    }

    /// Whether the node has not been seen within `window` of `now`
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now.signed_duration_since(self.last_seen) > window
    }

    pub fn has_active_capability(&self, kind: TransportKind) -> bool {
        self.capabilities.iter().any(|c| c.kind == kind && c.active)
    }
}

/// A directed link between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    /// Link reliability estimate (0.0-1.0)
    pub reliability: f64,
    /// Bandwidth estimate in kbit/s
    pub bandwidth: f64,
    pub protocol: TransportKind,
}

impl Edge {
    pub fn new(
        from: NodeId,
        to: NodeId,
        reliability: f64,
        bandwidth: f64,
        protocol: TransportKind,
    ) -> Self {
        Edge {
            from,
            to,
            reliability,
            bandwidth,
            protocol,
        }
    }

    /// The same link in the opposite direction
    pub fn reversed(&self) -> Self {
        Edge {
            from: self.to.clone(),
            to: self.from.clone(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_unit("reliability", self.reliability)?;
        if !self.bandwidth.is_finite() || self.bandwidth < 0.0 {
            return Err(crate::ProtocolError::OutOfRange {
                field: "bandwidth",
                value: self.bandwidth,
            });
        }
        Ok(())
    }
}
