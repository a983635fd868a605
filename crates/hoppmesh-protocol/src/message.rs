//! Message types and structures

use blake2::{Blake2b512, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{ProtocolError, Result};
use crate::types::{MessageKind, NodeId, Priority};

/// Size of a message ID in bytes
pub const MESSAGE_ID_SIZE: usize = 16;

/// Hop budget for regular messages
pub const DEFAULT_TTL: u8 = 10;

/// Hop budget for emergency messages
pub const EMERGENCY_TTL: u8 = 20;

/// Content above this size is treated as bulk data when weighting links
pub const LARGE_MESSAGE_BYTES: usize = 4 * 1024;

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// A unique identifier for a message
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; MESSAGE_ID_SIZE]);

impl MessageId {
    /// Derive a message ID from its contents
    /// Uses BLAKE2b(timestamp + origin + recipient + content + sequence)[0:16]
    pub fn generate(
        origin: &NodeId,
        recipient: &Recipient,
        content: &str,
        timestamp: i64,
        sequence: u32,
    ) -> Self {
        let mut hasher = Blake2b512::new();

        hasher.update(timestamp.to_le_bytes());
        hasher.update(origin.as_str().as_bytes());
        hasher.update(recipient.to_string().as_bytes());
        hasher.update(content.as_bytes());
        hasher.update(sequence.to_le_bytes());

        let hash = hasher.finalize();

        let mut id = [0u8; MESSAGE_ID_SIZE];
        id.copy_from_slice(&hash[..MESSAGE_ID_SIZE]);

        MessageId(id)
    }

    pub fn from_bytes(bytes: [u8; MESSAGE_ID_SIZE]) -> Self {
        MessageId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))?;

        if bytes.len() != MESSAGE_ID_SIZE {
            return Err(ProtocolError::InvalidMessageId);
        }

        let mut arr = [0u8; MESSAGE_ID_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(MessageId(arr))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({}...)", &self.to_hex()[..12])
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

/// Final destination of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Node(NodeId),
    /// Every reachable node
    Broadcast,
}

impl Recipient {
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Recipient::Node(id) => Some(id),
            Recipient::Broadcast => None,
        }
    }
}

impl From<NodeId> for Recipient {
    fn from(id: NodeId) -> Self {
        Recipient::Node(id)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Node(id) => write!(f, "{}", id),
            Recipient::Broadcast => f.write_str("*"),
        }
    }
}

/// A message travelling through the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub origin: NodeId,
    pub recipient: Recipient,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    /// Remaining hop budget
    pub ttl: u8,
    /// Nodes traversed so far, origin first
    pub route: Vec<NodeId>,
    pub retry_count: u32,
    pub requires_internet: bool,
    pub kind: MessageKind,
}

impl Message {
    /// Create a text message originating at `origin`
    pub fn new(
        origin: NodeId,
        recipient: Recipient,
        content: impl Into<String>,
        priority: Priority,
        requires_internet: bool,
    ) -> Self {
        let content = content.into();
        let timestamp = Utc::now();
        let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let id = MessageId::generate(
            &origin,
            &recipient,
            &content,
            timestamp.timestamp_millis(),
            sequence,
        );

        Message {
            id,
            route: vec![origin.clone()],
            origin,
            recipient,
            content,
            timestamp,
            priority,
            ttl: Self::default_ttl(priority),
            retry_count: 0,
            requires_internet,
            kind: MessageKind::Text,
        }
    }

    /// Hop budget a fresh message of this priority starts with
    pub fn default_ttl(priority: Priority) -> u8 {
        if priority.is_emergency() {
            EMERGENCY_TTL
        } else {
            DEFAULT_TTL
        }
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Spend one hop of the TTL, returning what remains
    ///
    /// A node spends one hop per transmission it makes, however long the
    /// planned route is. Relays further along spend their own hop when they
    /// pass the message on.
    pub fn consume_hop(&mut self) -> Result<u8> {
        if self.ttl == 0 {
            return Err(ProtocolError::TtlExceeded);
        }
        self.ttl -= 1;
        Ok(self.ttl)
    }

    pub fn is_expired(&self) -> bool {
        self.ttl == 0
    }

    /// Append a node to the route-so-far; one entry per hop spent
    pub fn record_traversal(&mut self, node: NodeId) {
        self.route.push(node);
    }

    /// Whether the message should be routed towards an internet gateway
    pub fn needs_gateway(&self) -> bool {
        self.requires_internet || self.kind == MessageKind::Sos
    }

    /// Bulk payloads pay a bandwidth penalty on every link
    pub fn is_large(&self) -> bool {
        self.kind == MessageKind::File || self.content.len() > LARGE_MESSAGE_BYTES
    }
}
