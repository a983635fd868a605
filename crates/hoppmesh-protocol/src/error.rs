//! Error types for protocol operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid message ID")]
    InvalidMessageId,

    #[error("Invalid node ID: {0}")]
    InvalidNodeId(String),

    #[error("Route path must contain at least one node")]
    EmptyRoute,

    #[error("TTL exceeded")]
    TtlExceeded,

    #[error("Value out of range for {field}: {value} (expected 0.0..=1.0)")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),
}
