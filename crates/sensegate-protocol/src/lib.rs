//! Wire protocol model for the SenseGate sensor network.
//!
//! The sensor network speaks a line-oriented ASCII protocol:
//!
//! ```text
//! node-id;child-id;message-type;ack;sub-type;payload\n
//! ```
//!
//! This crate owns the message value object ([`SensorMessage`]), the closed
//! enums for message/presentation/variable/internal sub-types, and the
//! selectable-subset identity hash used for duplicate suppression and
//! ack correlation upstream.
//!
//! Parsing and serialization are pure and synchronous; transport and
//! topology concerns live in `sensegate-transport` and `sensegate-gateway`.

pub mod message;
pub mod types;

pub use message::{
    HashField, SensorMessage, BROADCAST_NODE_ID, GATEWAY_NODE_ID, INTERNAL_CHILD_ID,
    MAX_PAYLOAD_LEN,
};
pub use types::{InternalType, MessageType, PresentationType, VariableType};

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while decoding or encoding wire lines.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Line does not have the expected field structure.
    #[error("malformed line: {0}")]
    Malformed(String),

    /// A numeric field is present but outside its legal range.
    #[error("field {field} out of range: {value}")]
    OutOfRange {
        /// Field name as it appears in the wire documentation.
        field: &'static str,
        /// Offending raw value.
        value: String,
    },

    /// Payload exceeds the radio frame limit for locally built messages.
    #[error("payload too long: {len} bytes (max {MAX_PAYLOAD_LEN})")]
    PayloadTooLong {
        /// Actual payload length in bytes.
        len: usize,
    },
}
