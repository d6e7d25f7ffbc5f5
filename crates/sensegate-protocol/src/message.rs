//! The sensor message value object.
//!
//! A message is one wire line. Parsing and serialization round-trip all six
//! logical fields; the `revert` marker is bridge-local bookkeeping and never
//! appears on the wire.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::types::{InternalType, MessageType, PresentationType, VariableType};
use crate::{ProtocolError, Result};

/// Node address reserved for broadcast traffic.
pub const BROADCAST_NODE_ID: u8 = 255;

/// Child address used for node-level (internal) messages.
pub const INTERNAL_CHILD_ID: u8 = 255;

/// Node address of the gateway itself.
pub const GATEWAY_NODE_ID: u8 = 0;

/// Maximum payload length the radio frame can carry.
pub const MAX_PAYLOAD_LEN: usize = 25;

const FIELD_SEPARATOR: char = ';';
const FIELD_COUNT: usize = 6;

/// Field selector for [`SensorMessage::custom_hash`].
///
/// Duplicate suppression and ack correlation key on "the same logical slot"
/// rather than exact equality, so the hash covers a caller-chosen subset of
/// the addressing fields and ignores ack, payload and the revert marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashField {
    NodeId,
    ChildId,
    MessageType,
    SubType,
}

impl HashField {
    /// All addressing fields, in canonical hash order.
    pub const ALL: [HashField; 4] = [
        HashField::NodeId,
        HashField::ChildId,
        HashField::MessageType,
        HashField::SubType,
    ];
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorMessage {
    /// Source or destination node (0–255, 255 = broadcast).
    pub node_id: u8,
    /// Child endpoint within the node (255 = node-level/internal).
    pub child_id: u8,
    /// Top-level message type.
    pub message_type: MessageType,
    /// Whether the sender requests (or this is) an acknowledgment.
    pub ack: bool,
    /// Sub-type; meaning depends on `message_type`.
    pub sub_type: u8,
    /// Free-form payload, possibly empty. Never contains a line terminator.
    pub payload: String,
    /// Local-only marker: this message re-applies a previous value after a
    /// failed optimistic update. Not serialized to the wire.
    #[serde(default, skip_serializing)]
    pub revert: bool,
}

impl SensorMessage {
    /// Construct a message without payload-length enforcement.
    ///
    /// Inbound traffic goes through [`SensorMessage::parse`]; local senders
    /// should prefer [`SensorMessage::try_new`].
    pub fn new(
        node_id: u8,
        child_id: u8,
        message_type: MessageType,
        ack: bool,
        sub_type: u8,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            node_id,
            child_id,
            message_type,
            ack,
            sub_type,
            payload: payload.into(),
            revert: false,
        }
    }

    /// Construct a locally originated message, enforcing the radio frame
    /// payload limit.
    pub fn try_new(
        node_id: u8,
        child_id: u8,
        message_type: MessageType,
        ack: bool,
        sub_type: u8,
        payload: impl Into<String>,
    ) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLong { len: payload.len() });
        }
        Ok(Self::new(node_id, child_id, message_type, ack, sub_type, payload))
    }

    /// Parse one wire line.
    ///
    /// The payload is the remainder after the fifth separator and may itself
    /// contain separators. A trailing CR/LF is stripped first.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = line.splitn(FIELD_COUNT, FIELD_SEPARATOR).collect();
        if fields.len() != FIELD_COUNT {
            return Err(ProtocolError::Malformed(format!(
                "expected {} fields, got {}: {:?}",
                FIELD_COUNT,
                fields.len(),
                line
            )));
        }

        let node_id = parse_u8("node-id", fields[0])?;
        let child_id = parse_u8("child-id", fields[1])?;
        let type_code = parse_u8("message-type", fields[2])?;
        let message_type = MessageType::from_code(type_code).ok_or(ProtocolError::OutOfRange {
            field: "message-type",
            value: fields[2].to_string(),
        })?;
        let ack = match fields[3] {
            "0" => false,
            "1" => true,
            other => {
                return Err(ProtocolError::OutOfRange {
                    field: "ack",
                    value: other.to_string(),
                })
            }
        };
        let sub_type = parse_u8("sub-type", fields[4])?;

        Ok(Self {
            node_id,
            child_id,
            message_type,
            ack,
            sub_type,
            payload: fields[5].to_string(),
            revert: false,
        })
    }

    /// Serialize back to a wire line (without terminator).
    ///
    /// Round-trips all six logical fields of a parsed message. A payload of
    /// pure whitespace serializes as an explicit empty field.
    pub fn serialize(&self) -> String {
        let payload = if self.payload.trim().is_empty() {
            ""
        } else {
            self.payload.as_str()
        };
        format!(
            "{};{};{};{};{};{}",
            self.node_id,
            self.child_id,
            self.message_type.code(),
            u8::from(self.ack),
            self.sub_type,
            payload
        )
    }

    /// Hash over the selected subset of addressing fields.
    ///
    /// Fields are hashed in canonical order regardless of the order given,
    /// and duplicates in `fields` are ignored, so any two calls selecting
    /// the same subset are comparable.
    pub fn custom_hash(&self, fields: &[HashField]) -> u64 {
        let mut hasher = DefaultHasher::new();
        for field in HashField::ALL {
            if !fields.contains(&field) {
                continue;
            }
            match field {
                HashField::NodeId => self.node_id.hash(&mut hasher),
                HashField::ChildId => self.child_id.hash(&mut hasher),
                HashField::MessageType => self.message_type.code().hash(&mut hasher),
                HashField::SubType => self.sub_type.hash(&mut hasher),
            }
        }
        hasher.finish()
    }

    /// Hash over all four addressing fields; the key used for pending-ack
    /// correlation.
    pub fn slot_hash(&self) -> u64 {
        self.custom_hash(&HashField::ALL)
    }

    /// Decoded presentation type, when this is a PRESENTATION message.
    pub fn presentation_type(&self) -> Option<PresentationType> {
        matches!(self.message_type, MessageType::Presentation)
            .then(|| PresentationType::from_code(self.sub_type))
    }

    /// Decoded variable type, when this is a SET or REQ message.
    pub fn variable_type(&self) -> Option<VariableType> {
        matches!(self.message_type, MessageType::Set | MessageType::Req)
            .then(|| VariableType::from_code(self.sub_type))
    }

    /// Decoded internal command, when this is an INTERNAL message.
    pub fn internal_type(&self) -> Option<InternalType> {
        matches!(self.message_type, MessageType::Internal)
            .then(|| InternalType::from_code(self.sub_type))
    }

    /// Whether this is the given internal command.
    pub fn is_internal(&self, internal: InternalType) -> bool {
        self.internal_type() == Some(internal)
    }

    /// Whether this message is addressed to every node.
    pub fn is_broadcast(&self) -> bool {
        self.node_id == BROADCAST_NODE_ID
    }

    /// Whether this inbound message acknowledges `pending`: same logical
    /// slot and the ack flag set (the gateway radio echoes the SET back
    /// with ack=1).
    pub fn is_ack_response_to(&self, pending: &SensorMessage) -> bool {
        self.ack && self.slot_hash() == pending.slot_hash()
    }

    // Convenience constructors for bridge-originated housekeeping traffic.

    /// Version request to the gateway device, used by the startup check and
    /// the connection sanity probe.
    pub fn version_request() -> Self {
        Self::internal(GATEWAY_NODE_ID, InternalType::Version, "")
    }

    /// Node-ID assignment, broadcast so the unidentified requester sees it.
    pub fn id_response(new_id: u8) -> Self {
        Self::internal(BROADCAST_NODE_ID, InternalType::IdResponse, new_id.to_string())
    }

    /// Heartbeat probe for one node.
    pub fn heartbeat_request(node_id: u8) -> Self {
        Self::internal(node_id, InternalType::HeartbeatRequest, "")
    }

    /// Epoch-seconds reply to I_TIME.
    pub fn time_response(node_id: u8, epoch_secs: i64) -> Self {
        Self::internal(node_id, InternalType::Time, epoch_secs.to_string())
    }

    /// Units reply to I_CONFIG ("M" metric, "I" imperial).
    pub fn config_response(node_id: u8, imperial: bool) -> Self {
        Self::internal(node_id, InternalType::Config, if imperial { "I" } else { "M" })
    }

    /// INTERNAL message helper.
    pub fn internal(node_id: u8, internal: InternalType, payload: impl Into<String>) -> Self {
        Self::new(
            node_id,
            INTERNAL_CHILD_ID,
            MessageType::Internal,
            false,
            internal.code(),
            payload,
        )
    }

    /// SET message addressing one variable slot.
    pub fn set(
        node_id: u8,
        child_id: u8,
        variable: VariableType,
        ack: bool,
        payload: impl Into<String>,
    ) -> Self {
        Self::new(node_id, child_id, MessageType::Set, ack, variable.code(), payload)
    }
}

impl std::fmt::Display for SensorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

fn parse_u8(field: &'static str, raw: &str) -> Result<u8> {
    if raw.is_empty() || raw.len() > 3 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::Malformed(format!(
            "field {field} is not a number: {raw:?}"
        )));
    }
    raw.parse::<u8>().map_err(|_| ProtocolError::OutOfRange {
        field,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_presentation_line() {
        let msg = SensorMessage::parse("5;0;0;0;18;TempSensor\n").unwrap();
        assert_eq!(msg.node_id, 5);
        assert_eq!(msg.child_id, 0);
        assert_eq!(msg.message_type, MessageType::Presentation);
        assert!(!msg.ack);
        assert_eq!(msg.sub_type, 18);
        assert_eq!(msg.payload, "TempSensor");
        assert_eq!(
            msg.presentation_type(),
            Some(PresentationType::ArduinoRepeaterNode)
        );
    }

    #[test]
    fn payload_keeps_embedded_separators() {
        let msg = SensorMessage::parse("12;6;1;0;0;21.5;extra;fields\r\n").unwrap();
        assert_eq!(msg.payload, "21.5;extra;fields");
    }

    #[test]
    fn empty_payload_is_valid() {
        let msg = SensorMessage::parse("0;255;3;0;2;").unwrap();
        assert_eq!(msg.payload, "");
        assert!(msg.is_internal(InternalType::Version));
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(matches!(
            SensorMessage::parse("1;2;3;0;4"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(SensorMessage::parse("").is_err());
    }

    #[test]
    fn rejects_bad_numbers() {
        assert!(SensorMessage::parse("256;0;1;0;0;x").is_err());
        assert!(SensorMessage::parse("-1;0;1;0;0;x").is_err());
        assert!(SensorMessage::parse("1;0;5;0;0;x").is_err());
        assert!(SensorMessage::parse("1;0;1;2;0;x").is_err());
        assert!(SensorMessage::parse("1;0;1;0;1000;x").is_err());
        assert!(SensorMessage::parse(";0;1;0;0;x").is_err());
    }

    #[test]
    fn round_trips_parsed_lines() {
        for line in [
            "5;0;0;0;18;TempSensor",
            "12;6;1;1;0;21.5",
            "0;255;3;0;2;",
            "255;255;3;0;4;42",
            "7;1;1;0;2;a;b;c",
        ] {
            let msg = SensorMessage::parse(line).unwrap();
            assert_eq!(msg.serialize(), line, "round-trip failed for {line}");
        }
    }

    #[test]
    fn whitespace_payload_serializes_empty() {
        let msg = SensorMessage::new(1, 2, MessageType::Set, false, 0, "   ");
        assert_eq!(msg.serialize(), "1;2;1;0;0;");
    }

    #[test]
    fn try_new_enforces_payload_limit() {
        let long = "x".repeat(MAX_PAYLOAD_LEN + 1);
        assert!(matches!(
            SensorMessage::try_new(1, 0, MessageType::Set, false, 0, long),
            Err(ProtocolError::PayloadTooLong { .. })
        ));
        assert!(SensorMessage::try_new(1, 0, MessageType::Set, false, 0, "ok").is_ok());
    }

    #[test]
    fn custom_hash_ignores_unselected_fields() {
        let a = SensorMessage::new(10, 2, MessageType::Set, false, 0, "21.5");
        let mut b = a.clone();
        b.ack = true;
        b.payload = "totally different".into();
        b.revert = true;

        // Every non-empty subset of the addressing fields agrees, since the
        // two messages only differ outside them.
        let subsets: [&[HashField]; 7] = [
            &[HashField::NodeId],
            &[HashField::ChildId],
            &[HashField::MessageType],
            &[HashField::SubType],
            &[HashField::NodeId, HashField::ChildId],
            &[HashField::MessageType, HashField::SubType],
            &HashField::ALL,
        ];
        for subset in subsets {
            assert_eq!(a.custom_hash(subset), b.custom_hash(subset));
        }
    }

    #[test]
    fn custom_hash_differs_inside_subset() {
        let a = SensorMessage::new(10, 2, MessageType::Set, false, 0, "");
        let mut b = a.clone();
        b.node_id = 11;
        assert_ne!(
            a.custom_hash(&[HashField::NodeId]),
            b.custom_hash(&[HashField::NodeId])
        );
        // Selection order must not matter.
        assert_eq!(
            a.custom_hash(&[HashField::SubType, HashField::NodeId]),
            a.custom_hash(&[HashField::NodeId, HashField::SubType])
        );
    }

    #[test]
    fn ack_response_matches_pending_slot() {
        let pending = SensorMessage::set(10, 2, VariableType::Status, true, "1");
        let mut echo = pending.clone();
        echo.payload = "1".into();
        assert!(echo.is_ack_response_to(&pending));

        let mut other_slot = echo.clone();
        other_slot.child_id = 3;
        assert!(!other_slot.is_ack_response_to(&pending));

        let mut no_ack = echo.clone();
        no_ack.ack = false;
        assert!(!no_ack.is_ack_response_to(&pending));
    }
}
