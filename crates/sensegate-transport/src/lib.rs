//! Connection layer for the SenseGate bridge.
//!
//! A gateway device is reachable over exactly one of three links:
//!
//! - a serial port (the classic USB/UART gateway),
//! - a TCP socket (ethernet/ESP gateways),
//! - an MQTT broker bridging topics into the same line protocol.
//!
//! All three present the one [`Transport`] contract: `connect` hands back a
//! [`LineSource`] and a [`LineSink`], and [`Connection::establish`] turns
//! those into the two long-lived workers the gateway relies on: a Reader
//! that parses and forwards inbound messages and a Writer that drains a
//! rate-limited outbound queue.

pub mod connection;
pub mod link;
pub mod mqtt;
pub mod pipe;
pub mod serial;
pub mod tcp;

pub use connection::{Connection, ConnectionOptions, ConnectionStatus};
pub use link::{LineSink, LineSource, Transport};
pub use mqtt::{MqttConfig, MqttTransport};
pub use pipe::{PipeHarness, PipeTransport};
pub use serial::{SerialConfig, SerialTransport};
pub use tcp::{TcpConfig, TcpTransport};

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by the connection layer.
///
/// These never crash the bridge; the gateway observes them as connection
/// status transitions and decides whether to reconnect.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MQTT client error.
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// The link closed while the connection was still in use.
    #[error("link closed: {0}")]
    Closed(String),

    /// Transport configuration rejected before any connection attempt.
    #[error("invalid transport config: {0}")]
    InvalidConfig(String),
}

impl From<rumqttc::ClientError> for TransportError {
    fn from(e: rumqttc::ClientError) -> Self {
        TransportError::Mqtt(e.to_string())
    }
}
