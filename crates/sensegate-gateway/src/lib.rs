//! Bridge between a line-oriented sensor network gateway and a host
//! automation platform.
//!
//! The [`Gateway`] owns the connection, interprets inbound traffic into a
//! [`DeviceTree`], answers device housekeeping requests (time, units, node
//! id assignment) and publishes everything it observes on a broadcast
//! [`GatewayEventBus`]. The host side consumes events; it never reaches
//! into the bridge's internals.

pub mod cache;
pub mod config;
pub mod converter;
pub mod discovery;
pub mod events;
pub mod gateway;
pub mod registry;
pub mod tree;

pub use cache::{CacheError, CachedNode, NodeIdCache};
pub use config::{
    ConfigTransportFactory, GatewayConfig, SanityCheckConfig, TransportConfig, TransportFactory,
};
pub use converter::{from_payload, to_payload, to_payload_for, ConvertError, StateValue};
pub use discovery::{DiscoveredSensor, DiscoveryService};
pub use events::{BridgeStatus, CommandFailure, GatewayEvent, GatewayEventBus, GatewayEventStream};
pub use gateway::Gateway;
pub use registry::{thing_type_for, SensorRegistry};
pub use tree::{Child, ChildId, DeviceTree, Node, NodeId, TreeError, Variable};

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced by the bridge.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Protocol(#[from] sensegate_protocol::ProtocolError),

    #[error(transparent)]
    Transport(#[from] sensegate_transport::TransportError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The gateway device did not answer the startup version probe.
    #[error("gateway device failed the startup check")]
    StartupCheckFailed,

    /// An operation needed a live link and there is none.
    #[error("not connected to the gateway device")]
    NotConnected,
}
