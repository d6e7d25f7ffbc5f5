//! Bridge configuration.
//!
//! Validation happens in [`GatewayConfig::validate`] before any side
//! effect; an invalid config never opens a port or touches the cache.

use std::time::Duration;

use sensegate_transport::{
    MqttConfig, MqttTransport, SerialConfig, SerialTransport, TcpConfig, TcpTransport, Transport,
};
use serde::{Deserialize, Serialize};

use crate::GatewayError;

/// Which link carries the gateway device, plus its per-link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Serial {
        /// Port path, e.g. `/dev/ttyUSB0`.
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Pulse DTR to hard-reset the radio on connect.
        #[serde(default)]
        hard_reset: bool,
        /// Seconds to wait after opening the port before use.
        #[serde(default = "default_settle_secs")]
        settle_secs: u64,
    },
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
    Mqtt {
        broker: String,
        #[serde(default = "default_mqtt_port")]
        port: u16,
        #[serde(default = "default_client_id")]
        client_id: String,
        topic_prefix: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_settle_secs() -> u64 {
    3
}

fn default_tcp_port() -> u16 {
    5003
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "sensegate".to_string()
}

/// Periodic liveness verification of nodes and the link itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanityCheckConfig {
    /// Whether the periodic check runs at all.
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between passes.
    #[serde(default = "default_sanity_interval")]
    pub interval_secs: u64,
    /// Probe nodes with heartbeat requests.
    #[serde(default)]
    pub heartbeat: bool,
    /// Consecutive missed probes before a node is marked unreachable.
    #[serde(default = "default_max_failures")]
    pub max_node_failures: u32,
    /// Consecutive failed link probes before a forced reconnect.
    #[serde(default = "default_max_failures")]
    pub max_connection_failures: u32,
}

fn default_sanity_interval() -> u64 {
    300
}

fn default_max_failures() -> u32 {
    3
}

impl Default for SanityCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_sanity_interval(),
            heartbeat: false,
            max_node_failures: default_max_failures(),
            max_connection_failures: default_max_failures(),
        }
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Link selection and settings.
    pub transport: TransportConfig,
    /// Milliseconds between outbound messages (gateway radios are slow).
    #[serde(default = "default_send_delay_ms")]
    pub send_delay_ms: u64,
    /// Verify the link with a version request on startup.
    #[serde(default = "default_true")]
    pub startup_check: bool,
    /// Milliseconds to wait for an acknowledgment before reverting.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Reply "I" instead of "M" to unit-config requests.
    #[serde(default)]
    pub imperial: bool,
    /// Periodic liveness checking.
    #[serde(default)]
    pub sanity_check: SanityCheckConfig,
}

fn default_send_delay_ms() -> u64 {
    200
}

fn default_ack_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl GatewayConfig {
    /// Reject configurations that could not possibly connect. No side
    /// effects.
    pub fn validate(&self) -> Result<(), GatewayError> {
        match &self.transport {
            TransportConfig::Serial { port, baud_rate, .. } => {
                if port.is_empty() {
                    return Err(GatewayError::InvalidConfig("serial port path is empty".into()));
                }
                if *baud_rate == 0 {
                    return Err(GatewayError::InvalidConfig("baud rate is zero".into()));
                }
            }
            TransportConfig::Tcp { host, port } => {
                if host.is_empty() {
                    return Err(GatewayError::InvalidConfig("TCP host is empty".into()));
                }
                if *port == 0 {
                    return Err(GatewayError::InvalidConfig("TCP port is zero".into()));
                }
            }
            TransportConfig::Mqtt { broker, topic_prefix, .. } => {
                if broker.is_empty() {
                    return Err(GatewayError::InvalidConfig("MQTT broker is empty".into()));
                }
                if topic_prefix.is_empty() {
                    return Err(GatewayError::InvalidConfig("MQTT topic prefix is empty".into()));
                }
            }
        }
        if self.sanity_check.enabled && self.sanity_check.interval_secs == 0 {
            return Err(GatewayError::InvalidConfig("sanity check interval is zero".into()));
        }
        if self.ack_timeout_ms == 0 {
            return Err(GatewayError::InvalidConfig("ack timeout is zero".into()));
        }
        Ok(())
    }

    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Creates the transport for each connection attempt. Explicitly
/// constructed and owned by the gateway; there is no process-wide
/// transport registry.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn Transport>;
}

/// Default factory: builds the transport the config describes.
pub struct ConfigTransportFactory {
    transport: TransportConfig,
}

impl ConfigTransportFactory {
    pub fn new(transport: TransportConfig) -> Self {
        Self { transport }
    }
}

impl TransportFactory for ConfigTransportFactory {
    fn create(&self) -> Box<dyn Transport> {
        match &self.transport {
            TransportConfig::Serial {
                port,
                baud_rate,
                hard_reset,
                settle_secs,
            } => {
                let mut config = SerialConfig::new(port, *baud_rate);
                config.hard_reset = *hard_reset;
                config.settle_delay = Duration::from_secs(*settle_secs);
                Box::new(SerialTransport::new(config))
            }
            TransportConfig::Tcp { host, port } => {
                Box::new(TcpTransport::new(TcpConfig::new(host, *port)))
            }
            TransportConfig::Mqtt {
                broker,
                port,
                client_id,
                topic_prefix,
                username,
                password,
            } => {
                let mut config = MqttConfig::new(broker, topic_prefix);
                config.port = *port;
                config.client_id = client_id.clone();
                config.username = username.clone();
                config.password = password.clone();
                Box::new(MqttTransport::new(config))
            }
        }
    }
}
