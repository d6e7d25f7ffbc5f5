//! Gateway event bus.
//!
//! Everything the bridge observes (inbound traffic, topology changes,
//! connection transitions, command failures) is published here. The host
//! integration (discovery, handlers, status reporting) subscribes rather
//! than being called back directly.

use sensegate_protocol::{PresentationType, SensorMessage, VariableType};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Buffer for slow subscribers before they start lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Host-visible bridge status. Connection and reachability problems show
/// up here with a reason, not as errors bubbling out of the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeStatus {
    Connecting,
    Online,
    Offline { reason: String },
}

/// Why a command did not take effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandFailure {
    /// No acknowledgment within the timeout window; the optimistic update
    /// was rolled back.
    AckTimeout,
    /// The device signalled an explicit fault (distinct from the network
    /// being down).
    Rejected(String),
}

/// Events published by the gateway.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Any valid inbound message, before interpretation.
    MessageReceived(SensorMessage),
    /// A node entered the tree. `from_cache` marks restores at startup as
    /// opposed to live presentations.
    NodeDiscovered { node_id: u8, from_cache: bool },
    /// A child was presented for the first time.
    ChildDiscovered {
        node_id: u8,
        child_id: u8,
        presentation: PresentationType,
        description: String,
    },
    /// A variable took a new value. `handler` carries the host handler
    /// registered for the (node, child) pair, when one exists.
    VariableChanged {
        node_id: u8,
        child_id: u8,
        variable: VariableType,
        value: String,
        handler: Option<String>,
    },
    /// A node stopped (or resumed) answering liveness probes.
    ReachabilityChanged { node_id: u8, reachable: bool },
    /// The link to the gateway device changed state.
    ConnectionStatusChanged(BridgeStatus),
    /// A node id was allocated and persisted for an unidentified device.
    IdReserved { node_id: u8 },
    /// A locally originated command failed; the tree was rolled back.
    CommandFailed {
        node_id: u8,
        child_id: u8,
        variable: VariableType,
        reason: CommandFailure,
    },
}

/// Broadcast bus distributing [`GatewayEvent`]s to all subscribers.
#[derive(Clone)]
pub struct GatewayEventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl GatewayEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to all current subscribers; an event with no subscribers is
    /// discarded.
    pub fn publish(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> GatewayEventStream {
        GatewayEventStream {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for GatewayEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver over the event bus. Lagging skips missed events rather than
/// failing the subscriber.
pub struct GatewayEventStream {
    rx: broadcast::Receiver<GatewayEvent>,
}

impl GatewayEventStream {
    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
