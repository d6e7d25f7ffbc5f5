//! End-to-end bridge flows over an in-process pipe transport.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sensegate_gateway::{
    BridgeStatus, CommandFailure, Gateway, GatewayConfig, GatewayError, GatewayEvent,
    GatewayEventStream, NodeIdCache, TransportFactory,
};
use sensegate_protocol::{PresentationType, SensorMessage, VariableType};
use sensegate_transport::{LineSink, LineSource, PipeHarness, PipeTransport, Transport};

/// Hands its single pipe to the first connection attempt.
struct PipeFactory {
    transport: Mutex<Option<PipeTransport>>,
}

impl PipeFactory {
    fn new() -> (Self, PipeHarness) {
        let (transport, harness) = PipeTransport::pair();
        (
            Self {
                transport: Mutex::new(Some(transport)),
            },
            harness,
        )
    }
}

impl TransportFactory for PipeFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(
            self.transport
                .lock()
                .unwrap()
                .take()
                .expect("pipe supports a single connection"),
        )
    }
}

/// Hands out pre-built transports, one per connection attempt.
struct QueueFactory {
    transports: Mutex<VecDeque<Box<dyn Transport>>>,
}

impl QueueFactory {
    fn new(transports: Vec<Box<dyn Transport>>) -> Self {
        Self {
            transports: Mutex::new(transports.into()),
        }
    }
}

impl TransportFactory for QueueFactory {
    fn create(&self) -> Box<dyn Transport> {
        self.transports
            .lock()
            .unwrap()
            .pop_front()
            .expect("no transport left for this connection attempt")
    }
}

/// A pipe that takes a while to come up, like a settling serial port.
struct SlowTransport {
    inner: PipeTransport,
    delay: Duration,
}

#[async_trait]
impl Transport for SlowTransport {
    async fn connect(
        &mut self,
    ) -> sensegate_transport::Result<(Box<dyn LineSource>, Box<dyn LineSink>)> {
        tokio::time::sleep(self.delay).await;
        self.inner.connect().await
    }

    async fn disconnect(&mut self) -> sensegate_transport::Result<()> {
        self.inner.disconnect().await
    }
}

fn test_config(ack_timeout_ms: u64, startup_check: bool) -> GatewayConfig {
    serde_json::from_value(serde_json::json!({
        "transport": { "type": "tcp", "host": "127.0.0.1" },
        "send_delay_ms": 1,
        "ack_timeout_ms": ack_timeout_ms,
        "startup_check": startup_check,
    }))
    .unwrap()
}

fn sanity_config(
    heartbeat: bool,
    max_node_failures: u32,
    max_connection_failures: u32,
) -> GatewayConfig {
    serde_json::from_value(serde_json::json!({
        "transport": { "type": "tcp", "host": "127.0.0.1" },
        "send_delay_ms": 1,
        "ack_timeout_ms": 150,
        "startup_check": false,
        "sanity_check": {
            "enabled": true,
            "interval_secs": 1,
            "heartbeat": heartbeat,
            "max_node_failures": max_node_failures,
            "max_connection_failures": max_connection_failures,
        },
    }))
    .unwrap()
}

async fn started_gateway() -> (Gateway, PipeHarness) {
    let (factory, harness) = PipeFactory::new();
    let gateway = Gateway::with_factory(
        test_config(150, false),
        NodeIdCache::memory().unwrap(),
        Box::new(factory),
    )
    .unwrap();
    gateway.startup().await.unwrap();
    (gateway, harness)
}

async fn wait_for<F>(events: &mut GatewayEventStream, mut matches: F) -> GatewayEvent
where
    F: FnMut(&GatewayEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn presentation_discovers_node_and_child_once() {
    let (gateway, harness) = started_gateway().await;
    let mut events = gateway.subscribe();

    harness.push_line("5;255;0;0;17;2.3.2").await;
    harness.push_line("5;0;0;0;6;Living room temp").await;
    harness.push_line("5;0;0;0;6;Living room temp").await;

    match wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::NodeDiscovered { .. })
    })
    .await
    {
        GatewayEvent::NodeDiscovered { node_id, from_cache } => {
            assert_eq!(node_id, 5);
            assert!(!from_cache);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::ChildDiscovered { .. })
    })
    .await
    {
        GatewayEvent::ChildDiscovered {
            node_id,
            child_id,
            presentation,
            ..
        } => {
            assert_eq!((node_id, child_id), (5, 0));
            assert_eq!(presentation, PresentationType::Temperature);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // The duplicate presentation must not discover the child again: the
    // next topology/state event after it is the variable update.
    harness.push_line("5;0;1;0;0;21.5").await;
    let next = wait_for(&mut events, |e| {
        matches!(
            e,
            GatewayEvent::ChildDiscovered { .. } | GatewayEvent::VariableChanged { .. }
        )
    })
    .await;
    assert!(matches!(next, GatewayEvent::VariableChanged { .. }));

    let node = gateway.node(5).await.unwrap();
    let child = node.child(0).unwrap();
    assert_eq!(child.description, "Living room temp");
    assert_eq!(child.variable(0).unwrap().value, "21.5");

    gateway.shutdown().await;
}

#[tokio::test]
async fn unacknowledged_command_rolls_back() {
    let (gateway, harness) = started_gateway().await;
    let mut events = gateway.subscribe();

    harness.push_line("7;1;0;0;3;Relay").await;
    harness.push_line("7;1;1;0;2;0").await;
    wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::VariableChanged { .. })
    })
    .await;

    gateway
        .send_set(7, 1, VariableType::Status, "1", true)
        .await
        .unwrap();
    // Optimistic update is visible immediately.
    let node = gateway.node(7).await.unwrap();
    assert_eq!(node.child(1).unwrap().variable(2).unwrap().value, "1");

    match wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::CommandFailed { .. })
    })
    .await
    {
        GatewayEvent::CommandFailed {
            node_id,
            child_id,
            variable,
            reason,
        } => {
            assert_eq!((node_id, child_id), (7, 1));
            assert_eq!(variable, VariableType::Status);
            assert_eq!(reason, CommandFailure::AckTimeout);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let node = gateway.node(7).await.unwrap();
    assert_eq!(node.child(1).unwrap().variable(2).unwrap().value, "0");

    gateway.shutdown().await;
}

#[tokio::test]
async fn acknowledged_command_keeps_value() {
    let (gateway, mut harness) = started_gateway().await;
    let mut events = gateway.subscribe();

    harness.push_line("7;1;0;0;3;Relay").await;
    harness.push_line("7;1;1;0;2;0").await;
    wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::VariableChanged { .. })
    })
    .await;

    gateway
        .send_set(7, 1, VariableType::Status, "1", true)
        .await
        .unwrap();
    let sent = harness.next_sent().await.unwrap();
    assert_eq!(sent, "7;1;1;1;2;1");
    // The gateway radio echoes the command back with the ack flag set.
    harness.push_line(&sent).await;

    // Well past the 150ms ack window; a rollback would restore "0".
    tokio::time::sleep(Duration::from_millis(400)).await;
    let node = gateway.node(7).await.unwrap();
    assert_eq!(node.child(1).unwrap().variable(2).unwrap().value, "1");

    gateway.shutdown().await;
}

#[tokio::test]
async fn id_request_assigns_lowest_free_id() {
    let (factory, mut harness) = PipeFactory::new();
    let cache = NodeIdCache::memory().unwrap();
    cache.reserve(1).unwrap();
    let gateway =
        Gateway::with_factory(test_config(150, false), cache, Box::new(factory)).unwrap();
    gateway.startup().await.unwrap();
    let mut events = gateway.subscribe();

    harness.push_line("255;255;3;0;3;").await;

    match wait_for(&mut events, |e| matches!(e, GatewayEvent::IdReserved { .. })).await {
        GatewayEvent::IdReserved { node_id } => assert_eq!(node_id, 2),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(harness.next_sent().await.unwrap(), "255;255;3;0;4;2");

    gateway.shutdown().await;
}

#[tokio::test]
async fn req_is_answered_from_the_tree() {
    let (gateway, mut harness) = started_gateway().await;
    let mut events = gateway.subscribe();

    harness.push_line("5;0;0;0;6;Temp").await;
    harness.push_line("5;0;1;0;0;21.5").await;
    wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::VariableChanged { .. })
    })
    .await;

    harness.push_line("5;0;2;0;0;").await;
    assert_eq!(harness.next_sent().await.unwrap(), "5;0;1;0;0;21.5");

    gateway.shutdown().await;
}

#[tokio::test]
async fn locked_node_rejects_pending_commands() {
    let (gateway, harness) = started_gateway().await;
    let mut events = gateway.subscribe();

    harness.push_line("7;1;0;0;3;Relay").await;
    harness.push_line("7;1;1;0;2;0").await;
    wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::VariableChanged { .. })
    })
    .await;

    gateway
        .send_set(7, 1, VariableType::Status, "1", true)
        .await
        .unwrap();
    harness.push_line("7;255;3;0;23;").await;

    match wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::CommandFailed { .. })
    })
    .await
    {
        GatewayEvent::CommandFailed { reason, .. } => {
            assert_eq!(reason, CommandFailure::Rejected("node locked".into()));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::ReachabilityChanged { .. })
    })
    .await
    {
        GatewayEvent::ReachabilityChanged { node_id, reachable } => {
            assert_eq!(node_id, 7);
            assert!(!reachable);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let node = gateway.node(7).await.unwrap();
    assert_eq!(node.child(1).unwrap().variable(2).unwrap().value, "0");

    gateway.shutdown().await;
}

#[tokio::test]
async fn startup_check_exchanges_version() {
    let (factory, mut harness) = PipeFactory::new();
    let gateway = Gateway::with_factory(
        test_config(1000, true),
        NodeIdCache::memory().unwrap(),
        Box::new(factory),
    )
    .unwrap();

    let responder = tokio::spawn(async move {
        assert_eq!(harness.next_sent().await.unwrap(), "0;255;3;0;2;");
        harness.push_line("0;255;3;0;2;2.3.2").await;
        harness
    });

    gateway.startup().await.unwrap();
    let _harness = responder.await.unwrap();
    gateway.shutdown().await;
}

#[tokio::test]
async fn startup_check_fails_without_answer() {
    let (factory, _harness) = PipeFactory::new();
    let gateway = Gateway::with_factory(
        test_config(100, true),
        NodeIdCache::memory().unwrap(),
        Box::new(factory),
    )
    .unwrap();

    let err = gateway.startup().await.unwrap_err();
    assert!(matches!(err, GatewayError::StartupCheckFailed));
}

#[tokio::test]
async fn timed_out_command_on_a_fresh_variable_leaves_no_value() {
    let (gateway, harness) = started_gateway().await;
    let mut events = gateway.subscribe();

    // The child is presented but has never reported V_STATUS.
    harness.push_line("7;1;0;0;3;Relay").await;
    wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::ChildDiscovered { .. })
    })
    .await;

    gateway
        .send_set(7, 1, VariableType::Status, "1", true)
        .await
        .unwrap();
    let node = gateway.node(7).await.unwrap();
    assert_eq!(node.child(1).unwrap().variable(2).unwrap().value, "1");

    wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::CommandFailed { .. })
    })
    .await;

    // With nothing to revert to, the unconfirmed slot must disappear
    // instead of keeping the value the device never accepted.
    let node = gateway.node(7).await.unwrap();
    assert!(node.child(1).unwrap().variable(2).is_none());

    gateway.shutdown().await;
}

#[tokio::test]
async fn variable_change_carries_the_registered_handler() {
    let (gateway, harness) = started_gateway().await;
    gateway.registry().register(5, 0, "living-room-temp").await;
    let mut events = gateway.subscribe();

    harness.push_line("5;0;0;0;6;Temp").await;
    harness.push_line("5;0;1;0;0;21.5").await;

    match wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::VariableChanged { .. })
    })
    .await
    {
        GatewayEvent::VariableChanged { handler, value, .. } => {
            assert_eq!(handler.as_deref(), Some("living-room-temp"));
            assert_eq!(value, "21.5");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_node_is_marked_unreachable_and_recovers() {
    let (factory, harness) = PipeFactory::new();
    let gateway = Gateway::with_factory(
        sanity_config(true, 2, 100),
        NodeIdCache::memory().unwrap(),
        Box::new(factory),
    )
    .unwrap();
    gateway.startup().await.unwrap();
    let mut events = gateway.subscribe();

    harness.push_line("5;0;0;0;6;Temp").await;
    wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::ChildDiscovered { .. })
    })
    .await;

    // The node never answers a heartbeat; two missed rounds take it out.
    match wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::ReachabilityChanged { reachable: false, .. })
    })
    .await
    {
        GatewayEvent::ReachabilityChanged { node_id, .. } => assert_eq!(node_id, 5),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(!gateway.node(5).await.unwrap().reachable);

    // Any traffic from the node brings it back.
    harness.push_line("5;0;1;0;0;21.5").await;
    match wait_for(&mut events, |e| {
        matches!(e, GatewayEvent::ReachabilityChanged { reachable: true, .. })
    })
    .await
    {
        GatewayEvent::ReachabilityChanged { node_id, .. } => assert_eq!(node_id, 5),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(gateway.node(5).await.unwrap().reachable);

    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dead_link_forces_reconnect() {
    let (pipe_a, _harness_a) = PipeTransport::pair();
    let (pipe_b, mut harness_b) = PipeTransport::pair();
    let factory = QueueFactory::new(vec![Box::new(pipe_a), Box::new(pipe_b)]);
    let gateway = Gateway::with_factory(
        sanity_config(false, 3, 2),
        NodeIdCache::memory().unwrap(),
        Box::new(factory),
    )
    .unwrap();
    gateway.startup().await.unwrap();
    let mut events = gateway.subscribe();

    // The first link never answers a version probe.
    match wait_for(&mut events, |e| {
        matches!(
            e,
            GatewayEvent::ConnectionStatusChanged(BridgeStatus::Offline { .. })
        )
    })
    .await
    {
        GatewayEvent::ConnectionStatusChanged(BridgeStatus::Offline { reason }) => {
            assert_eq!(reason, "liveness check failed");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    wait_for(&mut events, |e| {
        matches!(
            e,
            GatewayEvent::ConnectionStatusChanged(BridgeStatus::Online)
        )
    })
    .await;

    // The next probe round goes out over the replacement link.
    let sent = tokio::time::timeout(Duration::from_secs(5), harness_b.next_sent())
        .await
        .expect("no traffic on the new link")
        .unwrap();
    assert_eq!(sent, "0;255;3;0;2;");

    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_reconnect_leaves_no_live_link() {
    let (pipe_a, _harness_a) = PipeTransport::pair();
    let (pipe_b, _harness_b) = PipeTransport::pair();
    let slow = SlowTransport {
        inner: pipe_b,
        delay: Duration::from_secs(10),
    };
    let factory = QueueFactory::new(vec![Box::new(pipe_a), Box::new(slow)]);
    let gateway = Gateway::with_factory(
        sanity_config(false, 3, 1),
        NodeIdCache::memory().unwrap(),
        Box::new(factory),
    )
    .unwrap();
    gateway.startup().await.unwrap();
    let mut events = gateway.subscribe();

    // One missed probe tears the first link down and starts the slow
    // reconnect; shut down while it is still settling.
    wait_for(&mut events, |e| {
        matches!(
            e,
            GatewayEvent::ConnectionStatusChanged(BridgeStatus::Offline { .. })
        )
    })
    .await;
    gateway.shutdown().await;

    // Even once the stalled attempt would have completed, no link may
    // come up behind the shutdown.
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(matches!(
        gateway.send(SensorMessage::version_request()).await,
        Err(GatewayError::NotConnected)
    ));
}
