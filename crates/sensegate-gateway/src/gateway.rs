//! The gateway orchestrator.
//!
//! Owns the connection lifecycle, routes inbound traffic into the device
//! tree, answers device housekeeping (time, units, node id assignment) and
//! tracks locally originated commands until they are acknowledged.
//!
//! Commands are optimistic: the tree takes the new value immediately and
//! the pending entry is keyed by the message's slot hash. If the gateway
//! radio does not echo the command back with the ack flag inside the
//! timeout window, the value is rolled back and a failure event published.
//!
//! Lock discipline: the tree lock is taken per message, never held across
//! an await on the link, and events are published after the lock is
//! released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sensegate_protocol::{
    InternalType, MessageType, SensorMessage, VariableType, GATEWAY_NODE_ID, INTERNAL_CHILD_ID,
};
use sensegate_transport::{Connection, ConnectionOptions, ConnectionStatus};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::cache::NodeIdCache;
use crate::config::{ConfigTransportFactory, GatewayConfig, TransportFactory};
use crate::converter::{self, StateValue};
use crate::events::{BridgeStatus, CommandFailure, GatewayEvent, GatewayEventBus, GatewayEventStream};
use crate::registry::SensorRegistry;
use crate::tree::{Child, ChildId, DeviceTree, Node, NodeId, TreeError};
use crate::{GatewayError, Result};

const TASK_JOIN_WAIT: Duration = Duration::from_secs(2);

/// A locally originated command awaiting acknowledgment.
struct PendingCommand {
    node_id: u8,
    child_id: u8,
    variable: VariableType,
}

#[derive(Default)]
struct GatewayTasks {
    inbound: Option<JoinHandle<()>>,
    status: Option<JoinHandle<()>>,
    sanity: Option<JoinHandle<()>>,
}

struct GatewayInner {
    config: GatewayConfig,
    factory: Box<dyn TransportFactory>,
    cache: NodeIdCache,
    tree: RwLock<DeviceTree>,
    bus: GatewayEventBus,
    registry: SensorRegistry,
    /// Outbound handle of the current connection; `None` while offline.
    sender: RwLock<Option<mpsc::Sender<SensorMessage>>>,
    connection: Mutex<Option<Connection>>,
    /// Pending commands keyed by slot hash.
    pending: Mutex<HashMap<u64, PendingCommand>>,
    tasks: Mutex<GatewayTasks>,
    stop: watch::Sender<bool>,
    /// When the gateway device last answered a version probe.
    gateway_seen: Mutex<Option<DateTime<Utc>>>,
}

/// The bridge. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    /// Build a gateway over the transport the config describes.
    pub fn new(config: GatewayConfig, cache: NodeIdCache) -> Result<Self> {
        let factory = Box::new(ConfigTransportFactory::new(config.transport.clone()));
        Self::with_factory(config, cache, factory)
    }

    /// Build a gateway with an explicit transport factory.
    pub fn with_factory(
        config: GatewayConfig,
        cache: NodeIdCache,
        factory: Box<dyn TransportFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let (stop, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(GatewayInner {
                config,
                factory,
                cache,
                tree: RwLock::new(DeviceTree::new()),
                bus: GatewayEventBus::new(),
                registry: SensorRegistry::new(),
                sender: RwLock::new(None),
                connection: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                tasks: Mutex::new(GatewayTasks::default()),
                stop,
                gateway_seen: Mutex::new(None),
            }),
        })
    }

    /// The event bus all bridge observations are published on.
    pub fn events(&self) -> &GatewayEventBus {
        &self.inner.bus
    }

    pub fn subscribe(&self) -> GatewayEventStream {
        self.inner.bus.subscribe()
    }

    /// Host handler registry. Inbound variable updates are resolved
    /// against it and the owning handler carried on
    /// [`GatewayEvent::VariableChanged`].
    pub fn registry(&self) -> &SensorRegistry {
        &self.inner.registry
    }

    /// Restore cached nodes, connect, and start the background tasks.
    ///
    /// A gateway is started once; build a new one to restart from scratch.
    pub async fn startup(&self) -> Result<()> {
        self.restore_cache().await?;
        connect(&self.inner).await?;
        if self.inner.config.sanity_check.enabled {
            let handle = spawn_sanity(self.inner.clone());
            self.inner.tasks.lock().await.sanity = Some(handle);
        }
        Ok(())
    }

    async fn restore_cache(&self) -> Result<()> {
        let cached = self.inner.cache.load()?;
        let mut tree = self.inner.tree.write().await;
        for record in cached {
            let node_id = match NodeId::new(record.node_id) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(node_id = record.node_id, error = %e, "skipping cached entry");
                    continue;
                }
            };
            if tree.add_node(Node::restored(node_id)) {
                self.inner.bus.publish(GatewayEvent::NodeDiscovered {
                    node_id: node_id.get(),
                    from_cache: true,
                });
            }
        }
        tracing::info!(nodes = tree.len(), "device tree restored from cache");
        Ok(())
    }

    /// Snapshot of the device tree.
    pub async fn tree(&self) -> DeviceTree {
        self.inner.tree.read().await.clone()
    }

    pub async fn node(&self, node_id: u8) -> Option<Node> {
        self.inner.tree.read().await.get_node(node_id).cloned()
    }

    /// Enqueue a raw message.
    pub async fn send(&self, message: SensorMessage) -> Result<()> {
        send_raw(&self.inner, message).await
    }

    /// Send a SET command, updating the tree optimistically.
    ///
    /// With `ack` requested, the update is rolled back and a
    /// [`GatewayEvent::CommandFailed`] published if no acknowledgment
    /// arrives within the configured timeout.
    pub async fn send_set(
        &self,
        node_id: u8,
        child_id: u8,
        variable: VariableType,
        payload: impl Into<String>,
        ack: bool,
    ) -> Result<()> {
        let payload = payload.into();
        let message = SensorMessage::try_new(
            node_id,
            child_id,
            MessageType::Set,
            ack,
            variable.code(),
            payload.clone(),
        )?;
        {
            let mut tree = self.inner.tree.write().await;
            let node = tree
                .get_node_mut(node_id)
                .ok_or(TreeError::UnknownNode(node_id))?;
            let child = node
                .child_mut(child_id)
                .ok_or(TreeError::UnknownChild { node_id, child_id })?;
            child.set_variable(variable.code(), payload);
        }
        let key = message.slot_hash();
        send_raw(&self.inner, message).await?;

        if ack {
            self.inner.pending.lock().await.insert(
                key,
                PendingCommand {
                    node_id,
                    child_id,
                    variable,
                },
            );
            let timeout = self.inner.config.ack_timeout();
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let Some(command) = inner.pending.lock().await.remove(&key) else {
                    return;
                };
                tracing::warn!(
                    node_id = command.node_id,
                    child_id = command.child_id,
                    "no acknowledgment, rolling back"
                );
                fail_command(&inner, command, CommandFailure::AckTimeout).await;
            });
        }
        Ok(())
    }

    /// Send a host state value, converted to the wire payload for the
    /// variable type.
    pub async fn send_state(
        &self,
        node_id: u8,
        child_id: u8,
        variable: VariableType,
        state: &StateValue,
        ack: bool,
    ) -> Result<()> {
        let payload = converter::to_payload_for(variable, state)?;
        self.send_set(node_id, child_id, variable, payload, ack).await
    }

    /// Allocate the lowest free node id, persist it, and broadcast the
    /// assignment.
    pub async fn reserve_node_id(&self) -> Result<u8> {
        reserve_node_id(&self.inner).await
    }

    /// Stop the background tasks and tear the connection down. Safe to
    /// call more than once.
    pub async fn shutdown(&self) {
        let _ = self.inner.stop.send(true);
        {
            let mut tasks = self.inner.tasks.lock().await;
            if let Some(mut task) = tasks.sanity.take() {
                // A pass stuck mid-reconnect must not outlive the shutdown
                // and install a fresh connection afterwards.
                if tokio::time::timeout(TASK_JOIN_WAIT, &mut task).await.is_err() {
                    task.abort();
                }
            }
        }
        teardown(&self.inner).await;
        self.inner
            .bus
            .publish(GatewayEvent::ConnectionStatusChanged(BridgeStatus::Offline {
                reason: "shut down".into(),
            }));
        tracing::info!("bridge shut down");
    }
}

/// Establish a connection over a fresh transport and start the inbound
/// dispatch and status tasks.
async fn connect(inner: &Arc<GatewayInner>) -> Result<()> {
    inner
        .bus
        .publish(GatewayEvent::ConnectionStatusChanged(BridgeStatus::Connecting));

    let transport = inner.factory.create();
    let options = ConnectionOptions {
        send_delay: inner.config.send_delay(),
    };
    let mut connection = match Connection::establish(transport, options).await {
        Ok(connection) => connection,
        Err(e) => {
            inner
                .bus
                .publish(GatewayEvent::ConnectionStatusChanged(BridgeStatus::Offline {
                    reason: e.to_string(),
                }));
            return Err(e.into());
        }
    };
    // The gateway may have been shut down while the transport was settling.
    if *inner.stop.subscribe().borrow() {
        connection.shutdown().await;
        return Err(GatewayError::NotConnected);
    }

    let Some(mut inbound) = connection.take_inbound() else {
        return Err(GatewayError::NotConnected);
    };
    let sender = connection.sender();
    let mut status_rx = connection.status();
    *inner.sender.write().await = Some(sender.clone());

    if inner.config.startup_check {
        if let Err(e) = verify_link(inner, &sender, &mut inbound).await {
            connection.shutdown().await;
            *inner.sender.write().await = None;
            inner
                .bus
                .publish(GatewayEvent::ConnectionStatusChanged(BridgeStatus::Offline {
                    reason: "startup check failed".into(),
                }));
            return Err(e);
        }
    }

    *inner.connection.lock().await = Some(connection);

    let dispatch_inner = inner.clone();
    let mut stop_rx = inner.stop.subscribe();
    let inbound_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                message = inbound.recv() => match message {
                    Some(message) => handle_message(&dispatch_inner, message).await,
                    None => break,
                }
            }
        }
        tracing::debug!("inbound dispatch stopped");
    });

    let status_inner = inner.clone();
    let status_task = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let lost = match &*status_rx.borrow() {
                ConnectionStatus::Lost(reason) => Some(reason.clone()),
                _ => None,
            };
            if let Some(reason) = lost {
                tracing::warn!(%reason, "link lost");
                status_inner
                    .bus
                    .publish(GatewayEvent::ConnectionStatusChanged(BridgeStatus::Offline {
                        reason,
                    }));
                break;
            }
        }
    });

    {
        let mut tasks = inner.tasks.lock().await;
        tasks.inbound = Some(inbound_task);
        tasks.status = Some(status_task);
    }

    // Known nodes were seen by this connection attempt.
    for node_id in inner.tree.read().await.node_ids() {
        if let Err(e) = inner.cache.touch(node_id) {
            tracing::warn!(node_id, error = %e, "cache touch failed");
        }
    }

    inner
        .bus
        .publish(GatewayEvent::ConnectionStatusChanged(BridgeStatus::Online));
    tracing::info!("bridge online");
    Ok(())
}

/// Startup check: the gateway device must answer a version request within
/// the ack timeout. Unrelated traffic arriving first is dispatched
/// normally, not discarded.
async fn verify_link(
    inner: &Arc<GatewayInner>,
    sender: &mpsc::Sender<SensorMessage>,
    inbound: &mut mpsc::Receiver<SensorMessage>,
) -> Result<()> {
    sender
        .send(SensorMessage::version_request())
        .await
        .map_err(|_| GatewayError::NotConnected)?;
    let deadline = tokio::time::Instant::now() + inner.config.ack_timeout();
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(GatewayError::StartupCheckFailed);
        }
        match tokio::time::timeout(remaining, inbound.recv()).await {
            Ok(Some(message)) => {
                let verified = message.node_id == GATEWAY_NODE_ID
                    && message.is_internal(InternalType::Version);
                handle_message(inner, message).await;
                if verified {
                    return Ok(());
                }
            }
            Ok(None) => return Err(GatewayError::NotConnected),
            Err(_) => return Err(GatewayError::StartupCheckFailed),
        }
    }
}

/// Drop the current connection and its tasks.
async fn teardown(inner: &Arc<GatewayInner>) {
    *inner.sender.write().await = None;
    if let Some(mut connection) = inner.connection.lock().await.take() {
        connection.shutdown().await;
    }
    let mut tasks = inner.tasks.lock().await;
    if let Some(task) = tasks.inbound.take() {
        let _ = tokio::time::timeout(TASK_JOIN_WAIT, task).await;
    }
    if let Some(task) = tasks.status.take() {
        task.abort();
    }
}

async fn send_raw(inner: &Arc<GatewayInner>, message: SensorMessage) -> Result<()> {
    let sender = inner.sender.read().await.clone();
    let Some(sender) = sender else {
        return Err(GatewayError::NotConnected);
    };
    sender
        .send(message)
        .await
        .map_err(|_| GatewayError::NotConnected)
}

async fn handle_message(inner: &Arc<GatewayInner>, message: SensorMessage) {
    tracing::trace!(%message, "received");
    inner.bus.publish(GatewayEvent::MessageReceived(message.clone()));

    if message.node_id == GATEWAY_NODE_ID && message.is_internal(InternalType::Version) {
        *inner.gateway_seen.lock().await = Some(Utc::now());
    }

    if message.ack && resolve_pending(inner, &message).await {
        touch_node(inner, message.node_id).await;
        return;
    }
    touch_node(inner, message.node_id).await;

    match message.message_type {
        MessageType::Presentation => handle_presentation(inner, message).await,
        MessageType::Set => handle_set(inner, message).await,
        MessageType::Req => handle_req(inner, message).await,
        MessageType::Internal => handle_internal(inner, message).await,
        MessageType::Stream => {
            tracing::debug!(node_id = message.node_id, "stream message ignored")
        }
    }
}

/// Resolve a pending command this message acknowledges, if any.
async fn resolve_pending(inner: &Arc<GatewayInner>, message: &SensorMessage) -> bool {
    let key = message.slot_hash();
    let resolved = inner.pending.lock().await.remove(&key).is_some();
    if resolved {
        tracing::debug!(
            node_id = message.node_id,
            child_id = message.child_id,
            "command acknowledged"
        );
    }
    resolved
}

/// Record liveness for any traffic from an addressable node.
async fn touch_node(inner: &Arc<GatewayInner>, node_id: u8) {
    if NodeId::new(node_id).is_err() {
        return;
    }
    let became_reachable = {
        let mut tree = inner.tree.write().await;
        match tree.get_node_mut(node_id) {
            Some(node) => {
                node.mark_seen();
                if !node.reachable {
                    node.reachable = true;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    };
    if became_reachable {
        inner.bus.publish(GatewayEvent::ReachabilityChanged {
            node_id,
            reachable: true,
        });
    }
}

async fn handle_presentation(inner: &Arc<GatewayInner>, message: SensorMessage) {
    let Ok(node_id) = NodeId::new(message.node_id) else {
        tracing::debug!(
            node_id = message.node_id,
            "presentation from reserved address ignored"
        );
        return;
    };
    let Some(presentation) = message.presentation_type() else {
        return;
    };

    let new_node;
    let mut new_child = false;
    {
        let mut tree = inner.tree.write().await;
        new_node = tree.add_node(Node::new(node_id));
        let Some(node) = tree.get_node_mut(node_id.get()) else {
            return;
        };
        node.mark_seen();
        if message.child_id == INTERNAL_CHILD_ID {
            // Node-level presentation; the payload carries the library
            // version, which we keep only in the log.
            tracing::debug!(%node_id, library = %message.payload, "node presented");
        } else if let Ok(child_id) = ChildId::new(message.child_id) {
            match node.child_mut(child_id.get()) {
                Some(child) => {
                    // Re-presentation updates type and description in
                    // place without firing discovery again.
                    child.presentation = presentation;
                    child.description = message.payload.clone();
                }
                None => {
                    node.add_child(Child::new(child_id, presentation, message.payload.clone()));
                    new_child = true;
                }
            }
        }
    }

    if new_node {
        inner.bus.publish(GatewayEvent::NodeDiscovered {
            node_id: node_id.get(),
            from_cache: false,
        });
    }
    if new_child {
        inner.bus.publish(GatewayEvent::ChildDiscovered {
            node_id: node_id.get(),
            child_id: message.child_id,
            presentation,
            description: message.payload,
        });
    }
}

async fn handle_set(inner: &Arc<GatewayInner>, message: SensorMessage) {
    let Some(variable) = message.variable_type() else {
        return;
    };
    {
        let mut tree = inner.tree.write().await;
        let Some(node) = tree.get_node_mut(message.node_id) else {
            tracing::debug!(node_id = message.node_id, "set for unknown node dropped");
            return;
        };
        let Some(child) = node.child_mut(message.child_id) else {
            tracing::debug!(
                node_id = message.node_id,
                child_id = message.child_id,
                "set for unpresented child dropped"
            );
            return;
        };
        child.set_variable(message.sub_type, message.payload.clone());
    }
    let handler = inner.registry.resolve(message.node_id, message.child_id).await;
    inner.bus.publish(GatewayEvent::VariableChanged {
        node_id: message.node_id,
        child_id: message.child_id,
        variable,
        value: message.payload,
        handler,
    });
}

/// A node asks for the last known value of one of its variables; answer
/// from the tree if we have ever seen one.
async fn handle_req(inner: &Arc<GatewayInner>, message: SensorMessage) {
    let value = {
        let tree = inner.tree.read().await;
        tree.get_node(message.node_id)
            .and_then(|node| node.child(message.child_id))
            .and_then(|child| child.variable(message.sub_type))
            .map(|variable| variable.value.clone())
    };
    match value {
        Some(value) => {
            let reply = SensorMessage::new(
                message.node_id,
                message.child_id,
                MessageType::Set,
                false,
                message.sub_type,
                value,
            );
            if let Err(e) = send_raw(inner, reply).await {
                tracing::warn!(error = %e, "req reply not sent");
            }
        }
        None => tracing::debug!(
            node_id = message.node_id,
            child_id = message.child_id,
            sub_type = message.sub_type,
            "req for a variable never seen"
        ),
    }
}

async fn handle_internal(inner: &Arc<GatewayInner>, message: SensorMessage) {
    let Some(internal) = message.internal_type() else {
        return;
    };
    match internal {
        InternalType::BatteryLevel => match message.payload.parse::<u8>() {
            Ok(level) => {
                set_node_field(inner, message.node_id, |node| {
                    node.battery_level = Some(level.min(100));
                })
                .await;
            }
            Err(_) => tracing::debug!(
                node_id = message.node_id,
                payload = %message.payload,
                "unparseable battery level"
            ),
        },
        InternalType::SketchName => {
            let name = message.payload.clone();
            set_node_field(inner, message.node_id, move |node| {
                node.sketch_name = Some(name);
            })
            .await;
        }
        InternalType::SketchVersion => {
            let version = message.payload.clone();
            set_node_field(inner, message.node_id, move |node| {
                node.sketch_version = Some(version);
            })
            .await;
        }
        InternalType::IdRequest => {
            if let Err(e) = reserve_node_id(inner).await {
                tracing::warn!(error = %e, "id reservation failed");
            }
        }
        InternalType::Time => {
            let reply = SensorMessage::time_response(message.node_id, Utc::now().timestamp());
            if let Err(e) = send_raw(inner, reply).await {
                tracing::warn!(error = %e, "time reply not sent");
            }
        }
        InternalType::Config => {
            let reply = SensorMessage::config_response(message.node_id, inner.config.imperial);
            if let Err(e) = send_raw(inner, reply).await {
                tracing::warn!(error = %e, "config reply not sent");
            }
        }
        InternalType::LogMessage | InternalType::Debug => {
            tracing::debug!(node_id = message.node_id, log = %message.payload, "device log");
        }
        InternalType::GatewayReady => {
            tracing::info!("gateway device ready");
        }
        InternalType::HeartbeatResponse | InternalType::Pong => {
            // Liveness already recorded on the dispatch path.
        }
        InternalType::Version => {
            tracing::debug!(node_id = message.node_id, version = %message.payload, "version report");
        }
        InternalType::Locked => handle_locked(inner, message.node_id).await,
        other => tracing::debug!(
            ?other,
            node_id = message.node_id,
            "unhandled internal message"
        ),
    }
}

async fn set_node_field(inner: &Arc<GatewayInner>, node_id: u8, apply: impl FnOnce(&mut Node)) {
    let mut tree = inner.tree.write().await;
    if let Some(node) = tree.get_node_mut(node_id) {
        apply(node);
    }
}

/// A node reports itself locked: fail its pending commands with an
/// explicit rejection and take it out of the reachable set.
async fn handle_locked(inner: &Arc<GatewayInner>, node_id: u8) {
    tracing::warn!(node_id, "node reports itself locked");
    let failed: Vec<PendingCommand> = {
        let mut pending = inner.pending.lock().await;
        let keys: Vec<u64> = pending
            .iter()
            .filter(|(_, command)| command.node_id == node_id)
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter().filter_map(|key| pending.remove(&key)).collect()
    };
    for command in failed {
        fail_command(inner, command, CommandFailure::Rejected("node locked".into())).await;
    }

    let became_unreachable = {
        let mut tree = inner.tree.write().await;
        match tree.get_node_mut(node_id) {
            Some(node) if node.reachable => {
                node.reachable = false;
                true
            }
            _ => false,
        }
    };
    if became_unreachable {
        inner.bus.publish(GatewayEvent::ReachabilityChanged {
            node_id,
            reachable: false,
        });
    }
}

/// Roll back the optimistic update and surface the failure.
async fn fail_command(inner: &Arc<GatewayInner>, command: PendingCommand, reason: CommandFailure) {
    {
        let mut tree = inner.tree.write().await;
        if let Some(node) = tree.get_node_mut(command.node_id) {
            match node.revert_variable(command.child_id, command.variable.code()) {
                Ok(()) => {}
                Err(TreeError::NothingToRevert { .. }) => {
                    // The optimistic write created this slot; with no prior
                    // value to restore, the unconfirmed slot is dropped.
                    if let Some(child) = node.child_mut(command.child_id) {
                        child.remove_variable(command.variable.code());
                    }
                }
                Err(e) => tracing::warn!(error = %e, "rollback failed"),
            }
        }
    }
    inner.bus.publish(GatewayEvent::CommandFailed {
        node_id: command.node_id,
        child_id: command.child_id,
        variable: command.variable,
        reason,
    });
}

/// Allocate the lowest free id, persist it before replying so a crash
/// cannot hand the same id out twice, then broadcast the assignment.
async fn reserve_node_id(inner: &Arc<GatewayInner>) -> Result<u8> {
    let reserved = {
        let mut tree = inner.tree.write().await;
        let Some(free) = tree.lowest_free_node_id() else {
            tracing::warn!("id request with no free node id left");
            return Err(TreeError::NoFreeNodeId.into());
        };
        let node_id = NodeId::new(free)?;
        let mut node = Node::new(node_id);
        node.mark_seen();
        tree.add_node(node);
        free
    };

    if let Err(e) = inner.cache.reserve(reserved) {
        inner.tree.write().await.remove_node(reserved);
        return Err(e.into());
    }
    send_raw(inner, SensorMessage::id_response(reserved)).await?;
    inner.bus.publish(GatewayEvent::IdReserved { node_id: reserved });
    tracing::info!(node_id = reserved, "reserved node id");
    Ok(reserved)
}

/// Periodic liveness verification. One task owns both the link probe and
/// the node heartbeats, so passes never overlap.
fn spawn_sanity(inner: Arc<GatewayInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cfg = inner.config.sanity_check.clone();
        let mut interval = tokio::time::interval(Duration::from_secs(cfg.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut stop_rx = inner.stop.subscribe();
        let mut connection_failures: u32 = 0;
        let mut node_failures: HashMap<u8, u32> = HashMap::new();
        let mut last_probe: Option<DateTime<Utc>> = None;

        // The first tick fires immediately; probing starts one interval in.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }

            if let Some(probe_time) = last_probe {
                let link_alive = inner
                    .gateway_seen
                    .lock()
                    .await
                    .as_ref()
                    .map_or(false, |seen| *seen >= probe_time);
                if link_alive {
                    connection_failures = 0;
                } else {
                    connection_failures += 1;
                    tracing::warn!(
                        failures = connection_failures,
                        "gateway device missed a version probe"
                    );
                }
                if connection_failures >= cfg.max_connection_failures {
                    tracing::warn!("link considered dead, forcing a reconnect");
                    inner.bus.publish(GatewayEvent::ConnectionStatusChanged(
                        BridgeStatus::Offline {
                            reason: "liveness check failed".into(),
                        },
                    ));
                    teardown(&inner).await;
                    if let Err(e) = connect(&inner).await {
                        tracing::error!(error = %e, "reconnect failed");
                    }
                    connection_failures = 0;
                    node_failures.clear();
                    last_probe = None;
                    continue;
                }
                if cfg.heartbeat {
                    evaluate_node_probes(&inner, &mut node_failures, probe_time, cfg.max_node_failures)
                        .await;
                }
            }

            last_probe = Some(Utc::now());
            if let Err(e) = send_raw(&inner, SensorMessage::version_request()).await {
                tracing::warn!(error = %e, "version probe not sent");
            }
            if cfg.heartbeat {
                for node_id in inner.tree.read().await.node_ids() {
                    if let Err(e) = send_raw(&inner, SensorMessage::heartbeat_request(node_id)).await
                    {
                        tracing::warn!(node_id, error = %e, "heartbeat probe not sent");
                        break;
                    }
                }
            }
        }
        tracing::debug!("sanity check stopped");
    })
}

/// Compare each node's last sighting against the previous probe round and
/// mark repeat offenders unreachable.
async fn evaluate_node_probes(
    inner: &Arc<GatewayInner>,
    failures: &mut HashMap<u8, u32>,
    probe_time: DateTime<Utc>,
    max_failures: u32,
) {
    let mut lost = Vec::new();
    {
        let mut tree = inner.tree.write().await;
        for node in tree.nodes_mut() {
            let node_id = node.node_id.get();
            let answered = node.last_seen.map_or(false, |seen| seen >= probe_time);
            if answered {
                failures.remove(&node_id);
            } else {
                let count = failures.entry(node_id).or_insert(0);
                *count += 1;
                if *count >= max_failures && node.reachable {
                    node.reachable = false;
                    lost.push(node_id);
                }
            }
        }
    }
    for node_id in lost {
        tracing::warn!(node_id, "node stopped answering probes");
        inner.bus.publish(GatewayEvent::ReachabilityChanged {
            node_id,
            reachable: false,
        });
    }
}
