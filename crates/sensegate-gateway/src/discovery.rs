//! Discovery service: surfaces newly seen nodes and children to the
//! host's inventory.
//!
//! Listens to the gateway event bus and maintains a deduplicated
//! inventory. Cache-restored nodes are recorded but not announced, since
//! they are not "new" after a restart; live presentations are announced exactly
//! once per entity.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sensegate_protocol::PresentationType;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;

use crate::events::{GatewayEvent, GatewayEventBus};
use crate::registry::thing_type_for;

/// One inventory entry. `child_id` is `None` for node-level entries
/// (cache restores that have not presented yet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredSensor {
    pub node_id: u8,
    pub child_id: Option<u8>,
    pub presentation: Option<PresentationType>,
    /// Host thing type, when the presentation maps to one.
    pub thing_type: Option<String>,
    pub description: String,
    /// Known only from the id cache, no live presentation yet.
    pub from_cache: bool,
    pub first_seen: DateTime<Utc>,
}

/// Background inventory of everything the bridge has seen.
pub struct DiscoveryService {
    inventory: Arc<RwLock<HashMap<(u8, Option<u8>), DiscoveredSensor>>>,
    announce_tx: broadcast::Sender<DiscoveredSensor>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl DiscoveryService {
    /// Subscribe to the bus and start tracking.
    pub fn start(bus: &GatewayEventBus) -> Self {
        let inventory: Arc<RwLock<HashMap<(u8, Option<u8>), DiscoveredSensor>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (announce_tx, _) = broadcast::channel(64);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let mut events = bus.subscribe();
        let task_inventory = inventory.clone();
        let task_announce = announce_tx.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Some(event) => {
                            Self::apply(&task_inventory, &task_announce, event).await;
                        }
                        None => break,
                    }
                }
            }
            tracing::debug!("discovery service stopped");
        });

        Self {
            inventory,
            announce_tx,
            stop_tx,
            task: Some(task),
        }
    }

    async fn apply(
        inventory: &RwLock<HashMap<(u8, Option<u8>), DiscoveredSensor>>,
        announce: &broadcast::Sender<DiscoveredSensor>,
        event: GatewayEvent,
    ) {
        match event {
            GatewayEvent::NodeDiscovered { node_id, from_cache } => {
                let mut inventory = inventory.write().await;
                if inventory.contains_key(&(node_id, None)) {
                    return;
                }
                let entry = DiscoveredSensor {
                    node_id,
                    child_id: None,
                    presentation: None,
                    thing_type: None,
                    description: String::new(),
                    from_cache,
                    first_seen: Utc::now(),
                };
                inventory.insert((node_id, None), entry.clone());
                drop(inventory);
                if !from_cache {
                    tracing::info!(node_id, "discovered node");
                    let _ = announce.send(entry);
                }
            }
            GatewayEvent::ChildDiscovered {
                node_id,
                child_id,
                presentation,
                description,
            } => {
                let mut inventory = inventory.write().await;
                if inventory.contains_key(&(node_id, Some(child_id))) {
                    return;
                }
                let entry = DiscoveredSensor {
                    node_id,
                    child_id: Some(child_id),
                    presentation: Some(presentation),
                    thing_type: thing_type_for(presentation).map(str::to_string),
                    description,
                    from_cache: false,
                    first_seen: Utc::now(),
                };
                inventory.insert((node_id, Some(child_id)), entry.clone());
                drop(inventory);
                tracing::info!(node_id, child_id, ?presentation, "discovered child");
                let _ = announce.send(entry);
            }
            _ => {}
        }
    }

    /// Snapshot of the inventory, ordered by address.
    pub async fn results(&self) -> Vec<DiscoveredSensor> {
        let mut entries: Vec<DiscoveredSensor> =
            self.inventory.read().await.values().cloned().collect();
        entries.sort_by_key(|e| (e.node_id, e.child_id));
        entries
    }

    /// Live stream of announcements for host inventory integration.
    pub fn announcements(&self) -> broadcast::Receiver<DiscoveredSensor> {
        self.announce_tx.subscribe()
    }

    /// Stop the background task.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}
