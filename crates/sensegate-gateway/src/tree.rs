//! The device tree: the authoritative, mutable topology cache.
//!
//! Topology is discovered incrementally at runtime: a node announces itself
//! and its children through PRESENTATION messages, and variables appear the
//! first time a SET mentions them. Ownership is strictly hierarchical
//! (the tree owns nodes, a node owns children, a child owns variables)
//! and lookups always pass through the owning container.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sensegate_protocol::PresentationType;
use serde::{Deserialize, Serialize};

/// Errors raised at the topology validation boundary.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TreeError {
    /// Node ids live in [1, 254]; 0 is the gateway, 255 is broadcast.
    #[error("invalid node id: {0} (valid range 1-254)")]
    InvalidNodeId(u8),

    /// Child id 255 is reserved for node-level internal messages.
    #[error("invalid child id: {0} (255 is reserved)")]
    InvalidChildId(u8),

    /// Lookup addressed a node the tree does not know.
    #[error("unknown node: {0}")]
    UnknownNode(u8),

    /// Lookup addressed a child the node does not have.
    #[error("unknown child {child_id} on node {node_id}")]
    UnknownChild { node_id: u8, child_id: u8 },

    /// Revert was requested for a variable with no prior recorded value.
    /// A caller logic error, never silently absorbed.
    #[error("nothing to revert for variable {variable_type} of child {child_id} on node {node_id}")]
    NothingToRevert {
        node_id: u8,
        child_id: u8,
        variable_type: u8,
    },

    /// All 254 node ids are taken.
    #[error("no free node id left")]
    NoFreeNodeId,
}

/// Validated node address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u8);

impl NodeId {
    /// Lowest assignable node id.
    pub const MIN: u8 = 1;
    /// Highest assignable node id.
    pub const MAX: u8 = 254;

    pub fn new(id: u8) -> Result<Self, TreeError> {
        if !(Self::MIN..=Self::MAX).contains(&id) {
            return Err(TreeError::InvalidNodeId(id));
        }
        Ok(Self(id))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated child address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChildId(u8);

impl ChildId {
    pub fn new(id: u8) -> Result<Self, TreeError> {
        if id == sensegate_protocol::INTERNAL_CHILD_ID {
            return Err(TreeError::InvalidChildId(id));
        }
        Ok(Self(id))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for ChildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error marker: revert requested with no recorded history.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("no previous value recorded")]
pub struct NoHistory;

/// A single typed value slot within a child.
///
/// Holds the current value plus one level of history for revert: when a
/// locally originated SET is not acknowledged, the previous value and its
/// original timestamp are restored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Current value, as carried on the wire.
    pub value: String,
    /// Previous value and its update timestamp, for revert.
    previous: Option<(String, DateTime<Utc>)>,
    /// When `value` was last written.
    pub last_updated: DateTime<Utc>,
}

impl Variable {
    /// First sighting of the variable.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            previous: None,
            last_updated: Utc::now(),
        }
    }

    /// Update the value, keeping the outgoing value as revert history.
    pub fn set(&mut self, value: impl Into<String>) {
        self.previous = Some((std::mem::take(&mut self.value), self.last_updated));
        self.value = value.into();
        self.last_updated = Utc::now();
    }

    /// Roll back to the previous value and its original timestamp.
    ///
    /// Consumes the history: a second revert without an intervening `set`
    /// fails again.
    pub fn revert(&mut self) -> Result<(), NoHistory> {
        match self.previous.take() {
            Some((value, timestamp)) => {
                self.value = value;
                self.last_updated = timestamp;
                Ok(())
            }
            None => Err(NoHistory),
        }
    }

    /// Whether a revert is currently possible.
    pub fn has_history(&self) -> bool {
        self.previous.is_some()
    }
}

/// A logical sensor/actuator endpoint within a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Child {
    pub child_id: ChildId,
    /// Sensor type announced by PRESENTATION.
    pub presentation: PresentationType,
    /// Free-form description from the presentation payload.
    pub description: String,
    /// Variable slots, keyed by the wire sub-type code.
    pub variables: HashMap<u8, Variable>,
}

impl Child {
    pub fn new(child_id: ChildId, presentation: PresentationType, description: impl Into<String>) -> Self {
        Self {
            child_id,
            presentation,
            description: description.into(),
            variables: HashMap::new(),
        }
    }

    /// Current value of a variable, if ever seen.
    pub fn variable(&self, variable_type: u8) -> Option<&Variable> {
        self.variables.get(&variable_type)
    }

    /// Write a variable, creating the slot on first sight.
    pub fn set_variable(&mut self, variable_type: u8, value: impl Into<String>) {
        match self.variables.get_mut(&variable_type) {
            Some(var) => var.set(value),
            None => {
                self.variables.insert(variable_type, Variable::new(value));
            }
        }
    }

    /// Drop a variable slot, returning it if present.
    pub fn remove_variable(&mut self, variable_type: u8) -> Option<Variable> {
        self.variables.remove(&variable_type)
    }
}

/// A physical remote device addressed by a numeric id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    /// Children keyed by child id.
    pub children: HashMap<u8, Child>,
    /// Whether the node answered its most recent liveness probes.
    pub reachable: bool,
    /// Last time any message from this node was seen.
    pub last_seen: Option<DateTime<Utc>>,
    /// Battery level in percent, from I_BATTERY_LEVEL.
    pub battery_level: Option<u8>,
    /// Firmware sketch metadata, from I_SKETCH_NAME / I_SKETCH_VERSION.
    pub sketch_name: Option<String>,
    pub sketch_version: Option<String>,
}

impl Node {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            children: HashMap::new(),
            reachable: true,
            last_seen: None,
            battery_level: None,
            sketch_name: None,
            sketch_version: None,
        }
    }

    /// A node restored from the id cache: known to exist, but with no live
    /// topology yet and not assumed reachable.
    pub fn restored(node_id: NodeId) -> Self {
        Self {
            reachable: false,
            ..Self::new(node_id)
        }
    }

    pub fn child(&self, child_id: u8) -> Option<&Child> {
        self.children.get(&child_id)
    }

    pub fn child_mut(&mut self, child_id: u8) -> Option<&mut Child> {
        self.children.get_mut(&child_id)
    }

    /// Add a child if absent; an existing child is left untouched.
    /// Returns whether the child was newly added.
    pub fn add_child(&mut self, child: Child) -> bool {
        match self.children.entry(child.child_id.get()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(child);
                true
            }
        }
    }

    /// Merge another instance of this node into this one, base-wins:
    /// children present only in `incoming` are added, children present in
    /// both stay exactly as they are here. Freshly learned topology must
    /// not overwrite state already tracked live.
    pub fn merge_from(&mut self, incoming: Node) {
        debug_assert_eq!(self.node_id, incoming.node_id);
        for (id, child) in incoming.children {
            self.children.entry(id).or_insert(child);
        }
    }

    pub fn mark_seen(&mut self) {
        self.last_seen = Some(Utc::now());
    }

    /// Roll back a variable after a failed optimistic update.
    pub fn revert_variable(&mut self, child_id: u8, variable_type: u8) -> Result<(), TreeError> {
        let node_id = self.node_id.get();
        let child = self
            .children
            .get_mut(&child_id)
            .ok_or(TreeError::UnknownChild { node_id, child_id })?;
        let revert_err = TreeError::NothingToRevert {
            node_id,
            child_id,
            variable_type,
        };
        let var = child
            .variables
            .get_mut(&variable_type)
            .ok_or(revert_err.clone())?;
        var.revert().map_err(|_| revert_err)
    }
}

/// The node map. The gateway is its sole owner; concurrent access goes
/// through the gateway's lock.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DeviceTree {
    nodes: HashMap<u8, Node>,
}

impl DeviceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_node(&self, id: u8) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_node_mut(&mut self, id: u8) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Insert a node, merging if the id is already present (base wins).
    /// Returns whether the node was new to the tree.
    pub fn add_node(&mut self, node: Node) -> bool {
        match self.nodes.entry(node.node_id.get()) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().merge_from(node);
                false
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(node);
                true
            }
        }
    }

    pub fn remove_node(&mut self, id: u8) -> Option<Node> {
        self.nodes.remove(&id)
    }

    pub fn contains(&self, id: u8) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Lowest unused id in the assignable range, for ID reservation.
    pub fn lowest_free_node_id(&self) -> Option<u8> {
        (NodeId::MIN..=NodeId::MAX).find(|id| !self.nodes.contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u8) -> Node {
        Node::new(NodeId::new(id).unwrap())
    }

    fn child(id: u8, presentation: PresentationType) -> Child {
        Child::new(ChildId::new(id).unwrap(), presentation, "")
    }

    #[test]
    fn node_id_range_is_enforced() {
        assert_eq!(NodeId::new(0), Err(TreeError::InvalidNodeId(0)));
        assert_eq!(NodeId::new(255), Err(TreeError::InvalidNodeId(255)));
        assert!(NodeId::new(1).is_ok());
        assert!(NodeId::new(254).is_ok());
    }

    #[test]
    fn child_id_rejects_reserved() {
        assert_eq!(ChildId::new(255), Err(TreeError::InvalidChildId(255)));
        assert!(ChildId::new(0).is_ok());
        assert!(ChildId::new(254).is_ok());
    }

    #[test]
    fn revert_without_history_fails() {
        let mut var = Variable::new("21.5");
        assert!(var.revert().is_err());
        assert_eq!(var.value, "21.5");
    }

    #[test]
    fn revert_restores_value_and_timestamp() {
        let mut var = Variable::new("21.5");
        let original_ts = var.last_updated;

        var.set("23.0");
        assert_eq!(var.value, "23.0");
        assert!(var.has_history());

        var.revert().unwrap();
        assert_eq!(var.value, "21.5");
        assert_eq!(var.last_updated, original_ts);

        // History is consumed.
        assert!(var.revert().is_err());
    }

    #[test]
    fn merge_adds_only_missing_nodes() {
        let mut tree = DeviceTree::new();
        tree.add_node(node(1));
        tree.add_node(node(2));

        for id in [4, 6, 7] {
            tree.add_node(node(id));
        }
        assert_eq!(tree.node_ids(), vec![1, 2, 4, 6, 7]);
    }

    #[test]
    fn merge_base_wins_on_conflict() {
        let mut tree = DeviceTree::new();
        let mut base = node(1);
        base.add_child(child(0, PresentationType::Temperature));
        base.sketch_name = Some("live".into());
        tree.add_node(base);

        let mut incoming = node(1);
        incoming.add_child(child(0, PresentationType::Humidity));
        incoming.add_child(child(1, PresentationType::Motion));
        incoming.sketch_name = Some("stale".into());
        assert!(!tree.add_node(incoming));

        let merged = tree.get_node(1).unwrap();
        // Conflicting child keeps the base's presentation; new child added.
        assert_eq!(
            merged.child(0).unwrap().presentation,
            PresentationType::Temperature
        );
        assert_eq!(
            merged.child(1).unwrap().presentation,
            PresentationType::Motion
        );
        assert_eq!(merged.sketch_name.as_deref(), Some("live"));
    }

    #[test]
    fn lowest_free_id_skips_taken() {
        let mut tree = DeviceTree::new();
        assert_eq!(tree.lowest_free_node_id(), Some(1));
        tree.add_node(node(1));
        tree.add_node(node(2));
        tree.add_node(node(4));
        assert_eq!(tree.lowest_free_node_id(), Some(3));
    }

    #[test]
    fn variables_create_on_first_set() {
        let mut c = child(0, PresentationType::Temperature);
        c.set_variable(0, "21.5");
        assert_eq!(c.variable(0).unwrap().value, "21.5");
        assert!(!c.variable(0).unwrap().has_history());

        c.set_variable(0, "22.0");
        assert!(c.variable(0).unwrap().has_history());
    }
}
