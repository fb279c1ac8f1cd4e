//! Client-side replica of a session's view graph.
//!
//! The mirror is rebuilt from the change stream alone: the snapshot sent on
//! `open` creates every node, later deltas patch it. Nodes live in a local
//! slot map keyed by [`MirrorKey`]; an [`IdentityTable`] maps the server's
//! wire ids onto those keys.
//!
//! ```text
//!  Response ──► apply ──┬─ PropertyChange ─────────────► node.properties
//!                       ├─ ItemAdded / ItemRemoved ──► CollectionReconciler
//!                       │                                 │ handled?
//!                       │                     no ◄────────┘
//!                       │                      └──► node.items
//!                       └─ ItemsReordered ───────────► MirrorError
//! ```
//!
//! Speculative edits are bracketed by `begin_instruction`/`end_instruction`
//! and recorded in the reconciler so the server's confirmation of the same
//! edit is not applied twice.

use crate::reconciler::{CollectionReconciler, ReconcileError};
use serde_json::{Map, Value as Json};
use slotmap::{new_key_type, SlotMap};
use std::collections::{HashMap, HashSet};
use viewsync_core::{Change, IdentityError, IdentityTable, InstructionId, NodeId, Payload, Response};

new_key_type! {
    /// Handle to a node in a [`ClientMirror`].
    pub struct MirrorKey;
}

/// A mirrored property value or collection element.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorValue {
    Value(Json),
    Node(MirrorKey),
}

impl MirrorValue {
    pub fn as_node(&self) -> Option<MirrorKey> {
        match self {
            MirrorValue::Node(key) => Some(*key),
            MirrorValue::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Json> {
        match self {
            MirrorValue::Value(value) => Some(value),
            MirrorValue::Node(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_value().and_then(Json::as_i64)
    }
}

impl From<Json> for MirrorValue {
    fn from(value: Json) -> Self {
        MirrorValue::Value(value)
    }
}

impl From<MirrorKey> for MirrorValue {
    fn from(key: MirrorKey) -> Self {
        MirrorValue::Node(key)
    }
}

impl From<i64> for MirrorValue {
    fn from(value: i64) -> Self {
        MirrorValue::Value(Json::from(value))
    }
}

impl From<&str> for MirrorValue {
    fn from(value: &str) -> Self {
        MirrorValue::Value(Json::from(value))
    }
}

#[derive(Debug, Clone, Default)]
struct MirrorNode {
    properties: HashMap<String, MirrorValue>,
    items: Option<Vec<MirrorValue>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MirrorError {
    /// A change addressed an id the mirror has never seen.
    UnknownNode(NodeId),
    /// A local key that is not (or no longer) in the mirror.
    UnknownKey,
    NotACollection,
    IndexOutOfRange { index: usize, len: usize },
    /// Reordering deltas are not supported.
    ReorderUnsupported,
    Identity(IdentityError),
    Reconcile(ReconcileError),
}

impl MirrorError {
    /// Whether the mirror can only recover by refetching a snapshot.
    pub fn is_desynchronized(&self) -> bool {
        matches!(
            self,
            MirrorError::Reconcile(ReconcileError::Desynchronized)
                | MirrorError::Reconcile(ReconcileError::Unconfirmed { .. })
        )
    }
}

impl std::fmt::Display for MirrorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MirrorError::UnknownNode(id) => {
                write!(f, "invalid change received: component with id '{id}' does not exist")
            }
            MirrorError::UnknownKey => write!(f, "Node is not part of the mirror"),
            MirrorError::NotACollection => write!(f, "Node is not a collection"),
            MirrorError::IndexOutOfRange { index, len } => {
                write!(f, "Index {index} out of range for collection of length {len}")
            }
            MirrorError::ReorderUnsupported => write!(f, "Not implemented: reordering"),
            MirrorError::Identity(e) => write!(f, "Identity error: {e}"),
            MirrorError::Reconcile(e) => write!(f, "Reconcile error: {e}"),
        }
    }
}

impl std::error::Error for MirrorError {}

impl From<IdentityError> for MirrorError {
    fn from(e: IdentityError) -> Self {
        MirrorError::Identity(e)
    }
}

impl From<ReconcileError> for MirrorError {
    fn from(e: ReconcileError) -> Self {
        MirrorError::Reconcile(e)
    }
}

/// The client's copy of the view graph.
#[derive(Debug)]
pub struct ClientMirror {
    nodes: SlotMap<MirrorKey, MirrorNode>,
    ids: IdentityTable<MirrorKey>,
    reconciler: CollectionReconciler<MirrorKey, MirrorValue>,
    root: MirrorKey,
    next_instruction: u32,
}

impl Default for ClientMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientMirror {
    /// An empty mirror holding only the root (id 0).
    pub fn new() -> Self {
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(MirrorNode::default());
        let ids = IdentityTable::new();
        // Fresh table: id 0 is free.
        let _ = ids.associate(NodeId(0), root);
        Self {
            nodes,
            ids,
            reconciler: CollectionReconciler::new(),
            root,
            next_instruction: 0,
        }
    }

    pub fn root(&self) -> MirrorKey {
        self.root
    }

    pub fn get(&self, key: MirrorKey, property: &str) -> Option<&MirrorValue> {
        self.nodes.get(key)?.properties.get(property)
    }

    pub fn items(&self, key: MirrorKey) -> Option<&[MirrorValue]> {
        self.nodes.get(key)?.items.as_deref()
    }

    pub fn node_of(&self, id: NodeId) -> Option<MirrorKey> {
        self.ids.node(id).ok()
    }

    pub fn id_of(&self, key: MirrorKey) -> Option<NodeId> {
        self.ids.id(key).ok()
    }

    /// Number of nodes held, placeholders included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Apply a server response in order.
    ///
    /// On error the mirror may be partially updated; callers recover by
    /// [`reset`](Self::reset) followed by a fresh snapshot.
    pub fn apply(&mut self, response: &Response) -> Result<(), MirrorError> {
        for change in &response.changes {
            self.apply_change(change)?;
        }
        Ok(())
    }

    fn apply_change(&mut self, change: &Change) -> Result<(), MirrorError> {
        let target = self
            .ids
            .node(change.id())
            .map_err(|_| MirrorError::UnknownNode(change.id()))?;
        let Self {
            nodes,
            ids,
            reconciler,
            ..
        } = self;

        match change {
            Change::Property(c) => {
                let value = materialize(nodes, ids, &c.value)?;
                let node = nodes.get_mut(target).ok_or(MirrorError::UnknownKey)?;
                node.properties.insert(c.property_name.clone(), value);
            }
            Change::ItemAdded(c) => {
                let handled = reconciler.on_added_server_side(target, c.instruction_id, |edit| {
                    match (edit.item, c.item.as_reference()) {
                        (MirrorValue::Node(placeholder), Some(reference)) => ids
                            .associate(reference.id, placeholder)
                            .map_err(|_| ReconcileError::Desynchronized),
                        (MirrorValue::Value(_), None) => Ok(()),
                        _ => Err(ReconcileError::Desynchronized),
                    }
                })?;
                if !handled {
                    let value = materialize(nodes, ids, &c.item)?;
                    let items = items_mut(nodes, target)?;
                    let index = c.index.unwrap_or(items.len());
                    if index > items.len() {
                        return Err(MirrorError::IndexOutOfRange {
                            index,
                            len: items.len(),
                        });
                    }
                    items.insert(index, value);
                }
            }
            Change::ItemRemoved(c) => {
                let handled = reconciler.on_removed_server_side(target, c.instruction_id, |_| {
                    // Already removed locally unless the server names a node
                    // that is still present.
                    let Some(key) = c.removed_item_id.and_then(|id| ids.node(id).ok()) else {
                        return Ok(());
                    };
                    if let Some(items) = nodes.get_mut(target).and_then(|n| n.items.as_mut()) {
                        if let Some(pos) = items.iter().position(|v| v.as_node() == Some(key)) {
                            items.remove(pos);
                        }
                    }
                    Ok(())
                })?;
                if !handled {
                    let items = items_mut(nodes, target)?;
                    if c.index >= items.len() {
                        return Err(MirrorError::IndexOutOfRange {
                            index: c.index,
                            len: items.len(),
                        });
                    }
                    items.remove(c.index);
                }
            }
            Change::ItemsReordered(_) => return Err(MirrorError::ReorderUnsupported),
        }
        Ok(())
    }

    // --- speculative edits ---

    /// Open a speculative edit. The returned id must be sent with the
    /// command so the server stamps its collection deltas with it.
    pub fn begin_instruction(&mut self) -> Result<InstructionId, MirrorError> {
        let next = self.next_instruction.wrapping_add(1).max(1);
        let id = InstructionId(next);
        self.reconciler.on_command_start(id)?;
        self.next_instruction = next;
        Ok(id)
    }

    pub fn end_instruction(&mut self, id: InstructionId) -> Result<(), MirrorError> {
        self.reconciler.on_command_end(id)?;
        Ok(())
    }

    /// A local node with no server identity yet. It receives one when the
    /// server confirms the speculative insertion that introduced it.
    pub fn create_placeholder(&mut self, is_collection: bool) -> MirrorKey {
        self.nodes.insert(MirrorNode {
            properties: HashMap::new(),
            items: is_collection.then(Vec::new),
        })
    }

    /// Insert into a collection ahead of the server. `None` appends.
    pub fn speculative_insert(
        &mut self,
        collection: MirrorKey,
        index: Option<usize>,
        item: impl Into<MirrorValue>,
    ) -> Result<usize, MirrorError> {
        if self.reconciler.current().is_none() {
            return Err(ReconcileError::NoCommandRunning.into());
        }
        let item = item.into();
        let items = items_mut(&mut self.nodes, collection)?;
        let index = index.unwrap_or(items.len());
        if index > items.len() {
            return Err(MirrorError::IndexOutOfRange {
                index,
                len: items.len(),
            });
        }
        items.insert(index, item.clone());
        self.reconciler.on_added_client_side(collection, item, index)?;
        Ok(index)
    }

    /// Remove from a collection ahead of the server.
    pub fn speculative_remove(
        &mut self,
        collection: MirrorKey,
        index: usize,
    ) -> Result<MirrorValue, MirrorError> {
        if self.reconciler.current().is_none() {
            return Err(ReconcileError::NoCommandRunning.into());
        }
        let items = items_mut(&mut self.nodes, collection)?;
        if index >= items.len() {
            return Err(MirrorError::IndexOutOfRange {
                index,
                len: items.len(),
            });
        }
        let removed = items.remove(index);
        self.reconciler
            .on_removed_client_side(collection, removed.clone(), index)?;
        Ok(removed)
    }

    /// Set a property locally. The server's change, if any, overwrites it.
    pub fn set_local(
        &mut self,
        key: MirrorKey,
        property: &str,
        value: impl Into<MirrorValue>,
    ) -> Result<(), MirrorError> {
        let node = self.nodes.get_mut(key).ok_or(MirrorError::UnknownKey)?;
        node.properties.insert(property.to_string(), value.into());
        Ok(())
    }

    pub fn assert_consistent_when_idle(&self) -> Result<(), MirrorError> {
        self.reconciler.assert_consistent_when_idle()?;
        Ok(())
    }

    /// Speculative edits not yet confirmed by the server.
    pub fn pending_edits(&self) -> usize {
        self.reconciler.pending()
    }

    /// Forget everything and start over from a bare root.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.ids.clear();
        self.reconciler.clear();
        self.root = self.nodes.insert(MirrorNode::default());
        let _ = self.ids.associate(NodeId(0), self.root);
    }

    /// Render the subtree at `key` as JSON. Nodes become objects carrying
    /// their `__id`, collections become arrays. A node reached twice is
    /// rendered as a bare reference the second time.
    pub fn to_json(&self, key: MirrorKey) -> Json {
        let mut seen = HashSet::new();
        self.render(key, &mut seen)
    }

    fn render(&self, key: MirrorKey, seen: &mut HashSet<MirrorKey>) -> Json {
        let id = self.id_of(key).map(|id| Json::from(id.0));
        if !seen.insert(key) {
            let mut reference = Map::new();
            reference.insert("__id".into(), id.unwrap_or(Json::Null));
            return Json::Object(reference);
        }
        let Some(node) = self.nodes.get(key) else {
            return Json::Null;
        };
        if let Some(items) = &node.items {
            return Json::Array(items.iter().map(|v| self.render_value(v, seen)).collect());
        }
        let mut object = Map::new();
        object.insert("__id".into(), id.unwrap_or(Json::Null));
        for (name, value) in &node.properties {
            object.insert(name.clone(), self.render_value(value, seen));
        }
        Json::Object(object)
    }

    fn render_value(&self, value: &MirrorValue, seen: &mut HashSet<MirrorKey>) -> Json {
        match value {
            MirrorValue::Value(json) => json.clone(),
            MirrorValue::Node(key) => self.render(*key, seen),
        }
    }
}

/// Resolve a wire payload, creating the node on first sight of a reference.
fn materialize(
    nodes: &mut SlotMap<MirrorKey, MirrorNode>,
    ids: &IdentityTable<MirrorKey>,
    payload: &Payload,
) -> Result<MirrorValue, MirrorError> {
    match payload {
        Payload::Value(json) => Ok(MirrorValue::Value(json.clone())),
        Payload::Reference(reference) => {
            if let Ok(key) = ids.node(reference.id) {
                return Ok(MirrorValue::Node(key));
            }
            let key = nodes.insert(MirrorNode {
                properties: HashMap::new(),
                items: reference.is_collection.then(Vec::new),
            });
            ids.associate(reference.id, key)?;
            Ok(MirrorValue::Node(key))
        }
    }
}

fn items_mut(
    nodes: &mut SlotMap<MirrorKey, MirrorNode>,
    key: MirrorKey,
) -> Result<&mut Vec<MirrorValue>, MirrorError> {
    nodes
        .get_mut(key)
        .ok_or(MirrorError::UnknownKey)?
        .items
        .as_mut()
        .ok_or(MirrorError::NotACollection)
}
