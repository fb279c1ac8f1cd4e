//! Bidirectional id ↔ node table.
//!
//! ```text
//!   by_id   : NodeId ──► K        (long-poll responders resolve targets)
//!   by_node : K      ──► NodeId   (the tracker emits references)
//! ```
//!
//! Ids are handed out from a monotonically increasing counter starting at 0
//! and are never reused within one table, so a stale id held by a client can
//! never resolve to a different node. Slot reuse on the node side is guarded
//! by the generational keys of the arena that owns the nodes.
//!
//! The table is shared between the command worker (writes) and request
//! handlers (reads), so every operation takes the internal lock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock};

/// Identity of a tracked node as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity table errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The node already has an identity.
    AlreadyPresent(NodeId),
    /// The id is already bound to another node.
    IdInUse(NodeId),
    /// No node is bound to this id.
    IdNotFound(NodeId),
    /// The node has no identity.
    NodeNotFound,
    /// `remove_pair` was called with an id that is bound to a different node.
    PairMismatch(NodeId),
    /// The id space is used up.
    Exhausted,
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::AlreadyPresent(id) => write!(f, "Node is already registered with id {id}"),
            IdentityError::IdInUse(id) => write!(f, "Id {id} is already in use"),
            IdentityError::IdNotFound(id) => write!(f, "No node with id {id}"),
            IdentityError::NodeNotFound => write!(f, "Node has no identity"),
            IdentityError::PairMismatch(id) => write!(f, "Id {id} is bound to a different node"),
            IdentityError::Exhausted => write!(f, "Identity space exhausted"),
        }
    }
}

impl std::error::Error for IdentityError {}

#[derive(Debug)]
struct Inner<K> {
    // Wider than the id so that `u32::MAX` itself can be handed out.
    next: u64,
    by_id: HashMap<NodeId, K>,
    by_node: HashMap<K, NodeId>,
}

/// Thread-safe bidirectional map between wire ids and node keys.
#[derive(Debug)]
pub struct IdentityTable<K> {
    inner: RwLock<Inner<K>>,
}

impl<K> Default for IdentityTable<K> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next: 0,
                by_id: HashMap::new(),
                by_node: HashMap::new(),
            }),
        }
    }
}

impl<K: Copy + Eq + Hash> IdentityTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next free id to `node`.
    pub fn add(&self, node: K) -> Result<NodeId, IdentityError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = inner.by_node.get(&node) {
            return Err(IdentityError::AlreadyPresent(*existing));
        }
        let id = NodeId(u32::try_from(inner.next).map_err(|_| IdentityError::Exhausted)?);
        inner.next += 1;
        inner.by_id.insert(id, node);
        inner.by_node.insert(node, id);
        Ok(id)
    }

    /// Bind `node` to an id chosen elsewhere.
    ///
    /// Used by the client mirror when a placeholder learns its server id.
    /// Subsequent `add` calls never hand out an id at or below `id`.
    pub fn associate(&self, id: NodeId, node: K) -> Result<(), IdentityError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = inner.by_node.get(&node) {
            return Err(IdentityError::AlreadyPresent(*existing));
        }
        if inner.by_id.contains_key(&id) {
            return Err(IdentityError::IdInUse(id));
        }
        inner.by_id.insert(id, node);
        inner.by_node.insert(node, id);
        inner.next = inner.next.max(u64::from(id.0) + 1);
        Ok(())
    }

    pub fn id(&self, node: K) -> Result<NodeId, IdentityError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_node.get(&node).copied().ok_or(IdentityError::NodeNotFound)
    }

    pub fn node(&self, id: NodeId) -> Result<K, IdentityError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_id.get(&id).copied().ok_or(IdentityError::IdNotFound(id))
    }

    pub fn contains_node(&self, node: K) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_node.contains_key(&node)
    }

    pub fn contains_id(&self, id: NodeId) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_id.contains_key(&id)
    }

    /// Retract the identity of `node`, returning the id it held.
    pub fn remove_node(&self, node: K) -> Result<NodeId, IdentityError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = inner.by_node.remove(&node).ok_or(IdentityError::NodeNotFound)?;
        inner.by_id.remove(&id);
        Ok(id)
    }

    /// Retract `id`, returning the node it was bound to.
    pub fn remove_id(&self, id: NodeId) -> Result<K, IdentityError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let node = inner.by_id.remove(&id).ok_or(IdentityError::IdNotFound(id))?;
        inner.by_node.remove(&node);
        Ok(node)
    }

    /// Retract `id` only if it is still bound to `node`.
    pub fn remove_pair(&self, id: NodeId, node: K) -> Result<(), IdentityError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.by_id.get(&id) {
            None => Err(IdentityError::IdNotFound(id)),
            Some(bound) if *bound != node => Err(IdentityError::PairMismatch(id)),
            Some(_) => {
                inner.by_id.remove(&id);
                inner.by_node.remove(&node);
                Ok(())
            }
        }
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every mapping. The id counter keeps counting.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.by_id.clear();
        inner.by_node.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ids_start_at_zero() {
        let table = IdentityTable::new();
        assert_eq!(table.add('a').unwrap(), NodeId(0));
        assert_eq!(table.add('b').unwrap(), NodeId(1));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_lookup_both_directions() {
        let table = IdentityTable::new();
        let id = table.add("root").unwrap();
        assert_eq!(table.id("root").unwrap(), id);
        assert_eq!(table.node(id).unwrap(), "root");
        assert!(table.contains_node("root"));
        assert!(table.contains_id(id));
        assert_eq!(table.id("other"), Err(IdentityError::NodeNotFound));
        assert_eq!(table.node(NodeId(9)), Err(IdentityError::IdNotFound(NodeId(9))));
    }

    #[test]
    fn test_duplicate_add_fails() {
        let table = IdentityTable::new();
        let id = table.add(7u8).unwrap();
        assert_eq!(table.add(7u8), Err(IdentityError::AlreadyPresent(id)));
    }

    #[test]
    fn test_ids_are_not_reused() {
        let table = IdentityTable::new();
        let first = table.add(1).unwrap();
        table.remove_node(1).unwrap();
        let second = table.add(1).unwrap();
        assert_ne!(first, second);
        assert!(!table.contains_id(first));
    }

    #[test]
    fn test_remove_by_id() {
        let table = IdentityTable::new();
        let id = table.add(5).unwrap();
        assert_eq!(table.remove_id(id).unwrap(), 5);
        assert!(!table.contains_node(5));
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_pair_requires_match() {
        let table = IdentityTable::new();
        let a = table.add('a').unwrap();
        table.add('b').unwrap();
        assert_eq!(table.remove_pair(a, 'b'), Err(IdentityError::PairMismatch(a)));
        assert!(table.contains_node('a'));
        table.remove_pair(a, 'a').unwrap();
        assert!(!table.contains_node('a'));
        assert_eq!(table.remove_pair(a, 'a'), Err(IdentityError::IdNotFound(a)));
    }

    #[test]
    fn test_associate_moves_counter_forward() {
        let table = IdentityTable::new();
        table.associate(NodeId(10), 'x').unwrap();
        assert_eq!(table.add('y').unwrap(), NodeId(11));
        assert_eq!(table.associate(NodeId(10), 'z'), Err(IdentityError::IdInUse(NodeId(10))));
        assert_eq!(
            table.associate(NodeId(12), 'x'),
            Err(IdentityError::AlreadyPresent(NodeId(10)))
        );
    }

    #[test]
    fn test_last_id_is_assigned_before_exhaustion() {
        let table = IdentityTable::new();
        table.associate(NodeId(u32::MAX - 1), 1u32).unwrap();
        assert_eq!(table.add(2), Ok(NodeId(u32::MAX)));
        assert_eq!(table.add(3), Err(IdentityError::Exhausted));
        assert!(!table.contains_node(3));
    }

    #[test]
    fn test_concurrent_adds_are_unique() {
        let table = Arc::new(IdentityTable::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    (0..250).map(|i| table.add(t * 1000 + i).unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<NodeId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 2000);
        assert_eq!(table.len(), 2000);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(IdentityError::IdNotFound(NodeId(3)).to_string(), "No node with id 3");
        assert_eq!(IdentityError::NodeNotFound.to_string(), "Node has no identity");
    }
}
