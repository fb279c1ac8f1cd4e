//! Change tracker.
//!
//! ```text
//!   command code ──► View::set_property / insert_item / remove_item
//!                       │
//!                       ├─► Model         (mutate)
//!                       ├─► IdentityTable (register / retract subtrees)
//!                       └─► ChangeLog     (append deltas, in mutation order)
//! ```
//!
//! A [`View`] owns the model of one session. Every node reachable from the
//! root has an identity; mutations of registered nodes are recorded as
//! [`Change`]s. Mutations of nodes that are not (yet) part of the tracked
//! graph go straight to the model, which lets command code assemble a
//! subtree before attaching it.
//!
//! When a node subtree is attached, the referencing delta is appended first
//! and the subtree's full state follows, so a client always knows an
//! identity before it receives changes addressed to it.

use crate::change::{Change, ChangeLog, InstructionId, Payload};
use crate::identity::{IdentityTable, NodeId};
use crate::model::{GraphError, Model, NodeData, NodeKey, Value};
use crate::schema::PropertyDescriptor;
use crate::substitution::Substitutions;
use crate::visitor::{self, GraphVisitor};
use log::{debug, error};
use std::collections::HashSet;
use std::sync::Arc;

/// Collection mutations as an application might express them.
///
/// Only single-item `Add` and `Remove` are supported.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionMutation {
    Add { index: usize, items: Vec<Value> },
    Remove { index: usize, count: usize },
    Move { from: usize, to: usize },
    Replace { index: usize, item: Value },
    Reset,
}

/// Tracks one model graph and records its mutations.
pub struct View {
    model: Model,
    root: NodeKey,
    ids: Arc<IdentityTable<NodeKey>>,
    log: ChangeLog,
    substitutions: Substitutions,
    instruction: InstructionId,
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("root", &self.root)
            .field("nodes", &self.model.len())
            .field("registered", &self.ids.len())
            .field("pending", &self.log.len())
            .finish()
    }
}

impl View {
    /// Start tracking `root`. Registers the whole graph under it without
    /// recording any change.
    pub fn new(
        model: Model,
        root: NodeKey,
        ids: Arc<IdentityTable<NodeKey>>,
        log: ChangeLog,
        substitutions: Substitutions,
    ) -> Result<Self, GraphError> {
        substitutions.validate(model.schemas())?;
        let mut view = Self {
            model,
            root,
            ids,
            log,
            substitutions,
            instruction: InstructionId::NONE,
        };
        view.register_node(root)?;
        Ok(view)
    }

    /// Track a model with a private identity table, log and no substitutions.
    pub fn standalone(model: Model, root: NodeKey) -> Result<Self, GraphError> {
        Self::new(
            model,
            root,
            Arc::new(IdentityTable::new()),
            ChangeLog::new(),
            Substitutions::new(),
        )
    }

    pub fn root(&self) -> NodeKey {
        self.root
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn ids(&self) -> &Arc<IdentityTable<NodeKey>> {
        &self.ids
    }

    pub fn log(&self) -> &ChangeLog {
        &self.log
    }

    pub fn id_of(&self, key: NodeKey) -> Result<NodeId, GraphError> {
        Ok(self.ids.id(key)?)
    }

    pub fn node_of(&self, id: NodeId) -> Result<NodeKey, GraphError> {
        Ok(self.ids.node(id)?)
    }

    pub fn is_registered(&self, key: NodeKey) -> bool {
        self.ids.contains_node(key)
    }

    pub fn get(&self, key: NodeKey, property: &str) -> Result<&Value, GraphError> {
        self.model.get(key, property)
    }

    pub fn items(&self, key: NodeKey) -> Result<&[Value], GraphError> {
        self.model.items(key)
    }

    pub fn node(&self, key: NodeKey) -> Result<&NodeData, GraphError> {
        self.model.node(key)
    }

    /// Allocate a detached node. It is tracked once attached to the graph.
    pub fn create_node(&mut self, type_name: &str) -> Result<NodeKey, GraphError> {
        self.model.create(type_name)
    }

    /// Instruction id stamped on collection deltas from now on.
    pub fn set_instruction(&mut self, instruction: InstructionId) {
        self.instruction = instruction;
    }

    pub fn instruction(&self) -> InstructionId {
        self.instruction
    }

    /// Assign identities to `key` and every node beneath it.
    pub fn register_node(&mut self, key: NodeKey) -> Result<(), GraphError> {
        if self.ids.contains_node(key) {
            error!("Attempted to register a node twice");
            return Err(GraphError::DuplicateNode);
        }
        let keys = visitor::collect_nodes(&self.model, key)?;
        if keys.iter().any(|k| self.ids.contains_node(*k)) {
            error!("Attempted to register a subtree containing a registered node");
            return Err(GraphError::DuplicateNode);
        }
        for k in keys {
            self.ids.add(k)?;
        }
        Ok(())
    }

    /// Retract the identity of `key` alone.
    pub fn unregister_node(&mut self, key: NodeKey) -> Result<NodeId, GraphError> {
        self.ids.remove_node(key).map_err(|_| GraphError::NotRegistered)
    }

    fn unregister_subtree(&mut self, key: NodeKey) -> Result<(), GraphError> {
        for k in visitor::collect_nodes(&self.model, key)? {
            self.unregister_node(k)?;
        }
        Ok(())
    }

    /// Append the complete state of the subtree under `key` to the log.
    /// Returns the number of changes appended.
    pub fn snapshot_as_changes(&self, key: NodeKey) -> Result<usize, GraphError> {
        let mut collector = SnapshotCollector {
            view: self,
            changes: Vec::new(),
        };
        visitor::visit(&self.model, key, &mut collector)?;
        let count = collector.changes.len();
        for change in collector.changes {
            self.log.push(change);
        }
        debug!("Snapshot of {count} changes appended");
        Ok(count)
    }

    /// Set a property, recording a `PropertyChange` if the node is tracked.
    pub fn set_property(
        &mut self,
        key: NodeKey,
        property: &str,
        value: impl Into<Value>,
    ) -> Result<(), GraphError> {
        let value = value.into();
        let descriptor = {
            let schema = self.model.schema_of(key)?;
            let (_, descriptor) =
                schema
                    .property(property)
                    .ok_or_else(|| GraphError::UnknownProperty {
                        type_name: schema.name().to_string(),
                        property: property.to_string(),
                    })?;
            descriptor.clone()
        };
        if !self.is_registered(key) || !descriptor.included {
            self.model.set(key, property, value)?;
            return Ok(());
        }

        let old = self.model.get(key, property)?.clone();
        if old == value {
            return Ok(());
        }
        let attached = if descriptor.is_trackable() { value.as_node() } else { None };
        if let Some(child) = attached {
            self.check_attachable(child, old.as_node())?;
        }

        self.model.set(key, property, value.clone())?;
        if descriptor.is_trackable() {
            if let Some(old_child) = old.as_node() {
                self.unregister_subtree(old_child)?;
            }
        }
        if let Some(child) = attached {
            self.register_node(child)?;
        }

        let id = self.ids.id(key)?;
        let payload = self.payload(key, Some(&descriptor), &value)?;
        self.log.push(Change::property(id, property, payload));
        if let Some(child) = attached {
            self.snapshot_as_changes(child)?;
        }
        Ok(())
    }

    pub fn insert_item(
        &mut self,
        key: NodeKey,
        index: usize,
        value: impl Into<Value>,
    ) -> Result<(), GraphError> {
        self.mutate_collection(
            key,
            CollectionMutation::Add {
                index,
                items: vec![value.into()],
            },
        )
        .map(|_| ())
    }

    /// Append an element, returning its index.
    pub fn push_item(&mut self, key: NodeKey, value: impl Into<Value>) -> Result<usize, GraphError> {
        let index = self.model.items(key)?.len();
        self.insert_item(key, index, value)?;
        Ok(index)
    }

    pub fn remove_item(&mut self, key: NodeKey, index: usize) -> Result<Value, GraphError> {
        let mut removed = self.mutate_collection(key, CollectionMutation::Remove { index, count: 1 })?;
        removed.pop().ok_or(GraphError::IndexOutOfRange { index, len: 0 })
    }

    /// Apply a collection mutation, returning any removed elements.
    pub fn mutate_collection(
        &mut self,
        key: NodeKey,
        mutation: CollectionMutation,
    ) -> Result<Vec<Value>, GraphError> {
        match mutation {
            CollectionMutation::Add { index, mut items } if items.len() == 1 => {
                let item = items.remove(0);
                self.add_item(key, index, item)?;
                Ok(Vec::new())
            }
            CollectionMutation::Add { items, .. } => Err(self.unsupported(format!(
                "adding {} items in one mutation",
                items.len()
            ))),
            CollectionMutation::Remove { index, count: 1 } => {
                Ok(vec![self.take_item(key, index)?])
            }
            CollectionMutation::Remove { count, .. } => Err(self.unsupported(format!(
                "removing {count} items in one mutation"
            ))),
            CollectionMutation::Move { .. } => Err(self.unsupported("moving collection items".into())),
            CollectionMutation::Replace { .. } => {
                Err(self.unsupported("replacing collection items".into()))
            }
            CollectionMutation::Reset => Err(self.unsupported("resetting collections".into())),
        }
    }

    /// Free the arena slots of every node that is not part of the tracked
    /// graph, including detached nodes that were never attached.
    pub fn reclaim_detached(&mut self) -> usize {
        let ids = &self.ids;
        let freed = self.model.retain(|key| ids.contains_node(key));
        if freed > 0 {
            debug!("Reclaimed {freed} detached nodes");
        }
        freed
    }

    fn add_item(&mut self, key: NodeKey, index: usize, item: Value) -> Result<(), GraphError> {
        if !self.is_registered(key) {
            return self.model.insert(key, index, item);
        }
        let attached = item.as_node();
        if let Some(child) = attached {
            self.check_attachable(child, None)?;
        }
        self.model.insert(key, index, item.clone())?;
        if let Some(child) = attached {
            self.register_node(child)?;
        }

        let id = self.ids.id(key)?;
        let payload = self.payload(key, None, &item)?;
        self.log
            .push(Change::item_added(id, payload, Some(index), self.instruction));
        if let Some(child) = attached {
            self.snapshot_as_changes(child)?;
        }
        Ok(())
    }

    fn take_item(&mut self, key: NodeKey, index: usize) -> Result<Value, GraphError> {
        if !self.is_registered(key) {
            return self.model.remove(key, index);
        }
        let removed = self.model.remove(key, index)?;
        let removed_id = match removed.as_node() {
            Some(child) => {
                let id = self.ids.id(child)?;
                self.unregister_subtree(child)?;
                Some(id)
            }
            None => None,
        };
        let id = self.ids.id(key)?;
        self.log
            .push(Change::item_removed(id, removed_id, index, self.instruction));
        Ok(removed)
    }

    /// A subtree may be attached if none of its nodes is tracked, except
    /// nodes under `detaching` which are about to be released.
    fn check_attachable(&self, child: NodeKey, detaching: Option<NodeKey>) -> Result<(), GraphError> {
        let released: HashSet<NodeKey> = match detaching {
            Some(old) => visitor::collect_nodes(&self.model, old)?.into_iter().collect(),
            None => HashSet::new(),
        };
        for k in visitor::collect_nodes(&self.model, child)? {
            if self.ids.contains_node(k) && !released.contains(&k) {
                error!("Attempted to attach a node that is already part of the graph");
                return Err(GraphError::DuplicateNode);
            }
        }
        Ok(())
    }

    fn payload(
        &self,
        container: NodeKey,
        descriptor: Option<&PropertyDescriptor>,
        value: &Value,
    ) -> Result<Payload, GraphError> {
        match value {
            Value::Node(child) => {
                let id = self.ids.id(*child)?;
                let is_collection = self.model.node(*child)?.is_collection();
                Ok(Payload::reference(id, is_collection))
            }
            Value::Primitive(primitive) => match descriptor {
                Some(descriptor) => {
                    let type_name = self.model.node(container)?.type_name();
                    Ok(Payload::Value(self.substitutions.apply(
                        type_name,
                        &descriptor.name,
                        primitive,
                    )))
                }
                None => Ok(Payload::Value(primitive.clone())),
            },
        }
    }

    fn unsupported(&self, what: String) -> GraphError {
        error!("Unsupported collection mutation: {what}");
        GraphError::Unsupported(what)
    }
}

struct SnapshotCollector<'a> {
    view: &'a View,
    changes: Vec<Change>,
}

impl GraphVisitor for SnapshotCollector<'_> {
    fn leaf(
        &mut self,
        container: NodeKey,
        property: Option<&PropertyDescriptor>,
        index: Option<usize>,
        value: &Value,
    ) -> Result<(), GraphError> {
        let id = self.view.ids.id(container)?;
        let payload = self.view.payload(container, property, value)?;
        let change = match property {
            Some(descriptor) => Change::property(id, descriptor.name.clone(), payload),
            None => Change::item_added(id, payload, index, self.view.instruction),
        };
        self.changes.push(change);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Schema, SchemaRegistry};
    use serde_json::json;

    struct Fixture {
        view: View,
        app: NodeKey,
        counter: NodeKey,
        list: NodeKey,
    }

    fn schemas() -> SchemaRegistry {
        SchemaRegistry::new()
            .with(
                Schema::builder("App")
                    .node("counter")
                    .node("list")
                    .value("title")
                    .build(),
            )
            .unwrap()
            .with(Schema::builder("Counter").value("currentCount").build())
            .unwrap()
            .with(Schema::builder("List").collection().build())
            .unwrap()
    }

    fn fixture() -> Fixture {
        let mut model = Model::new(schemas());
        let app = model.create("App").unwrap();
        let counter = model.create("Counter").unwrap();
        let list = model.create("List").unwrap();
        model.set(counter, "currentCount", 0).unwrap();
        model.set(app, "counter", counter).unwrap();
        model.set(app, "list", list).unwrap();
        model.set(app, "title", "demo").unwrap();
        let view = View::standalone(model, app).unwrap();
        Fixture {
            view,
            app,
            counter,
            list,
        }
    }

    #[test]
    fn test_construction_registers_without_changes() {
        let f = fixture();
        assert_eq!(f.view.id_of(f.app).unwrap(), NodeId(0));
        assert_eq!(f.view.id_of(f.counter).unwrap(), NodeId(1));
        assert_eq!(f.view.id_of(f.list).unwrap(), NodeId(2));
        assert!(f.view.log().is_empty());
    }

    #[test]
    fn test_property_change_is_recorded() {
        let mut f = fixture();
        f.view.set_property(f.counter, "currentCount", 1).unwrap();
        let changes = f.view.log().drain();
        assert_eq!(
            changes,
            vec![Change::property(NodeId(1), "currentCount", json!(1).into())]
        );
    }

    #[test]
    fn test_setting_same_value_records_nothing() {
        let mut f = fixture();
        f.view.set_property(f.counter, "currentCount", 0).unwrap();
        assert!(f.view.log().is_empty());
    }

    #[test]
    fn test_replacing_child_retracts_old_subtree_and_snapshots_new() {
        let mut f = fixture();
        let replacement = f.view.create_node("Counter").unwrap();
        f.view.set_property(replacement, "currentCount", 10).unwrap();
        assert!(f.view.log().is_empty());

        f.view.set_property(f.app, "counter", replacement).unwrap();
        assert!(!f.view.is_registered(f.counter));
        let new_id = f.view.id_of(replacement).unwrap();
        assert_eq!(new_id, NodeId(3));

        let changes = f.view.log().drain();
        assert_eq!(
            changes,
            vec![
                Change::property(NodeId(0), "counter", Payload::reference(new_id, false)),
                Change::property(new_id, "currentCount", json!(10).into()),
            ]
        );
    }

    #[test]
    fn test_setting_child_to_null() {
        let mut f = fixture();
        f.view.set_property(f.app, "counter", Value::NULL).unwrap();
        assert!(!f.view.is_registered(f.counter));
        assert_eq!(
            f.view.log().drain(),
            vec![Change::property(NodeId(0), "counter", json!(null).into())]
        );
    }

    #[test]
    fn test_attaching_registered_node_twice_fails() {
        let mut f = fixture();
        let err = f.view.push_item(f.list, f.counter).unwrap_err();
        assert_eq!(err, GraphError::DuplicateNode);
        assert!(f.view.items(f.list).unwrap().is_empty());
        assert!(f.view.log().is_empty());

        let err = f.view.set_property(f.app, "counter", f.app).unwrap_err();
        assert_eq!(err, GraphError::DuplicateNode);
    }

    #[test]
    fn test_collection_add_and_remove() {
        let mut f = fixture();
        f.view.set_instruction(InstructionId(4));
        f.view.push_item(f.list, "a").unwrap();
        let child = f.view.create_node("Counter").unwrap();
        f.view.insert_item(f.list, 0, child).unwrap();
        let child_id = f.view.id_of(child).unwrap();

        let changes = f.view.log().drain();
        assert_eq!(
            changes,
            vec![
                Change::item_added(NodeId(2), json!("a").into(), Some(0), InstructionId(4)),
                Change::item_added(
                    NodeId(2),
                    Payload::reference(child_id, false),
                    Some(0),
                    InstructionId(4)
                ),
                Change::property(child_id, "currentCount", json!(null).into()),
            ]
        );

        assert_eq!(f.view.remove_item(f.list, 0).unwrap(), Value::Node(child));
        assert!(!f.view.is_registered(child));
        assert_eq!(f.view.remove_item(f.list, 0).unwrap(), Value::from("a"));
        assert_eq!(
            f.view.log().drain(),
            vec![
                Change::item_removed(NodeId(2), Some(child_id), 0, InstructionId(4)),
                Change::item_removed(NodeId(2), None, 0, InstructionId(4)),
            ]
        );
    }

    #[test]
    fn test_unsupported_mutations_fail_loudly() {
        let mut f = fixture();
        f.view.push_item(f.list, 1).unwrap();
        f.view.push_item(f.list, 2).unwrap();
        f.view.log().drain();

        for mutation in [
            CollectionMutation::Move { from: 0, to: 1 },
            CollectionMutation::Replace { index: 0, item: Value::from(3) },
            CollectionMutation::Reset,
            CollectionMutation::Add { index: 0, items: vec![Value::from(1), Value::from(2)] },
            CollectionMutation::Remove { index: 0, count: 2 },
        ] {
            let err = f.view.mutate_collection(f.list, mutation).unwrap_err();
            assert!(matches!(err, GraphError::Unsupported(_)));
        }
        assert_eq!(f.view.items(f.list).unwrap().len(), 2);
        assert!(f.view.log().is_empty());
    }

    #[test]
    fn test_snapshot_as_changes() {
        let mut f = fixture();
        f.view.push_item(f.list, "x").unwrap();
        f.view.log().drain();

        let count = f.view.snapshot_as_changes(f.app).unwrap();
        let changes = f.view.log().drain();
        assert_eq!(count, changes.len());
        assert_eq!(
            changes,
            vec![
                Change::property(NodeId(0), "counter", Payload::reference(NodeId(1), false)),
                Change::property(NodeId(1), "currentCount", json!(0).into()),
                Change::property(NodeId(0), "list", Payload::reference(NodeId(2), true)),
                Change::item_added(NodeId(2), json!("x").into(), Some(0), InstructionId::NONE),
                Change::property(NodeId(0), "title", json!("demo").into()),
            ]
        );
    }

    #[test]
    fn test_substitution_applies_to_deltas_and_snapshots() {
        let mut model = Model::new(schemas());
        let app = model.create("App").unwrap();
        model.set(app, "title", "demo").unwrap();
        let subs = Substitutions::new().with("App", "title", |v| {
            json!(v.as_str().unwrap_or_default().to_uppercase())
        });
        let mut view = View::new(
            model,
            app,
            Arc::new(IdentityTable::new()),
            ChangeLog::new(),
            subs,
        )
        .unwrap();

        view.snapshot_as_changes(app).unwrap();
        view.set_property(app, "title", "next").unwrap();
        let titles: Vec<_> = view
            .log()
            .drain()
            .into_iter()
            .filter_map(|c| match c {
                Change::Property(p) if p.property_name == "title" => Some(p.value),
                _ => None,
            })
            .collect();
        assert_eq!(titles, vec![Payload::Value(json!("DEMO")), Payload::Value(json!("NEXT"))]);
        assert_eq!(view.get(app, "title").unwrap(), &Value::from("next"));
    }

    #[test]
    fn test_reclaim_detached() {
        let mut f = fixture();
        let stray = f.view.create_node("Counter").unwrap();
        f.view.set_property(f.app, "counter", Value::NULL).unwrap();
        assert_eq!(f.view.reclaim_detached(), 2);
        assert!(f.view.node(stray).is_err());
        assert!(f.view.node(f.counter).is_err());
        assert!(f.view.node(f.app).is_ok());
    }
}
