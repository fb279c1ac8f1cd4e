//! Node arena.
//!
//! The model graph lives in a generational slot map. Application code holds
//! [`NodeKey`]s; a key whose slot has been freed never resolves again, even
//! if the slot is reused.
//!
//! Factories build the initial graph directly on a [`Model`]. Once the model
//! is handed to a [`View`](crate::view::View) only the view has mutable
//! access, so every later mutation is observed by the tracker.

use crate::identity::IdentityError;
use crate::schema::{PropertyDescriptor, PropertyKind, Schema, SchemaRegistry};
use slotmap::{new_key_type, SlotMap};
use std::sync::Arc;

new_key_type! {
    /// Handle to a node in a [`Model`].
    pub struct NodeKey;
}

/// A property value or collection element.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Primitive(serde_json::Value),
    Node(NodeKey),
}

impl Value {
    pub const NULL: Value = Value::Primitive(serde_json::Value::Null);

    pub fn as_node(&self) -> Option<NodeKey> {
        match self {
            Value::Node(key) => Some(*key),
            Value::Primitive(_) => None,
        }
    }

    pub fn as_primitive(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Primitive(value) => Some(value),
            Value::Node(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_primitive().and_then(serde_json::Value::as_i64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_primitive().and_then(serde_json::Value::as_str)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Primitive(serde_json::Value::Null))
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::NULL
    }
}

impl From<NodeKey> for Value {
    fn from(key: NodeKey) -> Self {
        Value::Node(key)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Primitive(value)
    }
}

macro_rules! primitive_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::Primitive(serde_json::Value::from(value))
            }
        })*
    };
}

primitive_from!(bool, i32, i64, u32, u64, f64, &str, String);

/// Errors raised while reading or mutating the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    UnknownType(String),
    DuplicateType(String),
    /// The key does not resolve (freed or from another model).
    NodeNotFound,
    UnknownProperty { type_name: String, property: String },
    TypeMismatch { type_name: String, property: String, expected: PropertyKind },
    NotACollection(String),
    IndexOutOfRange { index: usize, len: usize },
    /// A node was reached twice, or registered while already registered.
    DuplicateNode,
    /// The node is not part of the tracked graph.
    NotRegistered,
    /// Mutation kinds the tracker does not support.
    Unsupported(String),
    /// Substitution rule targets a property it cannot apply to.
    InvalidSubstitution(String),
    Identity(IdentityError),
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphError::UnknownType(name) => write!(f, "Unknown node type '{name}'"),
            GraphError::DuplicateType(name) => write!(f, "Node type '{name}' is already registered"),
            GraphError::NodeNotFound => write!(f, "Node does not exist"),
            GraphError::UnknownProperty { type_name, property } => {
                write!(f, "Type '{type_name}' has no property '{property}'")
            }
            GraphError::TypeMismatch { type_name, property, expected } => {
                write!(f, "Property '{type_name}.{property}' expects a {expected:?}")
            }
            GraphError::NotACollection(name) => write!(f, "Type '{name}' is not a collection"),
            GraphError::IndexOutOfRange { index, len } => {
                write!(f, "Index {index} out of range for collection of length {len}")
            }
            GraphError::DuplicateNode => write!(f, "Node is already part of the tracked graph"),
            GraphError::NotRegistered => write!(f, "Node is not part of the tracked graph"),
            GraphError::Unsupported(what) => write!(f, "Not implemented: {what}"),
            GraphError::InvalidSubstitution(what) => write!(f, "Invalid substitution: {what}"),
            GraphError::Identity(e) => write!(f, "Identity error: {e}"),
        }
    }
}

impl std::error::Error for GraphError {}

impl From<IdentityError> for GraphError {
    fn from(e: IdentityError) -> Self {
        GraphError::Identity(e)
    }
}

/// Storage of one node: its schema, property values and optional elements.
#[derive(Debug, Clone)]
pub struct NodeData {
    schema: Arc<Schema>,
    properties: Vec<Value>,
    items: Option<Vec<Value>>,
}

impl NodeData {
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn type_name(&self) -> &str {
        self.schema.name()
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.schema.property(name).and_then(|(i, _)| self.properties.get(i))
    }

    /// Declared properties paired with their current values.
    pub fn properties(&self) -> impl Iterator<Item = (&PropertyDescriptor, &Value)> {
        self.schema.properties().iter().zip(self.properties.iter())
    }

    pub fn items(&self) -> Option<&[Value]> {
        self.items.as_deref()
    }

    pub fn is_collection(&self) -> bool {
        self.items.is_some()
    }

    /// Tracked children directly below this node, in visitation order.
    pub fn children(&self) -> impl Iterator<Item = NodeKey> + '_ {
        let from_properties = self
            .properties()
            .filter(|(p, _)| p.included && p.is_trackable())
            .filter_map(|(_, v)| v.as_node());
        let from_items = self.items.iter().flatten().filter_map(Value::as_node);
        from_properties.chain(from_items)
    }
}

/// Arena of nodes sharing one schema registry.
#[derive(Debug, Clone)]
pub struct Model {
    schemas: Arc<SchemaRegistry>,
    nodes: SlotMap<NodeKey, NodeData>,
}

impl Model {
    pub fn new(schemas: SchemaRegistry) -> Self {
        Self {
            schemas: Arc::new(schemas),
            nodes: SlotMap::with_key(),
        }
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Allocate a node of `type_name` with every property null and an empty
    /// collection if the type has one.
    pub fn create(&mut self, type_name: &str) -> Result<NodeKey, GraphError> {
        let schema = self
            .schemas
            .get(type_name)
            .cloned()
            .ok_or_else(|| GraphError::UnknownType(type_name.to_string()))?;
        let properties = vec![Value::NULL; schema.properties().len()];
        let items = schema.is_collection().then(Vec::new);
        Ok(self.nodes.insert(NodeData {
            schema,
            properties,
            items,
        }))
    }

    pub fn node(&self, key: NodeKey) -> Result<&NodeData, GraphError> {
        self.nodes.get(key).ok_or(GraphError::NodeNotFound)
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn schema_of(&self, key: NodeKey) -> Result<&Schema, GraphError> {
        Ok(self.node(key)?.schema())
    }

    pub fn get(&self, key: NodeKey, property: &str) -> Result<&Value, GraphError> {
        let node = self.node(key)?;
        node.property(property).ok_or_else(|| GraphError::UnknownProperty {
            type_name: node.type_name().to_string(),
            property: property.to_string(),
        })
    }

    pub fn items(&self, key: NodeKey) -> Result<&[Value], GraphError> {
        let node = self.node(key)?;
        node.items()
            .ok_or_else(|| GraphError::NotACollection(node.type_name().to_string()))
    }

    /// Set a property without any tracking, returning the previous value.
    pub fn set(
        &mut self,
        key: NodeKey,
        property: &str,
        value: impl Into<Value>,
    ) -> Result<Value, GraphError> {
        let value = value.into();
        if let Some(child) = value.as_node() {
            self.node(child)?;
        }
        let node = self.nodes.get_mut(key).ok_or(GraphError::NodeNotFound)?;
        let (index, descriptor) =
            node.schema
                .property(property)
                .ok_or_else(|| GraphError::UnknownProperty {
                    type_name: node.schema.name().to_string(),
                    property: property.to_string(),
                })?;
        let fits = match descriptor.kind {
            PropertyKind::Value => value.as_primitive().is_some(),
            PropertyKind::Node => value.as_node().is_some() || value.is_null(),
        };
        if !fits {
            return Err(GraphError::TypeMismatch {
                type_name: node.schema.name().to_string(),
                property: property.to_string(),
                expected: descriptor.kind,
            });
        }
        Ok(std::mem::replace(&mut node.properties[index], value))
    }

    pub fn insert(
        &mut self,
        key: NodeKey,
        index: usize,
        value: impl Into<Value>,
    ) -> Result<(), GraphError> {
        let value = value.into();
        if let Some(child) = value.as_node() {
            self.node(child)?;
        }
        let items = self.items_mut(key)?;
        if index > items.len() {
            return Err(GraphError::IndexOutOfRange {
                index,
                len: items.len(),
            });
        }
        items.insert(index, value);
        Ok(())
    }

    pub fn push(&mut self, key: NodeKey, value: impl Into<Value>) -> Result<usize, GraphError> {
        let index = self.items(key)?.len();
        self.insert(key, index, value)?;
        Ok(index)
    }

    pub fn remove(&mut self, key: NodeKey, index: usize) -> Result<Value, GraphError> {
        let items = self.items_mut(key)?;
        if index >= items.len() {
            return Err(GraphError::IndexOutOfRange {
                index,
                len: items.len(),
            });
        }
        Ok(items.remove(index))
    }

    /// Free a node's slot. Its key never resolves again.
    pub fn remove_node(&mut self, key: NodeKey) -> Option<NodeData> {
        self.nodes.remove(key)
    }

    /// Keep only the nodes for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(NodeKey) -> bool) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|key, _| keep(key));
        before - self.nodes.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn items_mut(&mut self, key: NodeKey) -> Result<&mut Vec<Value>, GraphError> {
        let node = self.nodes.get_mut(key).ok_or(GraphError::NodeNotFound)?;
        let type_name = node.schema.name().to_string();
        node.items.as_mut().ok_or(GraphError::NotACollection(type_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> Model {
        let schemas = SchemaRegistry::new()
            .with(Schema::builder("App").node("counter").value("title").build())
            .unwrap()
            .with(Schema::builder("Counter").value("currentCount").build())
            .unwrap()
            .with(Schema::builder("List").collection().build())
            .unwrap();
        Model::new(schemas)
    }

    #[test]
    fn test_create_initialises_nulls() {
        let mut model = model();
        let app = model.create("App").unwrap();
        assert!(model.get(app, "counter").unwrap().is_null());
        assert!(model.items(app).is_err());
        assert_eq!(model.create("Nope"), Err(GraphError::UnknownType("Nope".into())));
    }

    #[test]
    fn test_set_checks_kind() {
        let mut model = model();
        let app = model.create("App").unwrap();
        let counter = model.create("Counter").unwrap();

        assert!(model.set(app, "counter", counter).unwrap().is_null());
        assert_eq!(model.get(app, "counter").unwrap(), &Value::Node(counter));
        assert!(matches!(
            model.set(app, "counter", 5),
            Err(GraphError::TypeMismatch { .. })
        ));
        assert!(matches!(
            model.set(app, "title", counter),
            Err(GraphError::TypeMismatch { .. })
        ));
        assert!(matches!(
            model.set(app, "missing", 1),
            Err(GraphError::UnknownProperty { .. })
        ));
        model.set(app, "counter", Value::NULL).unwrap();
    }

    #[test]
    fn test_collection_operations() {
        let mut model = model();
        let list = model.create("List").unwrap();
        model.push(list, "a").unwrap();
        model.push(list, "c").unwrap();
        model.insert(list, 1, "b").unwrap();
        let items: Vec<_> = model.items(list).unwrap().iter().filter_map(Value::as_str).collect();
        assert_eq!(items, ["a", "b", "c"]);

        assert_eq!(model.remove(list, 0).unwrap(), Value::from("a"));
        assert_eq!(
            model.remove(list, 5),
            Err(GraphError::IndexOutOfRange { index: 5, len: 2 })
        );
        assert_eq!(
            model.insert(list, 3, "x"),
            Err(GraphError::IndexOutOfRange { index: 3, len: 2 })
        );
    }

    #[test]
    fn test_freed_key_never_resolves() {
        let mut model = model();
        let counter = model.create("Counter").unwrap();
        model.remove_node(counter);
        let reused = model.create("Counter").unwrap();
        assert_ne!(counter, reused);
        assert_eq!(model.node(counter).err(), Some(GraphError::NodeNotFound));
    }

    #[test]
    fn test_children_follow_included_properties_then_items() {
        let mut model = model();
        let app = model.create("App").unwrap();
        let counter = model.create("Counter").unwrap();
        model.set(app, "counter", counter).unwrap();
        let children: Vec<_> = model.node(app).unwrap().children().collect();
        assert_eq!(children, vec![counter]);
    }
}
