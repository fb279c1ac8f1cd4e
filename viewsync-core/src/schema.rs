//! Static node schemas.
//!
//! Every node type declares its observable surface once, at startup:
//! the named properties it exposes (and whether each holds a plain value or
//! a child node) and whether it is also an ordered collection.
//!
//! ```text
//! Schema "App"
//! ├── counter : node      (tracked child)
//! ├── title   : value     (reported as primitive)
//! ├── secret  : value     (excluded, never synced)
//! └── [items]             (collection-observable)
//! ```

use crate::model::GraphError;
use std::collections::HashMap;
use std::sync::Arc;

/// What a property may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// A serializable primitive payload.
    Value,
    /// A child node (or null).
    Node,
}

/// One declared property of a node type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: PropertyKind,
    /// Excluded properties are stored but never reported or traversed.
    pub included: bool,
}

impl PropertyDescriptor {
    /// Whether the property's value is itself a tracked node.
    pub fn is_trackable(&self) -> bool {
        self.kind == PropertyKind::Node
    }
}

/// Declared shape of a node type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    name: String,
    properties: Vec<PropertyDescriptor>,
    collection: bool,
}

impl Schema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            schema: Schema {
                name: name.into(),
                properties: Vec::new(),
                collection: false,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All declared properties, in declaration order.
    pub fn properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }

    /// Position and descriptor of the property called `name`.
    pub fn property(&self, name: &str) -> Option<(usize, &PropertyDescriptor)> {
        self.properties.iter().enumerate().find(|(_, p)| p.name == name)
    }

    pub fn included_properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.iter().filter(|p| p.included)
    }

    /// Nodes with declared properties, or without any collection surface, notify on
    /// property change.
    pub fn is_property_observable(&self) -> bool {
        !self.properties.is_empty() || !self.collection
    }

    pub fn is_collection(&self) -> bool {
        self.collection
    }
}

/// Builder returned by [`Schema::builder`].
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    /// Declare a primitive-valued property.
    pub fn value(self, name: impl Into<String>) -> Self {
        self.property(name, PropertyKind::Value, true)
    }

    /// Declare a node-valued property.
    pub fn node(self, name: impl Into<String>) -> Self {
        self.property(name, PropertyKind::Node, true)
    }

    /// Declare a property that is stored but never synced.
    pub fn excluded(self, name: impl Into<String>, kind: PropertyKind) -> Self {
        self.property(name, kind, false)
    }

    /// Make the node collection-observable.
    pub fn collection(mut self) -> Self {
        self.schema.collection = true;
        self
    }

    fn property(mut self, name: impl Into<String>, kind: PropertyKind, included: bool) -> Self {
        self.schema.properties.push(PropertyDescriptor {
            name: name.into(),
            kind,
            included,
        });
        self
    }

    pub fn build(self) -> Schema {
        self.schema
    }
}

/// All node types known to one model.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<Schema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node type. Type names and property names must be unique.
    pub fn register(&mut self, schema: Schema) -> Result<(), GraphError> {
        if self.schemas.contains_key(schema.name()) {
            return Err(GraphError::DuplicateType(schema.name().to_string()));
        }
        for (i, property) in schema.properties.iter().enumerate() {
            if schema.properties[..i].iter().any(|p| p.name == property.name) {
                return Err(GraphError::UnknownProperty {
                    type_name: schema.name().to_string(),
                    property: format!("{} (declared twice)", property.name),
                });
            }
        }
        self.schemas.insert(schema.name().to_string(), Arc::new(schema));
        Ok(())
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with(mut self, schema: Schema) -> Result<Self, GraphError> {
        self.register(schema)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Schema>> {
        self.schemas.get(name)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
