//! Graph traversal driven by node schemas.
//!
//! Pre-order walk from a root: a property-observable node reports each
//! included property as a leaf and descends into node-valued ones; a
//! collection-observable node reports each element (with its index) and
//! descends into node elements. A node that is both is reported as each,
//! once. Reaching the same node twice is an error: the tracked graph must
//! not give one node two positions.

use crate::model::{GraphError, Model, NodeData, NodeKey, Value};
use crate::schema::PropertyDescriptor;
use std::collections::HashSet;

/// Callbacks invoked by [`visit`]. Every method defaults to a no-op.
pub trait GraphVisitor {
    fn property_node(&mut self, _key: NodeKey, _node: &NodeData) -> Result<(), GraphError> {
        Ok(())
    }

    fn collection_node(&mut self, _key: NodeKey, _node: &NodeData) -> Result<(), GraphError> {
        Ok(())
    }

    /// `property` is `None` for collection elements, in which case `index`
    /// is the element's position.
    fn leaf(
        &mut self,
        _container: NodeKey,
        _property: Option<&PropertyDescriptor>,
        _index: Option<usize>,
        _value: &Value,
    ) -> Result<(), GraphError> {
        Ok(())
    }
}

/// Walk the subtree under `root`, reporting every node and every leaf.
pub fn visit<V: GraphVisitor + ?Sized>(
    model: &Model,
    root: NodeKey,
    visitor: &mut V,
) -> Result<(), GraphError> {
    let mut seen = HashSet::new();
    walk(model, root, visitor, &mut seen)
}

/// Call `f` once for every node in the subtree under `root`.
pub fn visit_nodes(
    model: &Model,
    root: NodeKey,
    f: impl FnMut(NodeKey) -> Result<(), GraphError>,
) -> Result<(), GraphError> {
    struct Nodes<F>(F);

    impl<F: FnMut(NodeKey) -> Result<(), GraphError>> GraphVisitor for Nodes<F> {
        fn property_node(&mut self, key: NodeKey, _node: &NodeData) -> Result<(), GraphError> {
            (self.0)(key)
        }

        fn collection_node(&mut self, key: NodeKey, node: &NodeData) -> Result<(), GraphError> {
            // Already reported through property_node.
            if node.schema().is_property_observable() {
                return Ok(());
            }
            (self.0)(key)
        }
    }

    visit(model, root, &mut Nodes(f))
}

/// Keys of every node in the subtree under `root`, in visitation order.
pub fn collect_nodes(model: &Model, root: NodeKey) -> Result<Vec<NodeKey>, GraphError> {
    let mut keys = Vec::new();
    visit_nodes(model, root, |key| {
        keys.push(key);
        Ok(())
    })?;
    Ok(keys)
}

fn walk<V: GraphVisitor + ?Sized>(
    model: &Model,
    key: NodeKey,
    visitor: &mut V,
    seen: &mut HashSet<NodeKey>,
) -> Result<(), GraphError> {
    let node = model.node(key)?;
    if !seen.insert(key) {
        return Err(GraphError::DuplicateNode);
    }

    if node.schema().is_property_observable() {
        visitor.property_node(key, node)?;
        for (descriptor, value) in node.properties().filter(|(p, _)| p.included) {
            visitor.leaf(key, Some(descriptor), None, value)?;
            if descriptor.is_trackable() {
                if let Some(child) = value.as_node() {
                    walk(model, child, visitor, seen)?;
                }
            }
        }
    }

    if let Some(items) = node.items() {
        visitor.collection_node(key, node)?;
        for (index, item) in items.iter().enumerate() {
            visitor.leaf(key, None, Some(index), item)?;
            if let Some(child) = item.as_node() {
                walk(model, child, visitor, seen)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PropertyKind, Schema, SchemaRegistry};

    fn model() -> Model {
        let schemas = SchemaRegistry::new()
            .with(
                Schema::builder("App")
                    .node("counter")
                    .value("title")
                    .excluded("hidden", PropertyKind::Node)
                    .build(),
            )
            .unwrap()
            .with(Schema::builder("Counter").value("currentCount").build())
            .unwrap()
            .with(Schema::builder("Dict").value("count").collection().build())
            .unwrap();
        Model::new(schemas)
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl GraphVisitor for Recorder {
        fn property_node(&mut self, _key: NodeKey, node: &NodeData) -> Result<(), GraphError> {
            self.events.push(format!("props:{}", node.type_name()));
            Ok(())
        }

        fn collection_node(&mut self, _key: NodeKey, node: &NodeData) -> Result<(), GraphError> {
            self.events.push(format!("items:{}", node.type_name()));
            Ok(())
        }

        fn leaf(
            &mut self,
            _container: NodeKey,
            property: Option<&PropertyDescriptor>,
            index: Option<usize>,
            _value: &Value,
        ) -> Result<(), GraphError> {
            match (property, index) {
                (Some(p), _) => self.events.push(format!("leaf:{}", p.name)),
                (None, Some(i)) => self.events.push(format!("leaf:[{i}]")),
                (None, None) => unreachable!(),
            }
            Ok(())
        }
    }

    #[test]
    fn test_preorder_over_properties_and_items() {
        let mut model = model();
        let app = model.create("App").unwrap();
        let dict = model.create("Dict").unwrap();
        let counter = model.create("Counter").unwrap();
        model.set(app, "counter", dict).unwrap();
        model.push(dict, counter).unwrap();
        model.push(dict, 5).unwrap();

        let mut recorder = Recorder::default();
        visit(&model, app, &mut recorder).unwrap();
        assert_eq!(
            recorder.events,
            [
                "props:App",
                "leaf:counter",
                "props:Dict",
                "leaf:count",
                "items:Dict",
                "leaf:[0]",
                "props:Counter",
                "leaf:currentCount",
                "leaf:[1]",
                "leaf:title",
            ]
        );
    }

    #[test]
    fn test_excluded_properties_are_not_traversed() {
        let mut model = model();
        let app = model.create("App").unwrap();
        let hidden = model.create("Counter").unwrap();
        model.set(app, "hidden", hidden).unwrap();
        assert_eq!(collect_nodes(&model, app).unwrap(), vec![app]);
    }

    #[test]
    fn test_dual_node_reported_once_in_node_mode() {
        let mut model = model();
        let dict = model.create("Dict").unwrap();
        assert_eq!(collect_nodes(&model, dict).unwrap(), vec![dict]);
    }

    #[test]
    fn test_shared_node_is_an_error() {
        let mut model = model();
        let dict = model.create("Dict").unwrap();
        let counter = model.create("Counter").unwrap();
        model.push(dict, counter).unwrap();
        model.push(dict, counter).unwrap();
        assert_eq!(collect_nodes(&model, dict), Err(GraphError::DuplicateNode));
    }

    #[test]
    fn test_stale_root_fails() {
        let mut model = model();
        let counter = model.create("Counter").unwrap();
        model.remove_node(counter);
        assert_eq!(collect_nodes(&model, counter), Err(GraphError::NodeNotFound));
    }
}
