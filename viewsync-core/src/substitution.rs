//! Per-session value substitution.
//!
//! A rule replaces the value reported for one property of one node type,
//! e.g. rendering an internal identifier as a display string. Rules are
//! registered on a [`Substitutions`] value that is handed to the
//! [`View`](crate::view::View) of a single session; nothing is global.
//!
//! Only primitive-valued properties can be substituted: a node-valued
//! property must keep pointing at the node the client mirrors.

use crate::model::GraphError;
use crate::schema::{PropertyKind, SchemaRegistry};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps the stored value to the value sent to clients.
pub type SubstituteFn = Arc<dyn Fn(&serde_json::Value) -> serde_json::Value + Send + Sync>;

#[derive(Clone, Default)]
pub struct Substitutions {
    rules: HashMap<(String, String), SubstituteFn>,
}

impl std::fmt::Debug for Substitutions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.rules.keys()).finish()
    }
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Substitute `type_name.property`. Replaces any earlier rule for it.
    pub fn register<F>(&mut self, type_name: impl Into<String>, property: impl Into<String>, f: F)
    where
        F: Fn(&serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.rules.insert((type_name.into(), property.into()), Arc::new(f));
    }

    pub fn with<F>(mut self, type_name: impl Into<String>, property: impl Into<String>, f: F) -> Self
    where
        F: Fn(&serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.register(type_name, property, f);
        self
    }

    /// The value to report for `type_name.property`.
    pub fn apply(&self, type_name: &str, property: &str, value: &serde_json::Value) -> serde_json::Value {
        // Avoid allocating a key on the hot path when there are no rules.
        if self.rules.is_empty() {
            return value.clone();
        }
        match self.rules.get(&(type_name.to_string(), property.to_string())) {
            Some(rule) => rule(value),
            None => value.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check every rule names an existing, primitive-valued property.
    pub fn validate(&self, schemas: &SchemaRegistry) -> Result<(), GraphError> {
        for (type_name, property) in self.rules.keys() {
            let schema = schemas
                .get(type_name)
                .ok_or_else(|| GraphError::InvalidSubstitution(format!("unknown type '{type_name}'")))?;
            let (_, descriptor) = schema.property(property).ok_or_else(|| {
                GraphError::InvalidSubstitution(format!("'{type_name}' has no property '{property}'"))
            })?;
            if descriptor.kind == PropertyKind::Node {
                return Err(GraphError::InvalidSubstitution(format!(
                    "'{type_name}.{property}' holds a node"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use serde_json::json;

    fn schemas() -> SchemaRegistry {
        SchemaRegistry::new()
            .with(Schema::builder("User").value("role").node("profile").build())
            .unwrap()
    }

    #[test]
    fn test_apply_uses_matching_rule_only() {
        let subs = Substitutions::new().with("User", "role", |v| {
            json!(format!("role:{}", v.as_str().unwrap_or("?")))
        });
        assert_eq!(subs.apply("User", "role", &json!("admin")), json!("role:admin"));
        assert_eq!(subs.apply("User", "name", &json!("bob")), json!("bob"));
        assert_eq!(subs.apply("Other", "role", &json!(1)), json!(1));
    }

    #[test]
    fn test_validate_rejects_node_properties() {
        let subs = Substitutions::new().with("User", "profile", |v| v.clone());
        assert!(matches!(
            subs.validate(&schemas()),
            Err(GraphError::InvalidSubstitution(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_targets() {
        assert!(Substitutions::new().with("Ghost", "x", |v| v.clone()).validate(&schemas()).is_err());
        assert!(Substitutions::new().with("User", "x", |v| v.clone()).validate(&schemas()).is_err());
        assert!(Substitutions::new().with("User", "role", |v| v.clone()).validate(&schemas()).is_ok());
    }
}
