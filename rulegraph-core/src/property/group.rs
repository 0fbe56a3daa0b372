//! Group properties: a fixed set of named children.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value as Json};

use super::node::{AsProperty, CoreSettings, NodeCore, Predicate, Property, PropertyNode};
use super::scalar::split_rule;
use super::validation::CrossValidator;
use crate::engine::RuleEngine;
use crate::error::{ConfigError, PropertyError};
use crate::graph::{DependencyOptions, NodeKind, PropertyId};

/// Group property state. Reached through [`GroupProperty`].
pub struct GroupNode {
    core: NodeCore,
    children: IndexMap<String, Arc<dyn Property>>,
}

impl GroupNode {
    /// Get a child by name.
    pub fn child(&self, name: &str) -> Option<Arc<dyn Property>> {
        self.children.get(name).cloned()
    }

    /// Get the child names, in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }
}

impl PropertyNode for GroupNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn children(&self) -> Vec<Arc<dyn Property>> {
        self.children.values().cloned().collect()
    }
}

impl Property for GroupNode {
    fn is_empty(&self) -> bool {
        self.children.values().all(|child| child.is_empty())
    }

    fn export_data(&self) -> Json {
        let entries: Map<String, Json> = self
            .children
            .iter()
            .map(|(name, child)| (name.clone(), child.export_data()))
            .collect();
        Json::Object(entries)
    }

    fn import_data(&self, data: &Json) -> Result<(), PropertyError> {
        let Json::Object(entries) = data else {
            return Err(PropertyError::ImportShape {
                id: self.core.id().clone(),
                expected: "an object",
            });
        };
        for (name, child) in &self.children {
            if let Some(entry) = entries.get(name) {
                child.import_data(entry)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for GroupNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupNode")
            .field("core", &self.core)
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Handle to a group property. Cloning shares the group.
#[derive(Clone, Debug)]
pub struct GroupProperty(Arc<GroupNode>);

impl Deref for GroupProperty {
    type Target = GroupNode;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsProperty for GroupProperty {
    fn as_property(&self) -> Arc<dyn Property> {
        Arc::clone(&self.0) as Arc<dyn Property>
    }
}

/// Declares a [`GroupProperty`]. Created by [`RuleEngine::group`].
pub struct GroupBuilder {
    engine: RuleEngine,
    id: PropertyId,
    children: IndexMap<String, Arc<dyn Property>>,
    cross_validators: Vec<CrossValidator>,
    visibility: Option<(Predicate, Vec<PropertyId>)>,
    requirement: Option<(Predicate, Vec<PropertyId>)>,
}

impl GroupBuilder {
    pub(crate) fn new(engine: RuleEngine, id: PropertyId) -> Self {
        Self {
            engine,
            id,
            children: IndexMap::new(),
            cross_validators: Vec::new(),
            visibility: None,
            requirement: None,
        }
    }

    /// Add an already built property under `name`.
    pub fn child(mut self, name: impl Into<String>, child: &impl AsProperty) -> Self {
        self.children.insert(name.into(), child.as_property());
        self
    }

    pub fn cross_validator(mut self, validator: CrossValidator) -> Self {
        self.cross_validators.push(validator);
        self
    }

    pub fn visible_if<I, F>(mut self, inputs: I, rule: F) -> Self
    where
        I: IntoIterator,
        I::Item: Into<PropertyId>,
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let rule: Predicate = Arc::new(rule);
        self.visibility = Some((rule, inputs.into_iter().map(Into::into).collect()));
        self
    }

    pub fn required_if<I, F>(mut self, inputs: I, rule: F) -> Self
    where
        I: IntoIterator,
        I::Item: Into<PropertyId>,
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let rule: Predicate = Arc::new(rule);
        self.requirement = Some((rule, inputs.into_iter().map(Into::into).collect()));
        self
    }

    /// Register the group. Every child gets an owner edge with a value edge
    /// into the group.
    pub fn build(self) -> Result<GroupProperty, ConfigError> {
        let (visibility, visible_inputs) = split_rule(self.visibility);
        let (requirement, required_inputs) = split_rule(self.requirement);
        let child_ids: Vec<PropertyId> =
            self.children.values().map(|child| child.id().clone()).collect();
        let inner = self.engine.inner();
        inner.ensure_registered(
            child_ids
                .iter()
                .chain(&visible_inputs)
                .chain(&required_inputs),
        )?;

        let settings = CoreSettings {
            visibility,
            requirement,
            ..CoreSettings::default()
        };
        let node = Arc::new(GroupNode {
            core: NodeCore::new(&self.engine, self.id.clone(), settings),
            children: self.children,
        });
        inner.register(Arc::clone(&node) as Arc<dyn Property>, NodeKind::synchronous())?;

        for child in &child_ids {
            inner.add_owner_dependency(&self.id, child, true)?;
        }
        for input in &visible_inputs {
            inner.add_dependency(input, &self.id, DependencyOptions::visible())?;
        }
        for input in &required_inputs {
            inner.add_dependency(input, &self.id, DependencyOptions::required())?;
        }
        for validator in self.cross_validators {
            inner.add_cross_validator(&self.id, validator)?;
        }

        Ok(GroupProperty(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_is_an_object_of_children() {
        let engine = RuleEngine::new();
        let name = engine.scalar::<String>("name").build().unwrap();
        let age = engine.scalar::<u32>("age").initial(30).build().unwrap();
        let person = engine
            .group("person")
            .child("name", &name)
            .child("age", &age)
            .build()
            .unwrap();

        assert_eq!(
            person.export_data(),
            serde_json::json!({ "name": null, "age": 30 })
        );
        assert_eq!(person.names().collect::<Vec<_>>(), ["name", "age"]);
        assert!(!person.is_empty());
    }

    #[test]
    fn import_routes_entries_to_children() {
        let engine = RuleEngine::new();
        let name = engine.scalar::<String>("name").build().unwrap();
        let person = engine.group("person").child("name", &name).build().unwrap();

        person
            .import_data(&serde_json::json!({ "name": "Ada", "unknown": 1 }))
            .unwrap();
        assert_eq!(name.get_value().as_deref(), Some("Ada"));

        let err = person.import_data(&serde_json::json!([1])).unwrap_err();
        assert!(matches!(err, PropertyError::ImportShape { .. }));
    }

    #[test]
    fn children_are_owned() {
        let engine = RuleEngine::new();
        let name = engine.scalar::<String>("name").build().unwrap();
        engine.group("person").child("name", &name).build().unwrap();

        engine.with_graph(|graph| {
            assert_eq!(graph.owned_by(&"person".into()), &[PropertyId::from("name")]);
            assert!(graph.dependency(&"name".into(), &"person".into()).unwrap().options.value);
        });

        let removed = engine.remove_property("person");
        assert_eq!(removed, vec![PropertyId::from("person"), PropertyId::from("name")]);
        assert!(engine.property("name").is_none());
    }

    #[test]
    fn child_changes_dirty_the_group() {
        let engine = RuleEngine::new();
        let name = engine.scalar::<String>("name").build().unwrap();
        let person = engine.group("person").child("name", &name).build().unwrap();
        assert!(!person.core().is_dirty());

        name.set_value("Ada".to_string()).unwrap();
        assert!(person.core().is_dirty());
    }
}
