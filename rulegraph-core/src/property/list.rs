//! List properties: a growable sequence of element properties.
//!
//! Elements are created by a factory so every element of one list has the
//! same shape. Element ids are derived from the list id (`items[0]`,
//! `items[1]`, ...) and never reused, even after removal.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value as Json;
use tracing::debug;

use super::node::{AsProperty, CoreSettings, NodeCore, Property, PropertyNode};
use crate::engine::RuleEngine;
use crate::error::{ConfigError, PropertyError};
use crate::graph::{NodeKind, PropertyId};

/// Creates one list element with the given id.
pub type ElementFactory<E> =
    Arc<dyn Fn(&RuleEngine, PropertyId) -> Result<E, ConfigError> + Send + Sync>;

/// List property state. Reached through [`ListProperty`].
pub struct ListNode<E> {
    core: NodeCore,
    factory: ElementFactory<E>,
    elements: RwLock<Vec<E>>,
    next_index: AtomicU64,
}

impl<E> ListNode<E>
where
    E: AsProperty + Clone + Send + Sync + 'static,
{
    fn engine(&self) -> Result<RuleEngine, ConfigError> {
        self.core
            .engine()
            .map(RuleEngine::from_inner)
            .ok_or_else(|| ConfigError::UnknownProperty(self.core.id().clone()))
    }

    /// Create, register and append a new element.
    pub fn add_element(&self) -> Result<E, ConfigError> {
        let engine = self.engine()?;
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let id = PropertyId::new(format!("{}[{}]", self.core.id(), index));

        let element = (self.factory)(&engine, id)?;
        let element_id = element.property_id();
        engine
            .inner()
            .add_owner_dependency(self.core.id(), &element_id, true)?;
        self.elements.write().push(element.clone());

        debug!(list = %self.core.id(), element = %element_id, "added element");
        self.core.value_changed();
        Ok(element)
    }

    /// Remove the element with `id` and everything it owns. Returns whether
    /// the element was found.
    pub fn remove_element(&self, id: &PropertyId) -> bool {
        let removed = {
            let mut elements = self.elements.write();
            elements
                .iter()
                .position(|e| e.property_id() == *id)
                .map(|position| elements.remove(position))
        };
        if removed.is_none() {
            return false;
        }
        if let Ok(engine) = self.engine() {
            engine.remove_property(id.clone());
        }
        debug!(list = %self.core.id(), element = %id, "removed element");
        self.core.value_changed();
        true
    }

    /// Get a snapshot of the elements.
    pub fn elements(&self) -> Vec<E> {
        self.elements.read().clone()
    }

    pub fn len(&self) -> usize {
        self.elements.read().len()
    }

    pub fn get(&self, index: usize) -> Option<E> {
        self.elements.read().get(index).cloned()
    }
}

impl<E> PropertyNode for ListNode<E>
where
    E: AsProperty + Clone + Send + Sync + 'static,
{
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn children(&self) -> Vec<Arc<dyn Property>> {
        self.elements
            .read()
            .iter()
            .map(AsProperty::as_property)
            .collect()
    }
}

impl<E> Property for ListNode<E>
where
    E: AsProperty + Clone + Send + Sync + 'static,
{
    fn is_empty(&self) -> bool {
        self.elements.read().is_empty()
    }

    fn export_data(&self) -> Json {
        Json::Array(
            self.children()
                .iter()
                .map(|element| element.export_data())
                .collect(),
        )
    }

    /// Resize to the imported length, then import each entry into the
    /// element at the same position.
    fn import_data(&self, data: &Json) -> Result<(), PropertyError> {
        let Json::Array(items) = data else {
            return Err(PropertyError::ImportShape {
                id: self.core.id().clone(),
                expected: "an array",
            });
        };
        while self.len() > items.len() {
            let last = self.elements.read().last().map(AsProperty::property_id);
            match last {
                Some(id) => {
                    self.remove_element(&id);
                }
                None => break,
            }
        }
        while self.len() < items.len() {
            self.add_element()?;
        }
        for (element, item) in self.children().iter().zip(items) {
            element.import_data(item)?;
        }
        Ok(())
    }
}

impl<E> fmt::Debug for ListNode<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListNode")
            .field("core", &self.core)
            .field("len", &self.elements.read().len())
            .finish()
    }
}

/// Handle to a list property. Cloning shares the list.
pub struct ListProperty<E>(Arc<ListNode<E>>);

impl<E> ListProperty<E>
where
    E: AsProperty + Clone + Send + Sync + 'static,
{
    pub(crate) fn build(
        engine: RuleEngine,
        id: PropertyId,
        factory: ElementFactory<E>,
    ) -> Result<Self, ConfigError> {
        let node = Arc::new(ListNode {
            core: NodeCore::new(&engine, id, CoreSettings::default()),
            factory,
            elements: RwLock::new(Vec::new()),
            next_index: AtomicU64::new(0),
        });
        engine
            .inner()
            .register(Arc::clone(&node) as Arc<dyn Property>, NodeKind::container())?;
        Ok(Self(node))
    }
}

impl<E> Clone for ListProperty<E> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<E> Deref for ListProperty<E> {
    type Target = ListNode<E>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<E> AsProperty for ListProperty<E>
where
    E: AsProperty + Clone + Send + Sync + 'static,
{
    fn as_property(&self) -> Arc<dyn Property> {
        Arc::clone(&self.0) as Arc<dyn Property>
    }
}

impl<E> fmt::Debug for ListProperty<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}
