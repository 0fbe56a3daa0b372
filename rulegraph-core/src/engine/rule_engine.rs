//! Rule Engine
//!
//! The engine is the coordinator that connects properties, the dependency
//! graph and the validation cache. Everything is scoped to one engine
//! instance; properties hold a weak reference back to it.
//!
//! # How It Works
//!
//! 1. Builders register a property and declare its edges.
//!
//! 2. When a property changes, the engine walks its value edges and marks
//!    every value dependent dirty. Nothing is recomputed yet.
//!
//! 3. When a dirty property is read, the engine first brings its
//!    asynchronous predecessors up to date. If any of them is processing, the
//!    property's own recompute waits for all of them on a spawned task.
//!
//! 4. When a property has been updated, the engine walks its non-value edges
//!    so dependents can refresh visibility, required-ness and validation.
//!
//! # Locking
//!
//! Graph and property-map locks are only held to copy what a step needs. No
//! property code runs under them.

use std::sync::{Arc, Weak};

use futures_util::future::{self, join_all, BoxFuture};
use futures_util::FutureExt;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::debug;

use super::config::EngineConfig;
use super::validation::ValidationProcesses;
use crate::error::{ConfigError, UpdateError};
use crate::graph::{Dependency, DependencyGraph, DependencyOptions, NodeKind, PropertyId};
use crate::property::node::{internally_update, UpdateFuture};
use crate::property::{
    AsProperty, CrossValidator, ElementFactory, GroupBuilder, ListProperty, Property,
    ScalarBuilder, ValidationMessage, ValidatorId, Value,
};

pub(crate) struct EngineInner {
    config: EngineConfig,
    properties: RwLock<IndexMap<PropertyId, Arc<dyn Property>>>,
    graph: RwLock<DependencyGraph>,
    validations: ValidationProcesses,
}

impl EngineInner {
    pub(crate) fn property(&self, id: &str) -> Option<Arc<dyn Property>> {
        self.properties.read().get(id).cloned()
    }

    pub(crate) fn register(
        &self,
        node: Arc<dyn Property>,
        kind: NodeKind,
    ) -> Result<(), ConfigError> {
        let id = node.id().clone();
        {
            let mut properties = self.properties.write();
            if properties.contains_key(&id) {
                return Err(ConfigError::DuplicateProperty(id));
            }
            properties.insert(id.clone(), node);
        }
        self.graph.write().register_node(id, kind);
        Ok(())
    }

    pub(crate) fn ensure_registered<'a, I>(&self, ids: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = &'a PropertyId>,
    {
        let properties = self.properties.read();
        match ids.into_iter().find(|id| !properties.contains_key(*id)) {
            Some(missing) => Err(ConfigError::UnknownProperty(missing.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn add_dependency(
        &self,
        from: &PropertyId,
        to: &PropertyId,
        options: DependencyOptions,
    ) -> Result<(), ConfigError> {
        self.ensure_registered([from, to])?;
        self.graph.write().add_dependency(from, to, options)
    }

    pub(crate) fn add_owner_dependency(
        &self,
        owner: &PropertyId,
        owned: &PropertyId,
        with_value_dependency: bool,
    ) -> Result<(), ConfigError> {
        self.ensure_registered([owner, owned])?;
        self.graph
            .write()
            .add_owner_dependency(owner, owned, with_value_dependency)
    }

    pub(crate) fn remove_dependency_options(
        &self,
        from: &PropertyId,
        to: &PropertyId,
        options: &DependencyOptions,
    ) -> bool {
        self.graph.write().remove_dependency_options(from, to, options)
    }

    pub(crate) fn add_cross_validator(
        &self,
        target: &PropertyId,
        validator: CrossValidator,
    ) -> Result<(), ConfigError> {
        let node = self
            .property(target.as_str())
            .ok_or_else(|| ConfigError::UnknownProperty(target.clone()))?;
        let inputs: Vec<&PropertyId> = validator
            .inputs()
            .iter()
            .filter(|input| *input != target)
            .collect();
        self.ensure_registered(inputs.iter().copied())?;
        {
            let mut graph = self.graph.write();
            for input in inputs {
                graph.add_dependency(input, target, DependencyOptions::validation())?;
            }
        }
        node.core().attach_validator(validator);
        Ok(())
    }

    /// Bring `id` up to date, resolving asynchronous predecessors first.
    pub(crate) fn update_value(&self, id: &PropertyId) -> UpdateFuture {
        let Some(node) = self.property(id.as_str()) else {
            return future::ready(Err(UpdateError::UnknownProperty(id.clone()))).boxed();
        };
        if !node.core().is_dirty() {
            return internally_update(&node);
        }

        let predecessors: Vec<PropertyId> = self
            .graph
            .read()
            .async_dependencies(id)
            .map(|closure| closure.iter().cloned().collect())
            .unwrap_or_default();

        // a predecessor that settles on the first poll needs no waiting
        let mut pending = Vec::new();
        for predecessor in &predecessors {
            let mut update = self.update_value(predecessor);
            if (&mut update).now_or_never().is_none() {
                pending.push(update);
            }
        }
        if pending.is_empty() {
            return internally_update(&node);
        }

        debug!(%id, waiting = pending.len(), "waiting for asynchronous dependencies");
        let waiting_id = id.clone();
        let task = tokio::spawn(async move {
            for result in join_all(pending).await {
                if let Err(error) = result {
                    debug!(id = %waiting_id, %error, "dependency failed, recomputing anyway");
                }
            }
            internally_update(&node).await
        });
        let id = id.clone();
        task.map(move |joined| joined.unwrap_or_else(|_| Err(UpdateError::Aborted(id))))
            .boxed()
    }

    /// Mark every value dependent of `id` dirty.
    pub(crate) fn mark_dependents_dirty(&self, id: &PropertyId) {
        let mut targets = Vec::new();
        self.graph.read().traverse_depth_first(
            id,
            |edge| targets.push(edge.to.clone()),
            Some(&|edge: &Dependency| edge.options.value),
            true,
        );
        for target in targets {
            if let Some(node) = self.property(target.as_str()) {
                node.core().needs_an_update(false);
            }
        }
    }

    /// Drop the cached validation of every property `id` reaches directly
    /// through a validation, visibility or required edge.
    pub(crate) fn invalidate_validation_dependents(&self, id: &PropertyId) {
        let targets: Vec<PropertyId> = self
            .graph
            .read()
            .dependencies_of(id)
            .filter(|edge| {
                let options = &edge.options;
                options.validation || options.visible || options.required
            })
            .map(|edge| edge.to.clone())
            .collect();
        for target in targets {
            if let Some(node) = self.property(target.as_str()) {
                node.core().invalidate_validation();
            }
        }
    }

    /// Notify `id`'s listeners, then walk its non-value edges. Each dependent
    /// hears about the update once, however many paths reach it.
    pub(crate) fn has_been_updated(&self, id: &PropertyId) {
        let Some(node) = self.property(id.as_str()) else {
            return;
        };
        node.core().has_been_updated();

        let mut edges = Vec::new();
        self.graph.read().traverse_depth_first(
            id,
            |edge| edges.push(edge.clone()),
            Some(&|edge: &Dependency| edge.options.has_attribute_flags()),
            true,
        );
        for edge in edges {
            if let Some(target) = self.property(edge.to.as_str()) {
                target.dependency_has_been_updated(&edge);
            }
        }
    }

    pub(crate) fn run_validation(
        &self,
        validator: &CrossValidator,
    ) -> BoxFuture<'static, Vec<ValidationMessage>> {
        self.validations.run(validator)
    }

    pub(crate) fn cancel_validations(&self, ids: &[ValidatorId]) {
        self.validations.cancel(ids);
    }

    pub(crate) fn remove_property(&self, id: &PropertyId) -> Vec<PropertyId> {
        let removed = self.graph.write().remove_property(id);
        let nodes: Vec<Arc<dyn Property>> = {
            let mut properties = self.properties.write();
            removed
                .iter()
                .filter_map(|id| properties.shift_remove(id))
                .collect()
        };
        for node in &nodes {
            self.validations.forget(&node.core().validator_ids());
        }
        debug!(%id, removed = removed.len(), "removed property");
        removed
    }
}

/// Handle to one engine instance.
///
/// Cloning is cheap and shares the engine.
///
/// # Example
///
/// ```rust,ignore
/// let engine = RuleEngine::new();
/// let a = engine.scalar::<String>("a").initial("abc".to_string()).build()?;
/// let len = {
///     let a = a.clone();
///     engine
///         .scalar::<usize>("len")
///         .depends_on(["a"])
///         .derive(move || Ok(a.get_value().map(|s| s.len())))
///         .build()?
/// };
/// assert_eq!(len.get_value(), Some(3));
/// ```
#[derive(Clone)]
pub struct RuleEngine {
    inner: Arc<EngineInner>,
}

impl RuleEngine {
    /// Create an engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let graph = DependencyGraph::new().with_strict_build_order(config.strict_build_order);
        Self {
            inner: Arc::new(EngineInner {
                config,
                properties: RwLock::new(IndexMap::new()),
                graph: RwLock::new(graph),
                validations: ValidationProcesses::default(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &EngineInner {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<EngineInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Start declaring a scalar property.
    pub fn scalar<T: Value>(&self, id: impl Into<PropertyId>) -> ScalarBuilder<T> {
        ScalarBuilder::new(self.clone(), id.into())
    }

    /// Start declaring a group of named properties.
    pub fn group(&self, id: impl Into<PropertyId>) -> GroupBuilder {
        GroupBuilder::new(self.clone(), id.into())
    }

    /// Declare a list whose elements are created by `factory`.
    pub fn list<E, F>(&self, id: impl Into<PropertyId>, factory: F) -> Result<ListProperty<E>, ConfigError>
    where
        E: AsProperty + Clone + Send + Sync + 'static,
        F: Fn(&RuleEngine, PropertyId) -> Result<E, ConfigError> + Send + Sync + 'static,
    {
        let factory: ElementFactory<E> = Arc::new(factory);
        ListProperty::build(self.clone(), id.into(), factory)
    }

    /// Get a registered property.
    pub fn property(&self, id: &str) -> Option<Arc<dyn Property>> {
        self.inner.property(id)
    }

    /// Get the ids of all registered properties, in registration order.
    pub fn property_ids(&self) -> Vec<PropertyId> {
        self.inner.properties.read().keys().cloned().collect()
    }

    pub fn add_dependency(
        &self,
        from: impl Into<PropertyId>,
        to: impl Into<PropertyId>,
        options: DependencyOptions,
    ) -> Result<(), ConfigError> {
        self.inner.add_dependency(&from.into(), &to.into(), options)
    }

    /// Add `from -> to` for every `from`.
    pub fn add_dependencies<I>(
        &self,
        froms: I,
        to: impl Into<PropertyId>,
        options: DependencyOptions,
    ) -> Result<(), ConfigError>
    where
        I: IntoIterator,
        I::Item: Into<PropertyId>,
    {
        let to = to.into();
        let froms: Vec<PropertyId> = froms.into_iter().map(Into::into).collect();
        self.inner.ensure_registered(froms.iter().chain([&to]))?;
        self.inner
            .graph
            .write()
            .add_dependencies(&froms, &to, &options)
    }

    pub fn add_owner_dependency(
        &self,
        owner: impl Into<PropertyId>,
        owned: impl Into<PropertyId>,
        with_value_dependency: bool,
    ) -> Result<(), ConfigError> {
        self.inner
            .add_owner_dependency(&owner.into(), &owned.into(), with_value_dependency)
    }

    /// Attach `validator` to `target`. Each input gets a validation edge into
    /// `target`, so changing an input invalidates the cached result.
    pub fn add_cross_validator(
        &self,
        target: impl Into<PropertyId>,
        validator: CrossValidator,
    ) -> Result<(), ConfigError> {
        self.inner.add_cross_validator(&target.into(), validator)
    }

    /// Mark `id` and all its value dependents dirty.
    pub fn needs_an_update(&self, id: &str) -> Result<(), ConfigError> {
        let node = self
            .property(id)
            .ok_or_else(|| ConfigError::UnknownProperty(id.into()))?;
        node.needs_an_update();
        Ok(())
    }

    /// Bring `id` up to date.
    pub fn update_value(&self, id: impl Into<PropertyId>) -> UpdateFuture {
        self.inner.update_value(&id.into())
    }

    /// Find the first dependency cycle, if any.
    pub fn find_cyclic_dependencies(&self) -> Option<Vec<PropertyId>> {
        self.inner.graph.read().find_cyclic_dependencies()
    }

    /// Get the asynchronous properties `id` waits on.
    pub fn async_dependencies(&self, id: impl Into<PropertyId>) -> Vec<PropertyId> {
        self.inner
            .graph
            .read()
            .async_dependencies(&id.into())
            .map(|closure| closure.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Inspect the dependency graph.
    pub fn with_graph<R>(&self, inspect: impl FnOnce(&DependencyGraph) -> R) -> R {
        inspect(&self.inner.graph.read())
    }

    /// Remove `id` and everything it owns. Returns the removed ids.
    pub fn remove_property(&self, id: impl Into<PropertyId>) -> Vec<PropertyId> {
        self.inner.remove_property(&id.into())
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("config", &self.inner.config)
            .field("properties", &self.inner.properties.read().len())
            .finish()
    }
}
