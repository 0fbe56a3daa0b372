//! Scalar properties.
//!
//! A scalar holds one optional value. It is either a source, written with
//! [`ScalarNode::set_value`], or derived from a rule that reads other
//! properties. Rules may be synchronous or asynchronous.

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{trace, warn};

use super::backpressure::Backpressure;
use super::converter::{JsonConverter, ValueConverter};
use super::node::{
    AsProperty, AsyncUpdate, Commit, CoreSettings, NodeCore, Predicate, Property, PropertyNode,
    UpdateStrategy,
};
use super::validation::{CrossValidator, ValidationMessage, Validator};
use crate::engine::RuleEngine;
use crate::error::{ConfigError, PropertyError, RuleError, UpdateError};
use crate::graph::{DependencyOptions, NodeKind, PropertyId};

/// Bound for values a scalar can hold.
pub trait Value: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Value for T where T: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{}

type SyncRule<T> = Arc<dyn Fn() -> Result<Option<T>, RuleError> + Send + Sync>;
type AsyncRule<T> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Option<T>, RuleError>> + Send + Sync>;

enum Rule<T> {
    Sync(SyncRule<T>),
    Async(AsyncRule<T>),
}

/// Scalar property state. Reached through [`ScalarProperty`].
pub struct ScalarNode<T: Value> {
    core: NodeCore,
    value: Arc<Mutex<Option<T>>>,
    rule: Option<Rule<T>>,
    validators: Vec<Validator<T>>,
    converter: Arc<dyn ValueConverter<T>>,
}

impl<T: Value> ScalarNode<T> {
    /// Get the current value.
    ///
    /// A dirty property is brought up to date first. Synchronous rules run
    /// before this returns; an asynchronous recompute is only started, and
    /// the last committed value is returned meanwhile.
    pub fn get_value(&self) -> Option<T> {
        if self.core.is_dirty() {
            if let Some(engine) = self.core.engine() {
                drop(engine.update_value(self.core.id()));
            }
        }
        self.value.lock().clone()
    }

    /// Replace the value.
    ///
    /// Setting an equal value is a no-op. Otherwise dependents are marked
    /// dirty and listeners are told the property was updated.
    pub fn set_value(&self, value: impl Into<Option<T>>) -> Result<(), PropertyError> {
        if self.core.is_read_only() {
            return Err(PropertyError::ReadOnly(self.core.id().clone()));
        }
        let value = value.into();
        {
            let mut slot = self.value.lock();
            if *slot == value {
                return Ok(());
            }
            *slot = value;
        }
        self.core.value_changed();
        Ok(())
    }

    /// Resolve once the value is up to date, including every asynchronous
    /// input it depends on.
    pub fn await_value(&self) -> impl Future<Output = Result<Option<T>, UpdateError>> + Send + 'static {
        let update = self.await_update();
        let slot = Arc::clone(&self.value);
        async move {
            update.await?;
            let value = slot.lock().clone();
            Ok(value)
        }
    }

    /// Get the current value rendered by the converter.
    pub fn get_display_value(&self) -> String {
        self.converter.to_display(self.get_value().as_ref())
    }

    /// Parse `text` with the converter and set the result.
    pub fn set_display_value(&self, text: &str) -> Result<(), PropertyError> {
        let value = self
            .converter
            .from_display(text)
            .map_err(|source| PropertyError::Conversion {
                id: self.core.id().clone(),
                text: text.to_owned(),
                source,
            })?;
        self.set_value(value)
    }

    pub fn await_display_value(
        &self,
    ) -> impl Future<Output = Result<String, UpdateError>> + Send + 'static {
        let pending = self.await_value();
        let converter = Arc::clone(&self.converter);
        async move {
            let value = pending.await?;
            Ok(converter.to_display(value.as_ref()))
        }
    }

    /// Whether the value is derived from a rule.
    pub fn is_derived(&self) -> bool {
        self.rule.is_some()
    }
}

impl<T: Value> PropertyNode for ScalarNode<T> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn internally_sync_update(&self) -> Result<(), RuleError> {
        if let Some(Rule::Sync(rule)) = &self.rule {
            let value = rule()?;
            *self.value.lock() = value;
        }
        Ok(())
    }

    fn internally_async_update(&self) -> AsyncUpdate {
        let Some(Rule::Async(rule)) = &self.rule else {
            return futures_util::future::ready(Ok(Box::new(|| ()) as Commit)).boxed();
        };
        let pending = rule();
        let slot = Arc::clone(&self.value);
        async move {
            let value = pending.await?;
            Ok(Box::new(move || *slot.lock() = value) as Commit)
        }
        .boxed()
    }

    fn own_validation(&self) -> Vec<ValidationMessage> {
        let value = self.value.lock().clone();
        self.validators
            .iter()
            .filter_map(|validator| validator(value.as_ref()))
            .collect()
    }
}

impl<T: Value> Property for ScalarNode<T> {
    fn is_empty(&self) -> bool {
        match self.export_data() {
            Json::Null => true,
            Json::String(text) => text.is_empty(),
            Json::Array(items) => items.is_empty(),
            Json::Object(entries) => entries.is_empty(),
            _ => false,
        }
    }

    fn export_data(&self) -> Json {
        let value = self.value.lock();
        match value.as_ref().map(serde_json::to_value) {
            None => Json::Null,
            Some(Ok(data)) => data,
            Some(Err(error)) => {
                warn!(id = %self.core.id(), %error, "value does not serialize, exporting null");
                Json::Null
            }
        }
    }

    fn import_data(&self, data: &Json) -> Result<(), PropertyError> {
        if self.core.is_read_only() {
            trace!(id = %self.core.id(), "ignoring import into read-only property");
            return Ok(());
        }
        let value = serde_json::from_value::<Option<T>>(data.clone()).map_err(|source| {
            PropertyError::Import {
                id: self.core.id().clone(),
                source,
            }
        })?;
        self.set_value(value)
    }
}

impl<T: Value> fmt::Debug for ScalarNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarNode")
            .field("core", &self.core)
            .field("derived", &self.rule.is_some())
            .finish()
    }
}

/// Handle to a scalar property. Cloning shares the property.
pub struct ScalarProperty<T: Value>(Arc<ScalarNode<T>>);

impl<T: Value> Clone for ScalarProperty<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Value> Deref for ScalarProperty<T> {
    type Target = ScalarNode<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Value> AsProperty for ScalarProperty<T> {
    fn as_property(&self) -> Arc<dyn Property> {
        Arc::clone(&self.0) as Arc<dyn Property>
    }
}

impl<T: Value> fmt::Debug for ScalarProperty<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

/// Declares a [`ScalarProperty`]. Created by [`RuleEngine::scalar`].
pub struct ScalarBuilder<T: Value> {
    engine: RuleEngine,
    id: PropertyId,
    initial: Option<T>,
    inputs: Vec<PropertyId>,
    rule: Option<Rule<T>>,
    read_only: Option<bool>,
    backpressure: Option<Backpressure>,
    validators: Vec<Validator<T>>,
    cross_validators: Vec<CrossValidator>,
    visibility: Option<(Predicate, Vec<PropertyId>)>,
    requirement: Option<(Predicate, Vec<PropertyId>)>,
    converter: Option<Arc<dyn ValueConverter<T>>>,
    strategy: UpdateStrategy,
}

impl<T: Value> ScalarBuilder<T> {
    pub(crate) fn new(engine: RuleEngine, id: PropertyId) -> Self {
        Self {
            engine,
            id,
            initial: None,
            inputs: Vec::new(),
            rule: None,
            read_only: None,
            backpressure: None,
            validators: Vec::new(),
            cross_validators: Vec::new(),
            visibility: None,
            requirement: None,
            converter: None,
            strategy: UpdateStrategy::default(),
        }
    }

    pub fn initial(mut self, value: T) -> Self {
        self.initial = Some(value);
        self
    }

    /// Declare value edges from `inputs`. Inputs must already exist.
    pub fn depends_on<I>(mut self, inputs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<PropertyId>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    /// Derive the value synchronously.
    pub fn derive<F>(mut self, rule: F) -> Self
    where
        F: Fn() -> Result<Option<T>, RuleError> + Send + Sync + 'static,
    {
        self.rule = Some(Rule::Sync(Arc::new(rule)));
        self
    }

    /// Derive the value asynchronously. The rule is invoked when the
    /// recompute task starts running.
    pub fn derive_async<F, Fut>(mut self, rule: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<T>, RuleError>> + Send + 'static,
    {
        self.rule = Some(Rule::Async(Arc::new(move || rule().boxed())));
        self
    }

    /// Override read-only-ness. Derived properties are read-only by default.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = Some(backpressure);
        self
    }

    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(Option<&T>) -> Option<ValidationMessage> + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(validator));
        self
    }

    pub fn cross_validator(mut self, validator: CrossValidator) -> Self {
        self.cross_validators.push(validator);
        self
    }

    /// Show the property only while `rule` holds. `inputs` get visibility
    /// edges into this property.
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

    pub fn required(mut self) -> Self {
        let rule: Predicate = Arc::new(|| true);
        self.requirement = Some((rule, Vec::new()));
        self
    }

    /// Require a value only while `rule` holds.
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

    pub fn converter<C>(mut self, converter: C) -> Self
    where
        C: ValueConverter<T> + 'static,
    {
        self.converter = Some(Arc::new(converter));
        self
    }

    pub fn update_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Register the property and its edges.
    pub fn build(self) -> Result<ScalarProperty<T>, ConfigError> {
        let read_only = self.read_only.unwrap_or(self.rule.is_some());
        if read_only && self.initial.is_some() {
            return Err(ConfigError::InitialValueOnReadOnly(self.id));
        }

        let (visibility, visible_inputs) = split_rule(self.visibility);
        let (requirement, required_inputs) = split_rule(self.requirement);
        let inner = self.engine.inner();
        inner.ensure_registered(
            self.inputs
                .iter()
                .chain(&visible_inputs)
                .chain(&required_inputs)
                .chain(self.cross_validators.iter().flat_map(|v| v.inputs()))
                .filter(|id| **id != self.id),
        )?;

        let asynchronous = matches!(self.rule, Some(Rule::Async(_)));
        let backpressure = asynchronous.then(|| {
            self.backpressure
                .unwrap_or_else(|| self.engine.config().default_backpressure())
        });
        let settings = CoreSettings {
            derived: self.rule.is_some(),
            asynchronous,
            read_only,
            backpressure,
            visibility,
            requirement,
            strategy: self.strategy,
        };
        let node = Arc::new(ScalarNode {
            core: NodeCore::new(&self.engine, self.id.clone(), settings),
            value: Arc::new(Mutex::new(self.initial)),
            rule: self.rule,
            validators: self.validators,
            converter: self
                .converter
                .unwrap_or_else(|| Arc::new(JsonConverter) as Arc<dyn ValueConverter<T>>),
        });

        let kind = if asynchronous {
            NodeKind::asynchronous()
        } else {
            NodeKind::synchronous()
        };
        inner.register(Arc::clone(&node) as Arc<dyn Property>, kind)?;

        for input in &self.inputs {
            inner.add_dependency(input, &self.id, DependencyOptions::value())?;
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

        Ok(ScalarProperty(node))
    }
}

pub(crate) fn split_rule(
    rule: Option<(Predicate, Vec<PropertyId>)>,
) -> (Option<Predicate>, Vec<PropertyId>) {
    match rule {
        Some((predicate, inputs)) => (Some(predicate), inputs),
        None => (None, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_scalars_are_read_only() {
        let engine = RuleEngine::new();
        let derived = engine
            .scalar::<u32>("derived")
            .derive(|| Ok(Some(1)))
            .build()
            .unwrap();

        assert!(derived.is_read_only());
        assert!(matches!(
            derived.set_value(2),
            Err(PropertyError::ReadOnly(_))
        ));
        assert_eq!(derived.get_value(), Some(1));
    }

    #[test]
    fn initial_value_on_read_only_is_rejected() {
        let engine = RuleEngine::new();
        let err = engine
            .scalar::<u32>("x")
            .initial(1)
            .derive(|| Ok(None))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::InitialValueOnReadOnly("x".into()));
        assert!(engine.property("x").is_none());
    }

    #[test]
    fn unknown_inputs_are_rejected_before_registration() {
        let engine = RuleEngine::new();
        let err = engine
            .scalar::<u32>("x")
            .depends_on(["missing"])
            .derive(|| Ok(None))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownProperty("missing".into()));
        assert!(engine.property("x").is_none());
    }

    #[test]
    fn display_values_use_the_converter() {
        let engine = RuleEngine::new();
        let count = engine.scalar::<u32>("count").build().unwrap();

        count.set_display_value("12").unwrap();
        assert_eq!(count.get_value(), Some(12));
        assert_eq!(count.get_display_value(), "12");

        let err = count.set_display_value("twelve").unwrap_err();
        assert!(matches!(err, PropertyError::Conversion { .. }));
        assert_eq!(count.get_value(), Some(12));
    }

    #[test]
    fn empty_values() {
        let engine = RuleEngine::new();
        let name = engine.scalar::<String>("name").build().unwrap();
        assert!(name.is_empty());
        name.set_value(String::new()).unwrap();
        assert!(name.is_empty());
        name.set_value("x".to_string()).unwrap();
        assert!(!name.is_empty());
    }

    #[test]
    fn read_only_properties_ignore_imports() {
        let engine = RuleEngine::new();
        let derived = engine
            .scalar::<u32>("derived")
            .derive(|| Ok(Some(7)))
            .build()
            .unwrap();

        derived.import_data(&Json::from(1)).unwrap();
        assert_eq!(derived.get_value(), Some(7));
    }

    #[test]
    fn mistyped_imports_fail() {
        let engine = RuleEngine::new();
        let count = engine.scalar::<u32>("count").build().unwrap();
        let err = count.import_data(&Json::from("many")).unwrap_err();
        assert!(matches!(err, PropertyError::Import { .. }));
    }
}
