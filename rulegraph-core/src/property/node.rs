//! Property Nodes
//!
//! Every property kind embeds a [`NodeCore`], which carries the dirty,
//! processing and validation state plus the listeners, and implements the
//! transitions the engine drives.
//!
//! # States
//!
//! The conceptual states are encoded as a few flags rather than an enum:
//!
//! - clean: `needs_to_recompute == Some(false)` and not processing
//! - dirty: `needs_to_recompute` is `None` (never computed) or `Some(true)`
//! - processing: an asynchronous recompute is in flight
//!
//! `needs_to_revalidate` is orthogonal to all of them.
//!
//! # Recompute tokens
//!
//! Each asynchronous recompute is tagged with the property's current
//! `recomputing_count`. A completion whose token no longer matches was
//! superseded: its result is dropped, and anyone awaiting it is chained onto
//! whatever recompute is current instead. The counter wraps to zero after
//! `2^53 - 1`.
//!
//! # Locking
//!
//! The state mutex is never held while listeners, rules or the engine run,
//! and never across an `.await`.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::{self, BoxFuture, Shared};
use futures_util::FutureExt;
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, trace, warn};

use super::backpressure::{Backpressure, Overlap};
use super::listener::{ListenerId, Listeners, ValueChangedListener};
use super::validation::{CrossValidator, ValidationMessage, ValidatorId};
use crate::engine::{EngineInner, RuleEngine};
use crate::error::{ConfigError, PropertyError, RuleError, UpdateError};
use crate::graph::{Dependency, DependencyOptions, PropertyId, UPDATE_TRIGGER};

/// Largest recompute token before the counter wraps.
pub(crate) const MAX_RECOMPUTE_TOKEN: u64 = (1 << 53) - 1;

/// Applies a computed value. Runs only if the recompute is still current.
pub type Commit = Box<dyn FnOnce() + Send>;

/// Pending asynchronous recompute, as produced by
/// [`PropertyNode::internally_async_update`].
pub type AsyncUpdate = BoxFuture<'static, Result<Commit, RuleError>>;

/// Resolves once the requested recompute (or whatever superseded it) settled.
pub type UpdateFuture = BoxFuture<'static, Result<(), UpdateError>>;

/// Boolean rule for visibility or required-ness.
pub type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// When a property recomputes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStrategy {
    /// Whenever it is dirty and read.
    #[default]
    Automatic,
    /// Only after an update trigger fired. The first computation still
    /// happens on first read.
    Manually,
}

#[derive(Debug, Clone)]
enum Settled {
    Committed,
    Stale,
    Failed(UpdateError),
}

type SettledFuture = Shared<BoxFuture<'static, Settled>>;

#[derive(Default)]
struct NodeState {
    needs_to_recompute: Option<bool>,
    processing: bool,
    recomputing_count: u64,
    in_flight: Option<SettledFuture>,
    needs_to_revalidate: bool,
    own_messages: Option<Vec<ValidationMessage>>,
    messages: Vec<ValidationMessage>,
    strategy: UpdateStrategy,
    manual_trigger_fired: bool,
}

impl NodeState {
    fn is_dirty(&self) -> bool {
        self.needs_to_recompute != Some(false)
    }

    fn next_token(&mut self) -> u64 {
        self.recomputing_count = if self.recomputing_count >= MAX_RECOMPUTE_TOKEN {
            0
        } else {
            self.recomputing_count + 1
        };
        self.recomputing_count
    }

    /// Invalidate whatever is in flight; its completion will be stale.
    fn supersede(&mut self) {
        if self.processing {
            self.next_token();
            self.processing = false;
            self.in_flight = None;
        }
    }

    fn fresh_own_messages(&self) -> Option<Vec<ValidationMessage>> {
        if self.needs_to_revalidate {
            None
        } else {
            self.own_messages.clone()
        }
    }
}

/// Construction-time settings of a [`NodeCore`].
#[derive(Default)]
pub(crate) struct CoreSettings {
    pub(crate) derived: bool,
    pub(crate) asynchronous: bool,
    pub(crate) read_only: bool,
    pub(crate) backpressure: Option<Backpressure>,
    pub(crate) visibility: Option<Predicate>,
    pub(crate) requirement: Option<Predicate>,
    pub(crate) strategy: UpdateStrategy,
}

/// State and lifecycle shared by every property kind.
pub struct NodeCore {
    id: PropertyId,
    engine: Weak<EngineInner>,
    asynchronous: bool,
    read_only: bool,
    backpressure: Option<Backpressure>,
    visibility: Option<Predicate>,
    requirement: Option<Predicate>,
    state: Mutex<NodeState>,
    listeners: Listeners,
    validators: Mutex<Vec<CrossValidator>>,
}

impl NodeCore {
    pub(crate) fn new(engine: &RuleEngine, id: PropertyId, settings: CoreSettings) -> Self {
        let state = NodeState {
            // properties without a rule have nothing to compute
            needs_to_recompute: if settings.derived {
                None
            } else {
                Some(false)
            },
            needs_to_revalidate: true,
            strategy: settings.strategy,
            ..NodeState::default()
        };
        Self {
            id,
            engine: engine.downgrade(),
            asynchronous: settings.asynchronous,
            read_only: settings.read_only,
            backpressure: settings.backpressure,
            visibility: settings.visibility,
            requirement: settings.requirement,
            state: Mutex::new(state),
            listeners: Listeners::default(),
            validators: Mutex::new(Vec::new()),
        }
    }

    /// Get the property's id.
    pub fn id(&self) -> &PropertyId {
        &self.id
    }

    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn backpressure(&self) -> Option<Backpressure> {
        self.backpressure
    }

    /// Whether an asynchronous recompute is in flight.
    pub fn is_processing(&self) -> bool {
        self.state.lock().processing
    }

    /// Whether the next read recomputes.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().is_dirty()
    }

    pub fn is_visible(&self) -> bool {
        self.visibility.as_ref().map_or(true, |rule| rule())
    }

    pub fn is_required(&self) -> bool {
        self.requirement.as_ref().is_some_and(|rule| rule())
    }

    pub fn update_strategy(&self) -> UpdateStrategy {
        self.state.lock().strategy
    }

    pub fn set_update_strategy(&self, strategy: UpdateStrategy) {
        self.state.lock().strategy = strategy;
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn engine(&self) -> Option<Arc<EngineInner>> {
        self.engine.upgrade()
    }

    pub(crate) fn attach_validator(&self, validator: CrossValidator) {
        self.validators.lock().push(validator);
    }

    /// Cross validators governing this property.
    pub fn cross_validators(&self) -> Vec<CrossValidator> {
        self.validators.lock().clone()
    }

    pub(crate) fn validator_ids(&self) -> Vec<ValidatorId> {
        self.validators.lock().iter().map(CrossValidator::id).collect()
    }

    /// Mark dirty, drop cached validation and, with `notify_others`, mark
    /// every value dependent dirty too. The engine passes `false` while it
    /// walks the graph itself.
    pub(crate) fn needs_an_update(&self, notify_others: bool) {
        {
            let mut state = self.state.lock();
            state.needs_to_recompute = Some(true);
            state.needs_to_revalidate = true;
        }
        if let Some(engine) = self.engine() {
            engine.cancel_validations(&self.validator_ids());
            engine.invalidate_validation_dependents(&self.id);
            if notify_others {
                engine.mark_dependents_dirty(&self.id);
            }
        }
        self.listeners.notify_needs_an_update();
    }

    pub(crate) fn has_been_updated(&self) {
        self.listeners.notify_updated();
    }

    pub(crate) fn error_while_updating(&self, error: &UpdateError) {
        warn!(id = %self.id, %error, "recompute failed, keeping last value");
        self.listeners.notify_update_failed(error);
    }

    pub(crate) fn dependency_has_been_updated(&self, edge: &Dependency) {
        let options = &edge.options;
        if options.validation || options.required || options.visible {
            self.invalidate_validation();
        }
        if options.has_custom(UPDATE_TRIGGER) {
            self.state.lock().manual_trigger_fired = true;
            self.needs_an_update(true);
        }
        self.listeners.notify_dependency_has_been_updated(edge);
    }

    /// The value was replaced from outside (`set_value`, list edits).
    pub(crate) fn value_changed(&self) {
        {
            let mut state = self.state.lock();
            state.needs_to_recompute = Some(false);
            state.needs_to_revalidate = true;
            state.supersede();
        }
        match self.engine() {
            Some(engine) => {
                engine.cancel_validations(&self.validator_ids());
                engine.mark_dependents_dirty(&self.id);
                engine.has_been_updated(&self.id);
            }
            None => self.has_been_updated(),
        }
    }

    /// Report a committed recompute.
    fn after_commit(&self) {
        match self.engine() {
            Some(engine) => engine.has_been_updated(&self.id),
            None => self.has_been_updated(),
        }
    }

    pub(crate) fn invalidate_validation(&self) {
        self.state.lock().needs_to_revalidate = true;
        if let Some(engine) = self.engine() {
            engine.cancel_validations(&self.validator_ids());
        }
    }

    pub(crate) fn messages(&self) -> Vec<ValidationMessage> {
        self.state.lock().messages.clone()
    }

    fn replace_messages(&self, messages: Vec<ValidationMessage>) {
        {
            let mut state = self.state.lock();
            state.messages = messages;
            state.needs_to_revalidate = true;
        }
        if let Some(engine) = self.engine() {
            engine.cancel_validations(&self.validator_ids());
        }
        self.listeners.notify_validated();
    }
}

impl fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NodeCore")
            .field("id", &self.id)
            .field("asynchronous", &self.asynchronous)
            .field("needs_to_recompute", &state.needs_to_recompute)
            .field("processing", &state.processing)
            .field("recomputing_count", &state.recomputing_count)
            .field("needs_to_revalidate", &state.needs_to_revalidate)
            .finish()
    }
}

/// Engine-facing contract of a property.
///
/// Concrete kinds supply their compute primitive; the lifecycle around it
/// lives in [`NodeCore`] and the engine.
pub trait PropertyNode: Send + Sync + 'static {
    fn core(&self) -> &NodeCore;

    /// Recompute synchronously. Only called on synchronous properties.
    fn internally_sync_update(&self) -> Result<(), RuleError> {
        Ok(())
    }

    /// Start an asynchronous recompute. Only called on asynchronous
    /// properties. The returned [`Commit`] is applied only if the recompute
    /// is still current when it settles.
    fn internally_async_update(&self) -> AsyncUpdate {
        future::ready(Ok(Box::new(|| ()) as Commit)).boxed()
    }

    /// Validation of the property's own value, excluding the required check.
    fn own_validation(&self) -> Vec<ValidationMessage> {
        Vec::new()
    }

    /// Properties contained in this one.
    fn children(&self) -> Vec<Arc<dyn Property>> {
        Vec::new()
    }

    /// A property this one depends on through a non-value edge was updated.
    fn dependency_has_been_updated(&self, edge: &Dependency) {
        self.core().dependency_has_been_updated(edge);
    }
}

/// Public contract shared by scalars, groups and lists.
pub trait Property: PropertyNode {
    /// Whether the property holds no value (or no elements).
    fn is_empty(&self) -> bool;

    /// Plain JSON rendering of the current value.
    fn export_data(&self) -> Json;

    /// Load a value produced by [`Property::export_data`]. Read-only
    /// properties ignore it.
    fn import_data(&self, data: &Json) -> Result<(), PropertyError>;

    fn id(&self) -> &PropertyId {
        self.core().id()
    }

    fn is_processing(&self) -> bool {
        self.core().is_processing()
    }

    fn is_asynchronous(&self) -> bool {
        self.core().is_asynchronous()
    }

    fn is_read_only(&self) -> bool {
        self.core().is_read_only()
    }

    fn is_visible(&self) -> bool {
        self.core().is_visible()
    }

    fn is_required(&self) -> bool {
        self.core().is_required()
    }

    /// Bring the value up to date, resolving asynchronous inputs first.
    fn await_update(&self) -> UpdateFuture {
        match self.core().engine() {
            Some(engine) => engine.update_value(self.id()),
            None => future::ready(Err(UpdateError::UnknownProperty(self.id().clone()))).boxed(),
        }
    }

    /// Mark this property and its value dependents dirty.
    fn needs_an_update(&self) {
        self.core().needs_an_update(true);
    }

    /// Validate, reusing cached results that are still fresh.
    fn validate(&self) -> BoxFuture<'static, Vec<ValidationMessage>> {
        match self
            .core()
            .engine()
            .and_then(|engine| engine.property(self.id().as_str()))
        {
            Some(node) => validate(node),
            None => future::ready(Vec::new()).boxed(),
        }
    }

    /// Whether the last reported messages contain no error.
    fn is_valid(&self) -> bool {
        self.core()
            .messages()
            .iter()
            .all(|message| !message.is_error())
    }

    /// Messages from the last validation, or set explicitly.
    fn get_validation_messages(&self) -> Vec<ValidationMessage> {
        self.core().messages()
    }

    /// Report externally produced messages (e.g. from a server). Cached
    /// results are invalidated, so the next `validate` runs again.
    fn set_validation_messages(&self, messages: Vec<ValidationMessage>) {
        self.core().replace_messages(messages);
    }

    fn clear_validation_result(&self) {
        self.core().replace_messages(Vec::new());
    }

    fn register_value_changed_listener(&self, listener: ValueChangedListener) -> ListenerId {
        self.core().listeners.register(listener)
    }

    fn deregister_value_changed_listener(&self, id: ListenerId) -> bool {
        self.core().listeners.deregister(id)
    }

    /// Recompute this property whenever `trigger` is updated. Combined with
    /// [`UpdateStrategy::Manually`] this is the only way it recomputes.
    fn add_update_trigger(&self, trigger: &PropertyId) -> Result<(), ConfigError> {
        match self.core().engine() {
            Some(engine) => engine.add_dependency(
                trigger,
                self.id(),
                DependencyOptions::custom(UPDATE_TRIGGER),
            ),
            None => Err(ConfigError::UnknownProperty(self.id().clone())),
        }
    }

    fn remove_update_trigger(&self, trigger: &PropertyId) -> bool {
        self.core().engine().is_some_and(|engine| {
            engine.remove_dependency_options(
                trigger,
                self.id(),
                &DependencyOptions::custom(UPDATE_TRIGGER),
            )
        })
    }

    fn set_update_strategy(&self, strategy: UpdateStrategy) {
        self.core().set_update_strategy(strategy);
    }
}

/// Anything that can hand out its property as a trait object.
pub trait AsProperty {
    fn as_property(&self) -> Arc<dyn Property>;

    fn property_id(&self) -> PropertyId {
        self.as_property().id().clone()
    }
}

impl AsProperty for Arc<dyn Property> {
    fn as_property(&self) -> Arc<dyn Property> {
        Arc::clone(self)
    }
}

// ----------------------------------------------------------------------------
// Update lifecycle
// ----------------------------------------------------------------------------

/// Recompute `node` if it is dirty.
///
/// Synchronous work happens before this returns; asynchronous work is
/// spawned. The future resolves when the resulting recompute settles.
pub(crate) fn internally_update(node: &Arc<dyn Property>) -> UpdateFuture {
    let core = node.core();
    let mut state = core.state.lock();

    if !state.is_dirty() {
        drop(state);
        return current_completion(Arc::clone(node));
    }
    if state.strategy == UpdateStrategy::Manually
        && !state.manual_trigger_fired
        && state.needs_to_recompute.is_some()
    {
        trace!(id = %core.id, "waiting for an update trigger");
        drop(state);
        return current_completion(Arc::clone(node));
    }

    // cleared first so marking during the compute re-dirties
    state.needs_to_recompute = Some(false);
    state.manual_trigger_fired = false;

    if !core.asynchronous {
        drop(state);
        let result = node.internally_sync_update();
        return future::ready(finish_sync(core, result)).boxed();
    }

    let was_processing = state.processing;
    let settled = if was_processing {
        match core.backpressure.unwrap_or_default().on_overlap() {
            Overlap::StartNow => {
                let token = state.next_token();
                start_async(node, token)
            }
            Overlap::Debounce(window) => {
                let token = state.next_token();
                let previous = state.in_flight.clone();
                start_debounced(node, token, previous, window)
            }
            Overlap::AwaitInFlight => {
                trace!(id = %core.id, "skipping overlapping recompute");
                drop(state);
                return current_completion(Arc::clone(node));
            }
        }
    } else {
        let token = state.next_token();
        start_async(node, token)
    };
    state.processing = true;
    state.in_flight = Some(settled.clone());
    drop(state);

    if !was_processing {
        core.listeners.notify_starts_async_update();
    }
    await_settled(Arc::clone(node), settled)
}

fn finish_sync(core: &NodeCore, result: Result<(), RuleError>) -> Result<(), UpdateError> {
    match result {
        Ok(()) => {
            core.after_commit();
            Ok(())
        }
        Err(source) => {
            let error = UpdateError::failed(&core.id, &source);
            core.error_while_updating(&error);
            Err(error)
        }
    }
}

fn spawn_settled<F>(id: PropertyId, task: F) -> SettledFuture
where
    F: Future<Output = Settled> + Send + 'static,
{
    tokio::spawn(task)
        .map(move |joined| joined.unwrap_or_else(|_| Settled::Failed(UpdateError::Aborted(id))))
        .boxed()
        .shared()
}

fn start_async(node: &Arc<dyn Property>, token: u64) -> SettledFuture {
    let id = node.core().id.clone();
    debug!(%id, token, "starting asynchronous recompute");
    spawn_settled(id, run_async(Arc::clone(node), token))
}

fn start_debounced(
    node: &Arc<dyn Property>,
    token: u64,
    previous: Option<SettledFuture>,
    window: Duration,
) -> SettledFuture {
    let id = node.core().id.clone();
    trace!(%id, token, ?window, "debouncing recompute");
    let node = Arc::clone(node);
    spawn_settled(id, async move {
        let timer = Box::pin(tokio::time::sleep(window));
        match previous {
            Some(previous) => {
                future::select(previous, timer).await;
            }
            None => timer.await,
        }

        let superseded = node.core().state.lock().recomputing_count != token;
        if superseded {
            trace!(id = %node.core().id, token, "debounced recompute superseded");
            return Settled::Stale;
        }
        run_async(node, token).await
    })
}

async fn run_async(node: Arc<dyn Property>, token: u64) -> Settled {
    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| node.internally_async_update()))
    {
        Ok(pending) => AssertUnwindSafe(pending)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err("derivation panicked".into())),
        Err(_) => Err("derivation panicked".into()),
    };

    let core = node.core();
    let committed = {
        let mut state = core.state.lock();
        if state.recomputing_count != token {
            trace!(id = %core.id, token, "discarding stale recompute");
            return Settled::Stale;
        }
        state.processing = false;
        state.in_flight = None;
        outcome.map(|commit| commit())
    };

    match committed {
        Ok(()) => {
            core.after_commit();
            Settled::Committed
        }
        Err(source) => {
            let error = UpdateError::failed(&core.id, &source);
            core.error_while_updating(&error);
            Settled::Failed(error)
        }
    }
}

fn await_settled(node: Arc<dyn Property>, settled: SettledFuture) -> UpdateFuture {
    async move {
        match settled.await {
            Settled::Committed => Ok(()),
            Settled::Failed(error) => Err(error),
            Settled::Stale => current_completion(node).await,
        }
    }
    .boxed()
}

/// Await whatever recompute of `node` is current, if any.
fn current_completion(node: Arc<dyn Property>) -> UpdateFuture {
    let in_flight = {
        let state = node.core().state.lock();
        if state.processing {
            state.in_flight.clone()
        } else {
            None
        }
    };
    match in_flight {
        Some(settled) => await_settled(node, settled),
        None => future::ready(Ok(())).boxed(),
    }
}

// ----------------------------------------------------------------------------
// Validation lifecycle
// ----------------------------------------------------------------------------

pub(crate) fn validate(node: Arc<dyn Property>) -> BoxFuture<'static, Vec<ValidationMessage>> {
    async move {
        let core = node.core();
        let engine = core.engine();
        if let Some(engine) = &engine {
            if let Err(error) = engine.update_value(&core.id).await {
                debug!(id = %core.id, %error, "validating last committed value");
            }
        }

        let validators = core.cross_validators();
        let mut messages = Vec::new();
        if core.is_visible() {
            // inputs are settled first so their commits cannot cancel a run
            if let Some(engine) = &engine {
                refresh_inputs(engine, &core.id, &validators).await;
            }
            messages.extend(own_messages(&*node));
            if let Some(engine) = &engine {
                for validator in &validators {
                    messages.extend(engine.run_validation(validator).await);
                }
            }
            for child in node.children() {
                messages.extend(child.validate().await);
            }
        }

        core.state.lock().messages = messages.clone();
        core.listeners.notify_validated();
        messages
    }
    .boxed()
}

async fn refresh_inputs(engine: &EngineInner, target: &PropertyId, validators: &[CrossValidator]) {
    let inputs: IndexSet<&PropertyId> = validators
        .iter()
        .flat_map(CrossValidator::inputs)
        .filter(|input| *input != target)
        .collect();
    for input in inputs {
        if let Err(error) = engine.update_value(input).await {
            debug!(%target, %input, %error, "validating against last committed input");
        }
    }
}

fn own_messages(node: &dyn Property) -> Vec<ValidationMessage> {
    let core = node.core();
    let cached = core.state.lock().fresh_own_messages();
    if let Some(cached) = cached {
        return cached;
    }

    let mut messages = Vec::new();
    if core.is_required() && node.is_empty() {
        messages.push(ValidationMessage::required());
    }
    messages.extend(node.own_validation());

    let mut state = core.state.lock();
    state.own_messages = Some(messages.clone());
    state.needs_to_revalidate = false;
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_wrap_at_max_safe_integer() {
        let mut state = NodeState {
            recomputing_count: MAX_RECOMPUTE_TOKEN - 1,
            ..NodeState::default()
        };
        assert_eq!(state.next_token(), MAX_RECOMPUTE_TOKEN);
        assert_eq!(state.next_token(), 0);
        assert_eq!(state.next_token(), 1);
    }

    #[test]
    fn never_computed_counts_as_dirty() {
        let mut state = NodeState::default();
        assert!(state.is_dirty());
        state.needs_to_recompute = Some(false);
        assert!(!state.is_dirty());
        state.needs_to_recompute = Some(true);
        assert!(state.is_dirty());
    }

    #[test]
    fn supersede_only_touches_processing_state() {
        let mut state = NodeState::default();
        state.supersede();
        assert_eq!(state.recomputing_count, 0);

        state.processing = true;
        state.supersede();
        assert_eq!(state.recomputing_count, 1);
        assert!(!state.processing);
    }

    #[test]
    fn own_messages_are_fresh_until_revalidation() {
        let mut state = NodeState {
            own_messages: Some(vec![ValidationMessage::error("bad")]),
            ..NodeState::default()
        };
        assert_eq!(state.fresh_own_messages(), None);
        state.needs_to_revalidate = false;
        assert_eq!(
            state.fresh_own_messages(),
            Some(vec![ValidationMessage::error("bad")])
        );
    }
}
