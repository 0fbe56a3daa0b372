//! Value-changed listeners.
//!
//! A listener is how a UI binding (or anything else) hears about a
//! property's lifecycle. Every hook except `updated` is optional; a listener
//! is a set of optional callback fields rather than an interface whose
//! methods may or may not exist.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::UpdateError;
use crate::graph::Dependency;

type Hook = Box<dyn Fn() + Send + Sync>;

/// Unique identifier for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Generate a new unique listener ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Callbacks invoked as a property moves through its lifecycle.
///
/// # Example
///
/// ```rust,ignore
/// let listener = ValueChangedListener::new(|| println!("refresh"))
///     .on_starts_async_update(|| println!("spinner on"))
///     .on_update_failed(|err| eprintln!("{err}"));
/// let id = property.register_value_changed_listener(listener);
/// ```
pub struct ValueChangedListener {
    updated: Hook,
    needs_an_update: Option<Hook>,
    starts_async_update: Option<Hook>,
    update_failed: Option<Box<dyn Fn(&UpdateError) + Send + Sync>>,
    dependency_has_been_updated: Option<Box<dyn Fn(&Dependency) + Send + Sync>>,
    validated: Option<Hook>,
}

impl ValueChangedListener {
    /// Create a listener that is told when the property has a new value.
    pub fn new<F>(updated: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            updated: Box::new(updated),
            needs_an_update: None,
            starts_async_update: None,
            update_failed: None,
            dependency_has_been_updated: None,
            validated: None,
        }
    }

    /// Called when the property became dirty.
    pub fn on_needs_an_update<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.needs_an_update = Some(Box::new(hook));
        self
    }

    /// Called when the property starts processing asynchronously.
    pub fn on_starts_async_update<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.starts_async_update = Some(Box::new(hook));
        self
    }

    /// Called when a recompute failed.
    pub fn on_update_failed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&UpdateError) + Send + Sync + 'static,
    {
        self.update_failed = Some(Box::new(hook));
        self
    }

    /// Called when a property this one depends on through a non-value edge
    /// has been updated.
    pub fn on_dependency_has_been_updated<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Dependency) + Send + Sync + 'static,
    {
        self.dependency_has_been_updated = Some(Box::new(hook));
        self
    }

    /// Called after validation messages changed.
    pub fn on_validated<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.validated = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for ValueChangedListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueChangedListener")
            .field("needs_an_update", &self.needs_an_update.is_some())
            .field("starts_async_update", &self.starts_async_update.is_some())
            .field("update_failed", &self.update_failed.is_some())
            .field(
                "dependency_has_been_updated",
                &self.dependency_has_been_updated.is_some(),
            )
            .field("validated", &self.validated.is_some())
            .finish()
    }
}

type Entries = Arc<Vec<(ListenerId, Arc<ValueChangedListener>)>>;

/// The listeners registered on one property.
///
/// Registration replaces the list (copy-on-write), so a notification in
/// progress keeps iterating its own snapshot.
#[derive(Debug, Default)]
pub(crate) struct Listeners {
    entries: Mutex<Entries>,
}

impl Listeners {
    pub(crate) fn register(&self, listener: ValueChangedListener) -> ListenerId {
        let id = ListenerId::new();
        let mut entries = self.entries.lock();
        Arc::make_mut(&mut *entries).push((id, Arc::new(listener)));
        id
    }

    pub(crate) fn deregister(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        Arc::make_mut(&mut *entries).retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn snapshot(&self) -> Entries {
        Arc::clone(&self.entries.lock())
    }

    pub(crate) fn notify_needs_an_update(&self) {
        for (_, listener) in self.snapshot().iter() {
            if let Some(hook) = &listener.needs_an_update {
                hook();
            }
        }
    }

    pub(crate) fn notify_starts_async_update(&self) {
        for (_, listener) in self.snapshot().iter() {
            if let Some(hook) = &listener.starts_async_update {
                hook();
            }
        }
    }

    pub(crate) fn notify_updated(&self) {
        for (_, listener) in self.snapshot().iter() {
            (listener.updated)();
        }
    }

    pub(crate) fn notify_update_failed(&self, error: &UpdateError) {
        for (_, listener) in self.snapshot().iter() {
            if let Some(hook) = &listener.update_failed {
                hook(error);
            }
        }
    }

    pub(crate) fn notify_dependency_has_been_updated(&self, edge: &Dependency) {
        for (_, listener) in self.snapshot().iter() {
            if let Some(hook) = &listener.dependency_has_been_updated {
                hook(edge);
            }
        }
    }

    pub(crate) fn notify_validated(&self) {
        for (_, listener) in self.snapshot().iter() {
            if let Some(hook) = &listener.validated {
                hook();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn listener_ids_are_unique() {
        assert_ne!(ListenerId::new(), ListenerId::new());
    }

    #[test]
    fn optional_hooks_are_skipped() {
        let updated = Arc::new(AtomicI32::new(0));
        let updated_clone = updated.clone();

        let listeners = Listeners::default();
        listeners.register(ValueChangedListener::new(move || {
            updated_clone.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.notify_needs_an_update();
        listeners.notify_starts_async_update();
        listeners.notify_validated();
        assert_eq!(updated.load(Ordering::SeqCst), 0);

        listeners.notify_updated();
        assert_eq!(updated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deregister_stops_notifications() {
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        let listeners = Listeners::default();
        let id = listeners.register(ValueChangedListener::new(|| {}).on_validated(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.notify_validated();
        assert!(listeners.deregister(id));
        assert!(!listeners.deregister(id));
        listeners.notify_validated();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(listeners.len(), 0);
    }

    #[test]
    fn registering_during_notification_keeps_snapshot() {
        let listeners = Arc::new(Listeners::default());
        let calls = Arc::new(AtomicI32::new(0));

        let inner = listeners.clone();
        let inner_calls = calls.clone();
        listeners.register(ValueChangedListener::new(move || {
            inner_calls.fetch_add(1, Ordering::SeqCst);
            let nested = inner_calls.clone();
            inner.register(ValueChangedListener::new(move || {
                nested.fetch_add(100, Ordering::SeqCst);
            }));
        }));

        listeners.notify_updated();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(listeners.len(), 2);
    }
}
