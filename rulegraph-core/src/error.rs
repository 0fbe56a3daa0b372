//! Error Types
//!
//! Errors are split by when they happen:
//!
//! - [`ConfigError`] is raised while the property graph is being built. It is
//!   fatal to the call that triggered it and never retried.
//! - [`UpdateError`] ends one recompute cycle of one property. It is delivered
//!   to every caller awaiting that recompute, which is why it is `Clone`.
//! - [`PropertyError`] is returned by the public mutation API (`set_value`,
//!   `import_data`, ...).
//!
//! User-supplied rules report failures as a [`RuleError`].

use thiserror::Error;

use crate::graph::PropertyId;

/// Error type returned by user-supplied rules: derivations, validators and
/// display-value parsers.
pub type RuleError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A misconfigured property graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Two properties were declared with the same id.
    #[error("property `{0}` is already registered")]
    DuplicateProperty(PropertyId),

    /// A dependency or lookup referenced an id the engine does not know.
    #[error("property `{0}` is not registered")]
    UnknownProperty(PropertyId),

    /// A value dependency was declared on a property that already has
    /// dependents of its own. Derivation graphs are built bottom-up.
    #[error(
        "cannot add value dependency `{from}` -> `{to}`: `{to}` already has dependents \
         and must be declared after its own inputs"
    )]
    NotBottomUp {
        /// Source of the rejected edge.
        from: PropertyId,
        /// Target of the rejected edge.
        to: PropertyId,
    },

    /// A read-only property cannot carry an initial value.
    #[error("read-only property `{0}` cannot define an initial value")]
    InitialValueOnReadOnly(PropertyId),

    /// The engine configuration could not be parsed.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
}

/// Failure of a single recompute cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    /// The property's rule returned an error (or panicked).
    #[error("updating `{id}` failed: {message}")]
    Failed {
        /// The property whose rule failed.
        id: PropertyId,
        /// Rendered rule error.
        message: String,
    },

    /// The property is not (or no longer) registered with the engine.
    #[error("property `{0}` is not registered")]
    UnknownProperty(PropertyId),

    /// The task driving the recompute was cancelled by the runtime.
    #[error("update task for `{0}` was aborted")]
    Aborted(PropertyId),
}

impl UpdateError {
    pub(crate) fn failed(id: &PropertyId, source: &RuleError) -> Self {
        Self::Failed {
            id: id.clone(),
            message: source.to_string(),
        }
    }
}

/// Errors from the public mutation API of a property.
#[derive(Debug, Error)]
pub enum PropertyError {
    /// The property is derived and cannot be written to.
    #[error("property `{0}` is read-only")]
    ReadOnly(PropertyId),

    /// A display value could not be converted back into a value.
    #[error("cannot convert `{text}` for `{id}`: {source}")]
    Conversion {
        /// Target property.
        id: PropertyId,
        /// The rejected display text.
        text: String,
        /// Converter error.
        source: RuleError,
    },

    /// Imported data did not deserialize into the property's value type.
    #[error("cannot import data into `{id}`: {source}")]
    Import {
        /// Target property.
        id: PropertyId,
        /// Deserialization error.
        source: serde_json::Error,
    },

    /// Imported data had the wrong JSON shape for a container.
    #[error("cannot import data into `{id}`: expected {expected}")]
    ImportShape {
        /// Target property.
        id: PropertyId,
        /// The JSON shape the container expects.
        expected: &'static str,
    },

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
