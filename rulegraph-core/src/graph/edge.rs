//! Graph Vertices and Edges
//!
//! This module defines the identifiers and edge records that live in the
//! dependency graph. Vertices are plain string ids, never object references,
//! so the graph can be inspected and debugged without touching any property.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Custom edge attribute used by update triggers.
pub const UPDATE_TRIGGER: &str = "update_trigger";

/// Unique identifier for a property within one engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyId(String);

impl PropertyId {
    /// Create a new id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PropertyId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PropertyId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&PropertyId> for PropertyId {
    fn from(id: &PropertyId) -> Self {
        id.clone()
    }
}

impl Borrow<str> for PropertyId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// What kind of vertex a property is, as far as the graph cares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeKind {
    /// The property recomputes asynchronously.
    pub asynchronous: bool,

    /// The property is a list-of-properties container. Containers may gain
    /// value dependencies after they already have dependents of their own.
    pub container: bool,
}

impl NodeKind {
    /// A synchronous, non-container vertex.
    pub fn synchronous() -> Self {
        Self::default()
    }

    /// An asynchronous vertex.
    pub fn asynchronous() -> Self {
        Self {
            asynchronous: true,
            container: false,
        }
    }

    /// A list container vertex.
    pub fn container() -> Self {
        Self {
            asynchronous: false,
            container: true,
        }
    }
}

/// The kinds of relationship one edge carries.
///
/// Flags are merged by union when the same ordered pair is linked twice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyOptions {
    /// `to` derives its value from `from`.
    pub value: bool,
    /// `to`'s validation reads `from`.
    pub validation: bool,
    /// `to`'s visibility reads `from`.
    pub visible: bool,
    /// `to`'s required-ness reads `from`.
    pub required: bool,
    /// Named attributes beyond the built-in ones.
    pub custom: BTreeSet<String>,
}

impl DependencyOptions {
    /// A value edge.
    pub fn value() -> Self {
        Self {
            value: true,
            ..Self::default()
        }
    }

    /// A validation edge.
    pub fn validation() -> Self {
        Self {
            validation: true,
            ..Self::default()
        }
    }

    /// A visibility edge.
    pub fn visible() -> Self {
        Self {
            visible: true,
            ..Self::default()
        }
    }

    /// A required-ness edge.
    pub fn required() -> Self {
        Self {
            required: true,
            ..Self::default()
        }
    }

    /// An edge carrying a single custom attribute.
    pub fn custom(name: impl Into<String>) -> Self {
        let mut options = Self::default();
        options.custom.insert(name.into());
        options
    }

    /// Add a custom attribute.
    pub fn with_custom(mut self, name: impl Into<String>) -> Self {
        self.custom.insert(name.into());
        self
    }

    /// Whether the edge carries the given custom attribute.
    pub fn has_custom(&self, name: &str) -> bool {
        self.custom.contains(name)
    }

    /// Whether the edge carries anything besides a value dependency.
    pub fn has_attribute_flags(&self) -> bool {
        self.validation || self.visible || self.required || !self.custom.is_empty()
    }

    /// Whether no flag is set at all.
    pub fn is_empty(&self) -> bool {
        !self.value && !self.has_attribute_flags()
    }

    /// Union `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        self.value |= other.value;
        self.validation |= other.validation;
        self.visible |= other.visible;
        self.required |= other.required;
        self.custom.extend(other.custom.iter().cloned());
    }

    /// Clear every flag that is set in `other`.
    pub fn remove(&mut self, other: &Self) {
        self.value &= !other.value;
        self.validation &= !other.validation;
        self.visible &= !other.visible;
        self.required &= !other.required;
        self.custom.retain(|name| !other.custom.contains(name));
    }
}

/// A directed edge `from -> to`: if `from` changes, `to` is affected in the
/// ways described by `options`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// The property being depended on.
    pub from: PropertyId,
    /// The dependent property.
    pub to: PropertyId,
    /// Relationship flags.
    pub options: DependencyOptions,
}
