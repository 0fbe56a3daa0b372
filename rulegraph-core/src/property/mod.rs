//! Properties
//!
//! A property is a reactive unit of state: a value, visibility,
//! required-ness and validation results.
//!
//! # Kinds
//!
//! - [`ScalarProperty`]: one optional value, set directly or derived by a
//!   synchronous or asynchronous rule
//! - [`GroupProperty`]: a fixed set of named children
//! - [`ListProperty`]: a growable sequence of elements made by a factory
//!
//! All kinds implement [`Property`]. The lifecycle they share (dirty
//! tracking, recompute tokens, backpressure, validation memoization) lives
//! in [`NodeCore`].

mod backpressure;
mod converter;
mod group;
mod list;
mod listener;
pub(crate) mod node;
mod scalar;
mod validation;

pub use backpressure::Backpressure;
pub use converter::{JsonConverter, ValueConverter};
pub use group::{GroupBuilder, GroupNode, GroupProperty};
pub use list::{ElementFactory, ListNode, ListProperty};
pub use listener::{ListenerId, ValueChangedListener};
pub use node::{
    AsProperty, AsyncUpdate, Commit, NodeCore, Predicate, Property, PropertyNode, UpdateFuture,
    UpdateStrategy,
};
pub use scalar::{ScalarBuilder, ScalarNode, ScalarProperty, Value};
pub use validation::{CrossValidator, ValidationKind, ValidationMessage, Validator, ValidatorId};
