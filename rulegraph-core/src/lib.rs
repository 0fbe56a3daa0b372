//! Rulegraph Core
//!
//! This crate provides a reactive, dependency-driven property engine. It
//! implements:
//!
//! - A typed dependency graph between properties (value, validation,
//!   visibility, required-ness and custom edges)
//! - Lazy recomputation of derived properties, synchronous or asynchronous
//! - Backpressure for overlapping asynchronous recomputes
//! - Memoized, cancellable cross-property validation
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Dependency graph over property ids
//! - `property`: Property kinds and their shared lifecycle
//! - `engine`: Update engine, configuration and validation cache
//! - `error`: Error types
//!
//! # Example
//!
//! ```rust,ignore
//! use rulegraph_core::{Property, RuleEngine};
//!
//! let engine = RuleEngine::new();
//! let a = engine.scalar::<String>("a").initial("abc".to_string()).build()?;
//!
//! let len = {
//!     let a = a.clone();
//!     engine
//!         .scalar::<usize>("len")
//!         .depends_on(["a"])
//!         .derive_async(move || {
//!             let a = a.get_value();
//!             async move { Ok(a.map(|s| s.len())) }
//!         })
//!         .build()?
//! };
//!
//! assert_eq!(len.await_value().await?, Some(3));
//! ```
//!
//! Asynchronous properties need a Tokio runtime; graphs of synchronous
//! properties work without one.

pub mod engine;
pub mod error;
pub mod graph;
pub mod property;

pub use engine::{BackpressureMode, EngineConfig, RuleEngine};
pub use error::{ConfigError, PropertyError, RuleError, UpdateError};
pub use graph::{Dependency, DependencyGraph, DependencyOptions, PropertyId};
pub use property::{
    AsProperty, Backpressure, CrossValidator, GroupProperty, ListProperty, Property,
    PropertyNode, ScalarProperty, UpdateStrategy, ValidationKind, ValidationMessage,
    ValueChangedListener,
};
