//! Dependency Graph
//!
//! This module implements the graph that records how properties depend on
//! one another.
//!
//! # Overview
//!
//! The graph is a directed multigraph where:
//!
//! - Vertices are [`PropertyId`]s, never property objects
//! - An edge `from -> to` means "when `from` changes, `to` is affected"
//! - Each edge carries flags saying *how* `to` is affected: its value, its
//!   validation, its visibility, its required-ness, or a custom attribute
//!
//! # Design Decisions
//!
//! 1. Edge kinds are flags on a single edge rather than separate graphs, so
//!    one traversal can select exactly the semantics it needs (value
//!    propagation only, or everything except value for attribute refresh).
//!
//! 2. Vertices are ids so the graph is independent of property lifetimes and
//!    can be inspected or dumped on its own.
//!
//! 3. Derivation graphs are built bottom-up. A value edge into a property
//!    that already has dependents is a build error, except for list
//!    containers, which gain elements over time.

mod dependency_graph;
mod edge;

pub use dependency_graph::DependencyGraph;
pub use edge::{Dependency, DependencyOptions, NodeKind, PropertyId, UPDATE_TRIGGER};
