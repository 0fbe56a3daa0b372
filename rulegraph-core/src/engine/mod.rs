//! Update Engine
//!
//! This module ties properties to the dependency graph.
//!
//! # Overview
//!
//! - [`RuleEngine`] owns the property map, the graph and the validation
//!   process cache, and drives recomputation and change notification.
//! - [`EngineConfig`] carries the defaults shared by all properties of one
//!   engine.
//!
//! The validation process cache is internal: it is reached through
//! `Property::validate`.

mod config;
mod rule_engine;
mod validation;

pub use config::{BackpressureMode, EngineConfig};
pub(crate) use rule_engine::EngineInner;
pub use rule_engine::RuleEngine;
