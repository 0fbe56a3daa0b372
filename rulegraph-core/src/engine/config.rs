//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::property::Backpressure;

/// Default policy family for asynchronous scalars.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureMode {
    #[default]
    Switch,
    Skip,
}

/// Settings shared by every property of one engine.
///
/// Missing fields take their defaults, so `{}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backpressure of asynchronous scalars that do not set their own.
    pub async_backpressure: BackpressureMode,

    /// Debounce window for `switch`, in milliseconds. `null` disables it.
    pub default_debounce_ms: Option<u64>,

    /// Reject value edges into properties that already have dependents.
    pub strict_build_order: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            async_backpressure: BackpressureMode::Switch,
            default_debounce_ms: Some(40),
            strict_build_order: true,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON configuration.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|err| ConfigError::InvalidConfig(err.to_string()))
    }

    /// Backpressure for an asynchronous scalar without an explicit policy.
    pub fn default_backpressure(&self) -> Backpressure {
        match self.async_backpressure {
            BackpressureMode::Skip => Backpressure::Skip,
            BackpressureMode::Switch => Backpressure::Switch {
                debounce: self.default_debounce_ms.map(Duration::from_millis),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_the_default() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.default_backpressure(), Backpressure::default());
    }

    #[test]
    fn fields_override_defaults() {
        let config = EngineConfig::from_json(
            r#"{"async_backpressure": "skip", "strict_build_order": false}"#,
        )
        .unwrap();
        assert_eq!(config.async_backpressure, BackpressureMode::Skip);
        assert!(!config.strict_build_order);
        assert_eq!(config.default_debounce_ms, Some(40));
        assert_eq!(config.default_backpressure(), Backpressure::Skip);
    }

    #[test]
    fn null_debounce_disables_it() {
        let config = EngineConfig::from_json(r#"{"default_debounce_ms": null}"#).unwrap();
        assert_eq!(config.default_backpressure(), Backpressure::switch());
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = EngineConfig::from_json(r#"{"async_backpressure": "queue"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig(_)));
    }
}
