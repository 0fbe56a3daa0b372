//! Display-value conversion.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as Json;

use crate::error::RuleError;

/// Converts between a scalar's value and the text shown to a user.
pub trait ValueConverter<T>: Send + Sync {
    /// Render a value. `None` renders as the empty string by convention.
    fn to_display(&self, value: Option<&T>) -> String;

    /// Parse user input back into a value.
    fn from_display(&self, text: &str) -> Result<Option<T>, RuleError>;
}

/// Default converter built on `serde_json`.
///
/// Strings display verbatim, everything else as compact JSON. Parsing tries
/// JSON first and falls back to treating the text as a JSON string, so both
/// `42` and `hello` round-trip for the matching types.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl<T> ValueConverter<T> for JsonConverter
where
    T: Serialize + DeserializeOwned,
{
    fn to_display(&self, value: Option<&T>) -> String {
        match value.map(serde_json::to_value) {
            None | Some(Ok(Json::Null)) | Some(Err(_)) => String::new(),
            Some(Ok(Json::String(text))) => text,
            Some(Ok(other)) => other.to_string(),
        }
    }

    fn from_display(&self, text: &str) -> Result<Option<T>, RuleError> {
        if text.is_empty() {
            return Ok(None);
        }
        if let Ok(value) = serde_json::from_str::<T>(text) {
            return Ok(Some(value));
        }
        let value = serde_json::from_value::<T>(Json::String(text.to_owned()))?;
        Ok(Some(value))
    }
}
