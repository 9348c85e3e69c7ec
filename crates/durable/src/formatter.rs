//! Step state serialization
//!
//! The engine only depends on [`StateFormatter`]. Each persisted step records
//! the formatter name in `state_format`, so a step written by one formatter is
//! never silently decoded by another.

use serde::{de::DeserializeOwned, Serialize};

/// Error from formatter operations
#[derive(Debug, thiserror::Error)]
pub enum FormatterError {
    #[error("failed to serialize state: {0}")]
    Serialize(String),

    #[error("failed to deserialize state: {0}")]
    Deserialize(String),

    /// The value to decode is absent
    #[error("no state to deserialize")]
    Missing,
}

/// Pluggable serializer for step state and activation arguments
pub trait StateFormatter: Send + Sync + 'static {
    /// Name recorded in `Step::state_format`
    fn name(&self) -> &str;

    fn serialize_value(&self, value: &serde_json::Value) -> Result<String, FormatterError>;

    fn deserialize_value(&self, text: &str) -> Result<serde_json::Value, FormatterError>;
}

impl<'a> dyn StateFormatter + 'a {
    /// Serialize any value through this formatter
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, FormatterError> {
        let value =
            serde_json::to_value(value).map_err(|e| FormatterError::Serialize(e.to_string()))?;
        self.serialize_value(&value)
    }

    /// Deserialize a value previously written by this formatter
    pub fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T, FormatterError> {
        let value = self.deserialize_value(text)?;
        serde_json::from_value(value).map_err(|e| FormatterError::Deserialize(e.to_string()))
    }

    /// Deserialize an optional payload, failing when it is absent
    pub fn decode_opt<T: DeserializeOwned>(
        &self,
        text: Option<&str>,
    ) -> Result<T, FormatterError> {
        self.decode(text.ok_or(FormatterError::Missing)?)
    }
}

/// JSON formatter backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStateFormatter;

impl JsonStateFormatter {
    pub const NAME: &'static str = "json";
}

impl StateFormatter for JsonStateFormatter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn serialize_value(&self, value: &serde_json::Value) -> Result<String, FormatterError> {
        serde_json::to_string(value).map_err(|e| FormatterError::Serialize(e.to_string()))
    }

    fn deserialize_value(&self, text: &str) -> Result<serde_json::Value, FormatterError> {
        serde_json::from_str(text).map_err(|e| FormatterError::Deserialize(e.to_string()))
    }
}
