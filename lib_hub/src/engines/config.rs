//! Parsing of the opaque config blob a client sends with `subscribe`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::EngineError;

const DEFAULT_ADAPTER: &str = "mock";
const DEFAULT_CACHE_LIMIT: usize = 100_000;

fn default_adapter() -> String {
    DEFAULT_ADAPTER.to_string()
}

fn default_cache_limit() -> usize {
    DEFAULT_CACHE_LIMIT
}

/// # Feed Config
///
/// The fields every adapter shares. Anything else in the blob is kept in
/// `options` for the adapter to interpret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedConfig {
    #[serde(default = "default_adapter")]
    pub adapter: String,
    pub key_column: String,
    #[serde(default = "default_cache_limit")]
    pub cache_limit: usize,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl FeedConfig {
    pub fn from_value(config: &Value) -> Result<Self, EngineError> {
        if !config.is_object() {
            return Err(EngineError::InvalidConfig("config must be a JSON object".to_string()));
        }
        let parsed: FeedConfig = serde_json::from_value(config.clone())
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        if parsed.key_column.trim().is_empty() {
            return Err(EngineError::InvalidConfig("keyColumn must not be empty".to_string()));
        }
        if parsed.cache_limit == 0 {
            return Err(EngineError::InvalidConfig("cacheLimit must be greater than zero".to_string()));
        }
        Ok(parsed)
    }

    pub fn option_u64(&self, name: &str) -> Option<u64> {
        self.options.get(name).and_then(Value::as_u64)
    }

    pub fn option_bool(&self, name: &str) -> Option<bool> {
        self.options.get(name).and_then(Value::as_bool)
    }
}
