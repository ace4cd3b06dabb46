//! Container configuration.

use std::collections::HashMap;

use crate::error::ConfigurationError;

/// Maximum number of inherited call ids kept on a worker's call-id stack.
pub const PARENT_CALLS_CONFIG_KEY: &str = "PARENT_CALLS_TRACKED";

/// Maximum number of concurrently running workers per container.
pub const MAX_WORKERS_CONFIG_KEY: &str = "MAX_WORKERS";

/// Worker pool size used when `MAX_WORKERS` is unset.
pub const DEFAULT_MAX_WORKERS: usize = 10;

/// String-keyed configuration values handed to a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerConfig {
    values: HashMap<String, serde_json::Value>,
}

impl ContainerConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the known keys from environment variables of the same name.
    ///
    /// Values that parse as JSON are stored as such, anything else as a
    /// string. Validation happens when the values are read.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::new();
        for key in [PARENT_CALLS_CONFIG_KEY, MAX_WORKERS_CONFIG_KEY] {
            if let Ok(raw) = std::env::var(key) {
                let value = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
                config.values.insert(key.to_owned(), value);
            }
        }
        config
    }

    /// Sets `key` to `value`.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key.to_owned(), value.into());
        self
    }

    /// Returns the raw value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Returns the cap on inherited call ids, or `None` for unlimited.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidValue` if the value is not a
    /// non-negative integer.
    pub fn parent_calls_tracked(&self) -> Result<Option<usize>, ConfigurationError> {
        match self.get(PARENT_CALLS_CONFIG_KEY) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => parse_count(PARENT_CALLS_CONFIG_KEY, value).map(Some),
        }
    }

    /// Returns the worker pool size.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidValue` if the value is not a
    /// positive integer.
    pub fn max_workers(&self) -> Result<usize, ConfigurationError> {
        let Some(value) = self.get(MAX_WORKERS_CONFIG_KEY) else {
            return Ok(DEFAULT_MAX_WORKERS);
        };
        match parse_count(MAX_WORKERS_CONFIG_KEY, value)? {
            0 => Err(ConfigurationError::InvalidValue {
                key: MAX_WORKERS_CONFIG_KEY.to_owned(),
                reason: "must be at least 1".to_owned(),
            }),
            n => Ok(n),
        }
    }
}

impl From<HashMap<String, serde_json::Value>> for ContainerConfig {
    fn from(values: HashMap<String, serde_json::Value>) -> Self {
        Self { values }
    }
}

fn parse_count(key: &str, value: &serde_json::Value) -> Result<usize, ConfigurationError> {
    let invalid = |reason: String| ConfigurationError::InvalidValue {
        key: key.to_owned(),
        reason,
    };
    let n = match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| invalid(format!("expected a non-negative integer, got {n}")))?,
        serde_json::Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|e| invalid(format!("cannot parse {s:?}: {e}")))?,
        other => return Err(invalid(format!("expected an integer, got {other}"))),
    };
    usize::try_from(n).map_err(|e| invalid(e.to_string()))
}
