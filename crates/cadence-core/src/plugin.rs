//! Plugin specifications: a tag naming a registered factory plus its parameters.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `{ type: exec, command: "make all" }` in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    #[serde(rename = "type")]
    pub tag: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl PluginSpec {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// A parameter rendered as a string; numbers and booleans are accepted.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.params.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn require_str(&self, key: &str) -> Result<String> {
        self.get_str(key).ok_or_else(|| {
            Error::Configuration(format!("'{}' is required for plugin '{}'", key, self.tag))
        })
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.get_str(key) {
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                Error::Configuration(format!(
                    "'{}' must be a non-negative integer for plugin '{}'",
                    key, self.tag
                ))
            }),
            None => Ok(None),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get_str(key).as_deref() {
            Some("true") => Ok(Some(true)),
            Some("false") => Ok(Some(false)),
            Some(other) => Err(Error::Configuration(format!(
                "'{}' must be true or false for plugin '{}', got '{}'",
                key, self.tag, other
            ))),
            None => Ok(None),
        }
    }

    /// Every scalar parameter as a string map.
    pub fn string_params(&self) -> BTreeMap<String, String> {
        self.params
            .keys()
            .filter_map(|k| self.get_str(k).map(|v| (k.clone(), v)))
            .collect()
    }
}
