//! Translator and provider configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default upper bound on query police iterations.
pub const DEFAULT_MAX_POLICY_PASSES: usize = 8;

/// Default number of compiled queries kept by the query cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Default number of parent keys sent in one client-join query.
pub const DEFAULT_CLIENT_JOIN_BATCH_SIZE: usize = 500;

/// Translation pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    /// Maximum number of include/singleton/client-join rounds.
    pub max_policy_passes: usize,

    /// Rewrite skips into row-number filters even when the language has
    /// native offsets.
    pub emulate_offset: bool,
}

impl TranslatorConfig {
    pub fn new() -> Self {
        Self {
            max_policy_passes: DEFAULT_MAX_POLICY_PASSES,
            emulate_offset: false,
        }
    }

    /// Set the police iteration bound.
    pub fn with_max_policy_passes(mut self, passes: usize) -> Self {
        self.max_policy_passes = passes.max(1);
        self
    }

    /// Force row-number emulation of skips.
    pub fn with_emulated_offset(mut self) -> Self {
        self.emulate_offset = true;
        self
    }
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Entity provider settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Compiled query cache capacity. Zero disables the cache.
    pub cache_capacity: usize,

    /// Log every executed command with its parameter values.
    pub log_commands: bool,

    /// Parent keys per batched client-join query.
    pub client_join_batch_size: usize,

    pub translator: TranslatorConfig,
}

impl ProviderConfig {
    pub fn new() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            log_commands: false,
            client_join_batch_size: DEFAULT_CLIENT_JOIN_BATCH_SIZE,
            translator: TranslatorConfig::new(),
        }
    }

    /// Load a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::config(format!("provider configuration: {}", e)))
    }

    /// Set the query cache capacity.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Disable the query cache.
    pub fn without_cache(mut self) -> Self {
        self.cache_capacity = 0;
        self
    }

    /// Enable command logging.
    pub fn with_command_log(mut self) -> Self {
        self.log_commands = true;
        self
    }

    /// Set the client-join batch size.
    pub fn with_client_join_batch_size(mut self, size: usize) -> Self {
        self.client_join_batch_size = size.max(1);
        self
    }

    pub fn with_translator(mut self, translator: TranslatorConfig) -> Self {
        self.translator = translator;
        self
    }

    /// Check if compiled queries are cached.
    pub fn has_cache(&self) -> bool {
        self.cache_capacity > 0
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(config.cache_capacity, DEFAULT_CACHE_CAPACITY);
        assert_eq!(config.client_join_batch_size, DEFAULT_CLIENT_JOIN_BATCH_SIZE);
        assert_eq!(config.translator.max_policy_passes, DEFAULT_MAX_POLICY_PASSES);
        assert!(!config.log_commands);
        assert!(config.has_cache());
    }

    #[test]
    fn test_builders() {
        let config = ProviderConfig::new()
            .without_cache()
            .with_command_log()
            .with_client_join_batch_size(0)
            .with_translator(TranslatorConfig::new().with_emulated_offset());
        assert!(!config.has_cache());
        assert!(config.log_commands);
        assert_eq!(config.client_join_batch_size, 1);
        assert!(config.translator.emulate_offset);
    }

    #[test]
    fn test_from_json_partial() {
        let config = ProviderConfig::from_json(r#"{"log_commands": true}"#).unwrap();
        assert!(config.log_commands);
        assert_eq!(config.cache_capacity, DEFAULT_CACHE_CAPACITY);
        assert!(matches!(ProviderConfig::from_json("not json"), Err(Error::Config(_))));
    }
}
