//! SQLite connection settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use querykit_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default busy timeout in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Default number of prepared statements kept per connection.
pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 64;

/// Where and how to open the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database file. `None` opens a private in-memory database.
    pub path: Option<PathBuf>,

    /// Use `LIMIT/OFFSET` for skips instead of row-number filters.
    pub native_offset: bool,

    /// How long a locked database is retried before failing.
    pub busy_timeout_ms: u64,

    /// Prepared statements cached per connection.
    pub statement_cache_capacity: usize,
}

impl SqliteConfig {
    /// Settings for a database file.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::in_memory()
        }
    }

    /// Settings for a private in-memory database.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            native_offset: true,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            statement_cache_capacity: DEFAULT_STATEMENT_CACHE_CAPACITY,
        }
    }

    /// Load settings from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::config(format!("sqlite configuration: {}", e)))
    }

    /// Emulate skips with row numbers.
    pub fn with_emulated_offset(mut self) -> Self {
        self.native_offset = false;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Check if the database lives only as long as its connection.
    pub fn is_in_memory(&self) -> bool {
        self.path.is_none()
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SqliteConfig::default();
        assert!(config.is_in_memory());
        assert!(config.native_offset);
        assert_eq!(config.busy_timeout(), Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS));
    }

    #[test]
    fn test_from_json() {
        let config =
            SqliteConfig::from_json(r#"{"path": "northwind.db3", "native_offset": false}"#).unwrap();
        assert_eq!(config.path, Some(PathBuf::from("northwind.db3")));
        assert!(!config.native_offset);
        assert_eq!(config.statement_cache_capacity, DEFAULT_STATEMENT_CACHE_CAPACITY);
        assert!(matches!(SqliteConfig::from_json("{"), Err(Error::Config(_))));
        assert!(matches!(SqliteConfig::from_json("42"), Err(Error::Config(_))));
    }

    #[test]
    fn test_busy_timeout_saturates() {
        let config = SqliteConfig::in_memory().with_busy_timeout(Duration::MAX);
        assert_eq!(config.busy_timeout_ms, u64::MAX);
        let config = config.with_busy_timeout(Duration::from_secs(2));
        assert_eq!(config.busy_timeout(), Duration::from_secs(2));
    }
}
