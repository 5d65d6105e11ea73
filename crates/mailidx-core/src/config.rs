//! Facade configuration

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::schema::DB_VERSION;

/// Delay between `delete_database` polls while transactions are active.
pub const DEFAULT_DELETE_RETRY_DELAY_MS: u64 = 150;

/// Tunables of [`crate::DbFacade`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Schema version requested when opening the database
    pub version: u32,
    /// Fixed delay between `delete_database` retries
    pub delete_retry_delay_ms: u64,
    /// Give up deleting after this many retries; `None` waits forever
    pub delete_max_retries: Option<u32>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            version: DB_VERSION,
            delete_retry_delay_ms: DEFAULT_DELETE_RETRY_DELAY_MS,
            delete_max_retries: None,
        }
    }
}

impl DbConfig {
    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn delete_retry_delay(&self) -> Duration {
        Duration::from_millis(self.delete_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.version, DB_VERSION);
        assert_eq!(config.delete_retry_delay(), Duration::from_millis(150));
        assert_eq!(config.delete_max_retries, None);
    }

    #[test]
    fn test_from_json_partial() {
        let config = DbConfig::from_json(r#"{"delete_max_retries": 5}"#).unwrap();
        assert_eq!(
            config,
            DbConfig {
                delete_max_retries: Some(5),
                ..DbConfig::default()
            }
        );
    }

    #[test]
    fn test_from_json_invalid() {
        let err = DbConfig::from_json(r#"{"version": "three"}"#).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Serialization);
    }
}
