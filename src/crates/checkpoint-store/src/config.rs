//! Store configuration
//!
//! [`StoreConfig`] can be built from defaults or deserialized from a file.
//! Higher layers (`{PREFIX}`-prefixed environment variables, command-line
//! flags) are [`StoreConfigOverrides`]: every field that is set replaces the
//! value below it, even when it equals the default.
//!
//! ```rust,no_run
//! use checkpoint_store::{StoreConfig, StoreConfigOverrides};
//!
//! # fn example() -> checkpoint_store::Result<()> {
//! // CKPT_DATABASE_URL=sqlite:///var/lib/pipeline/checkpoints.db
//! let mut config = StoreConfig::default().with_pending_page_size(64);
//! config.apply(StoreConfigOverrides::from_env(StoreConfig::ENV_PREFIX)?);
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Checkpoint store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite URL, e.g. `sqlite://checkpoints.db` or `sqlite::memory:`
    pub database_url: String,

    /// Pool size (a private in-memory database always uses one connection)
    pub max_connections: u32,

    /// How long a connection waits on a locked database
    pub busy_timeout_ms: u64,

    /// Pending writes fetched per page when streaming the log
    pub pending_page_size: usize,

    /// Attempts made by `commit_with_retry`, first one included
    pub max_commit_attempts: u32,

    /// Apply built-in schema migrations when connecting
    pub auto_migrate: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://checkpoints.db".to_string(),
            max_connections: 5,
            busy_timeout_ms: 5_000,
            pending_page_size: crate::traits::DEFAULT_PAGE_SIZE,
            max_commit_attempts: 3,
            auto_migrate: true,
        }
    }
}

impl StoreConfig {
    /// Prefix of the environment variables read by [`from_env`](Self::from_env)
    pub const ENV_PREFIX: &'static str = "CKPT_";

    /// Configuration for a private in-memory SQLite database
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            ..Self::default()
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_pending_page_size(mut self, size: usize) -> Self {
        self.pending_page_size = size;
        self
    }

    pub fn with_max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = attempts;
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Whether the URL names a private in-memory database
    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }

    /// Defaults overridden by any `{prefix}*` variable that is set
    pub fn from_env(prefix: &str) -> Result<Self> {
        let mut config = Self::default();
        config.apply(StoreConfigOverrides::from_env(prefix)?);
        Ok(config)
    }

    /// Replace every field that `overrides` sets
    pub fn apply(&mut self, overrides: StoreConfigOverrides) -> &mut Self {
        if let Some(url) = overrides.database_url {
            self.database_url = url;
        }
        if let Some(connections) = overrides.max_connections {
            self.max_connections = connections;
        }
        if let Some(timeout) = overrides.busy_timeout_ms {
            self.busy_timeout_ms = timeout;
        }
        if let Some(size) = overrides.pending_page_size {
            self.pending_page_size = size;
        }
        if let Some(attempts) = overrides.max_commit_attempts {
            self.max_commit_attempts = attempts;
        }
        if let Some(auto_migrate) = overrides.auto_migrate {
            self.auto_migrate = auto_migrate;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(StoreError::Config("database_url must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(StoreError::Config("max_connections must be at least 1".into()));
        }
        if self.pending_page_size == 0 {
            return Err(StoreError::Config("pending_page_size must be at least 1".into()));
        }
        if self.max_commit_attempts == 0 {
            return Err(StoreError::Config("max_commit_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// One settings layer; `None` leaves the value underneath untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreConfigOverrides {
    pub database_url: Option<String>,
    pub max_connections: Option<u32>,
    pub busy_timeout_ms: Option<u64>,
    pub pending_page_size: Option<usize>,
    pub max_commit_attempts: Option<u32>,
    pub auto_migrate: Option<bool>,
}

impl StoreConfigOverrides {
    /// Every `{prefix}*` variable that is set
    pub fn from_env(prefix: &str) -> Result<Self> {
        Ok(Self {
            database_url: get_env(&env_key(prefix, "DATABASE_URL"))?,
            max_connections: get_env_parse(&env_key(prefix, "MAX_CONNECTIONS"))?,
            busy_timeout_ms: get_env_parse(&env_key(prefix, "BUSY_TIMEOUT_MS"))?,
            pending_page_size: get_env_parse(&env_key(prefix, "PENDING_PAGE_SIZE"))?,
            max_commit_attempts: get_env_parse(&env_key(prefix, "MAX_COMMIT_ATTEMPTS"))?,
            auto_migrate: get_env_bool(&env_key(prefix, "AUTO_MIGRATE"))?,
        })
    }
}

fn env_key(prefix: &str, name: &str) -> String {
    format!("{}{}", prefix, name)
}

fn get_env(key: &str) -> Result<Option<String>> {
    match env::var(key) {
        Ok(val) => Ok(Some(val)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(StoreError::Config(format!(
            "Environment variable {} contains invalid UTF-8",
            key
        ))),
    }
}

fn get_env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key)?
        .map(|val| {
            val.parse::<T>().map_err(|e| {
                StoreError::Config(format!("Failed to parse environment variable {}: {}", key, e))
            })
        })
        .transpose()
}

fn get_env_bool(key: &str) -> Result<Option<bool>> {
    match get_env(key)? {
        Some(val) => match val.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(StoreError::Config(format!(
                "Environment variable {} is not a boolean: {}",
                key, val
            ))),
        },
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.is_in_memory());
        assert!(StoreConfig::in_memory().is_in_memory());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(StoreConfig::default().with_pending_page_size(0).validate().is_err());
        assert!(StoreConfig::default().with_max_commit_attempts(0).validate().is_err());
        assert!(StoreConfig::default().with_database_url("  ").validate().is_err());
    }

    #[test]
    fn test_from_env() {
        // unique prefix so parallel tests do not interfere
        let prefix = "CKPT_TEST_FROM_ENV_";
        env::set_var("CKPT_TEST_FROM_ENV_DATABASE_URL", "sqlite://env.db");
        env::set_var("CKPT_TEST_FROM_ENV_PENDING_PAGE_SIZE", "16");
        env::set_var("CKPT_TEST_FROM_ENV_AUTO_MIGRATE", "off");

        let config = StoreConfig::from_env(prefix).unwrap();
        assert_eq!(config.database_url, "sqlite://env.db");
        assert_eq!(config.pending_page_size, 16);
        assert!(!config.auto_migrate);
        assert_eq!(config.max_connections, 5);

        env::set_var("CKPT_TEST_FROM_ENV_MAX_CONNECTIONS", "many");
        assert!(StoreConfig::from_env(prefix).is_err());
        env::remove_var("CKPT_TEST_FROM_ENV_MAX_CONNECTIONS");
    }

    #[test]
    fn test_overrides_win_even_at_default_values() {
        let mut base = StoreConfig {
            max_connections: 2,
            auto_migrate: false,
            ..StoreConfig::default().with_pending_page_size(64)
        };
        base.apply(StoreConfigOverrides {
            max_connections: Some(5),
            auto_migrate: Some(true),
            ..StoreConfigOverrides::default()
        });
        assert_eq!(base.max_connections, 5);
        assert!(base.auto_migrate);
        assert_eq!(base.pending_page_size, 64);

        let untouched = base.clone();
        base.apply(StoreConfigOverrides::default());
        assert_eq!(base, untouched);
    }

    #[test]
    fn test_deserialize_partial_toml_like_json() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"database_url": "sqlite://x.db", "max_connections": 2}"#)
                .unwrap();
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.busy_timeout_ms, 5_000);
    }
}
