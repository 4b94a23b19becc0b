// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

/// Request store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite connection URL (e.g. `sqlite:.data/requests.db?mode=rwc`)
    pub database_url: String,
    /// Connection pool size
    pub max_connections: u32,
}

impl StoreConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `GRIDMOVER_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `GRIDMOVER_DB_MAX_CONNECTIONS`: pool size (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("GRIDMOVER_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("GRIDMOVER_DATABASE_URL"))?;

        let max_connections: u32 = std::env::var("GRIDMOVER_DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("GRIDMOVER_DB_MAX_CONNECTIONS", "must be a positive integer")
            })?;

        if max_connections == 0 {
            return Err(ConfigError::Invalid(
                "GRIDMOVER_DB_MAX_CONNECTIONS",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            database_url,
            max_connections,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_store_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("GRIDMOVER_DATABASE_URL", "sqlite::memory:");
        guard.remove("GRIDMOVER_DB_MAX_CONNECTIONS");

        let config = StoreConfig::from_env().unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.max_connections, 5);
    }

    #[test]
    fn test_store_config_missing_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("GRIDMOVER_DATABASE_URL");

        let err = StoreConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("GRIDMOVER_DATABASE_URL")));
    }

    #[test]
    fn test_store_config_invalid_pool_size() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("GRIDMOVER_DATABASE_URL", "sqlite::memory:");
        guard.set("GRIDMOVER_DB_MAX_CONNECTIONS", "zero");

        let err = StoreConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("GRIDMOVER_DB_MAX_CONNECTIONS", _)
        ));
    }
}
