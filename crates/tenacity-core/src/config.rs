// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Timing knobs of the engine.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    /// How long one executing attempt's lease lasts before crash recovery may
    /// reclaim it. Renewed at half this interval while the attempt runs.
    pub lease_length: Duration,
    /// Polling interval of `wait_for_result`.
    pub poll_interval: Duration,
    /// Interval of the crash-recovery and wakeup sweep.
    pub watchdog_interval: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            lease_length: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            watchdog_interval: Duration::from_secs(1),
        }
    }
}

impl RuntimeSettings {
    /// The lease length as a chrono duration, for timestamp arithmetic.
    pub fn lease_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_length).unwrap_or(chrono::Duration::MAX)
    }
}

/// Tenacity engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL or database file path
    pub database_url: String,
    /// Timing knobs
    pub settings: RuntimeSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `TENACITY_DATABASE_URL`: SQLite connection string or file path
    ///
    /// Optional (with defaults):
    /// - `TENACITY_LEASE_LENGTH_MS`: lease length (default: 10000)
    /// - `TENACITY_POLL_INTERVAL_MS`: result polling interval (default: 100)
    /// - `TENACITY_WATCHDOG_INTERVAL_MS`: sweep interval (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TENACITY_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("TENACITY_DATABASE_URL"))?;

        let lease_length = duration_var("TENACITY_LEASE_LENGTH_MS", 10_000)?;
        let poll_interval = duration_var("TENACITY_POLL_INTERVAL_MS", 100)?;
        let watchdog_interval = duration_var("TENACITY_WATCHDOG_INTERVAL_MS", 1_000)?;

        Ok(Self {
            database_url,
            settings: RuntimeSettings {
                lease_length,
                poll_interval,
                watchdog_interval,
            },
        })
    }
}

fn duration_var(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    let ms: u64 = std::env::var(name)
        .unwrap_or_else(|_| default_ms.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, "must be a duration in milliseconds"))?;
    if ms == 0 {
        return Err(ConfigError::Invalid(name, "must be greater than zero"));
    }
    Ok(Duration::from_millis(ms))
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

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
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
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
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
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("TENACITY_DATABASE_URL", "sqlite:.data/flows.db");
        guard.remove("TENACITY_LEASE_LENGTH_MS");
        guard.remove("TENACITY_POLL_INTERVAL_MS");
        guard.remove("TENACITY_WATCHDOG_INTERVAL_MS");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite:.data/flows.db");
        assert_eq!(config.settings.lease_length, Duration::from_secs(10));
        assert_eq!(config.settings.poll_interval, Duration::from_millis(100));
        assert_eq!(config.settings.watchdog_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("TENACITY_DATABASE_URL", "sqlite::memory:");
        guard.set("TENACITY_LEASE_LENGTH_MS", "5000");
        guard.set("TENACITY_POLL_INTERVAL_MS", "50");
        guard.set("TENACITY_WATCHDOG_INTERVAL_MS", "250");

        let config = Config::from_env().unwrap();

        assert_eq!(config.settings.lease_length, Duration::from_millis(5000));
        assert_eq!(config.settings.poll_interval, Duration::from_millis(50));
        assert_eq!(
            config.settings.watchdog_interval,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("TENACITY_DATABASE_URL");

        let result = Config::from_env();
        assert!(result.is_err());

        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TENACITY_DATABASE_URL")));
        assert!(err.to_string().contains("TENACITY_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_lease_length() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("TENACITY_DATABASE_URL", "sqlite::memory:");
        guard.set("TENACITY_LEASE_LENGTH_MS", "not_a_number");

        let result = Config::from_env();
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::Invalid("TENACITY_LEASE_LENGTH_MS", _)
        ));
    }

    #[test]
    fn test_config_zero_interval_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("TENACITY_DATABASE_URL", "sqlite::memory:");
        guard.set("TENACITY_POLL_INTERVAL_MS", "0");

        let result = Config::from_env();
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::Invalid("TENACITY_POLL_INTERVAL_MS", _)
        ));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }

    #[test]
    fn test_default_settings() {
        let settings = RuntimeSettings::default();
        assert_eq!(settings.lease_length, Duration::from_secs(10));
        assert!(settings.lease_chrono() >= chrono::Duration::seconds(10));
    }
}
