//! # Configuration Management Module
//!
//! ## Purpose
//! Centralized configuration management for the counter cache service,
//! supporting multiple sources (files, environment variables) with validation
//! and type-safe access to all system settings.
//!
//! ## Input/Output Specification
//! - **Input**: Configuration files (TOML), environment variables
//! - **Output**: Validated configuration structs with defaults and overrides
//! - **Validation**: Type checking, range validation, counter definitions
//!
//! ## Configuration Sources (in order of precedence)
//! 1. Environment variables (highest priority)
//! 2. Configuration files
//! 3. Default values (lowest priority)
//!
//! The rate-limit ceiling, session quiet window, and lock TTLs were tuned
//! empirically for the original deployment's data volume; they are settings
//! here, not constants.

use crate::errors::{CounterError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure containing all system settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server and API configuration
    pub server: ServerConfig,
    /// Storage and database settings
    pub storage: StorageConfig,
    /// Cache, rate limit, and lock settings
    pub cache: CacheSettings,
    /// Cache warming settings
    pub warming: WarmingConfig,
    /// Extra counter definitions beyond the built-in set
    #[serde(default)]
    pub counters: Vec<CounterDefConfig>,
    /// Logging and monitoring
    pub logging: LoggingConfig,
}

/// Server and API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
}

/// Storage and database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file path
    pub db_path: PathBuf,
}

/// Cache, rate limit, and lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Fast-cache entry time to live in seconds
    pub fast_cache_ttl_seconds: u64,
    /// Maximum stale marks applied per key within one rate-limit window
    pub stale_marks_per_window: u32,
    /// Rolling rate-limit window in minutes
    pub rate_limit_window_minutes: u64,
    /// Quiet period after which an editing session's batched invalidations
    /// are flushed, in seconds
    pub session_quiet_window_seconds: u64,
    /// Lock TTL for single-council recomputations, in minutes
    pub counter_lock_ttl_minutes: u64,
    /// Lock TTL for the warming overlap guard, in minutes
    pub warming_lock_ttl_minutes: u64,
    /// Lock TTL for site-wide (whole population) recomputations, in minutes
    pub site_wide_lock_ttl_minutes: u64,
}

impl CacheSettings {
    pub fn fast_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.fast_cache_ttl_seconds)
    }

    pub fn rate_limit_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.rate_limit_window_minutes as i64)
    }

    pub fn session_quiet_window(&self) -> Duration {
        Duration::from_secs(self.session_quiet_window_seconds)
    }

    pub fn counter_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.counter_lock_ttl_minutes * 60)
    }

    pub fn warming_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.warming_lock_ttl_minutes * 60)
    }

    pub fn site_wide_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.site_wide_lock_ttl_minutes * 60)
    }
}

/// Cache warming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmingConfig {
    /// Number of counters warmed per batch
    pub batch_size: usize,
    /// Pause between batches in milliseconds
    pub batch_pause_ms: u64,
}

/// A counter definition supplied through configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterDefConfig {
    /// Counter identifier (slug)
    pub id: String,
    /// Display name
    pub name: String,
    /// Figure fields summed to produce the counter
    pub fields: Vec<String>,
    /// Divide the sum by resident population
    #[serde(default)]
    pub per_capita: bool,
    /// Warm this counter in critical-tier passes
    #[serde(default)]
    pub critical: bool,
}

/// Logging and monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable structured JSON logging
    pub json_format: bool,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }

    /// Load configuration from a specific file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!("Configuration file not found: {:?}, using defaults", path);
            let mut config = Self::default();
            config.apply_env_overrides()?;
            config.validate()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path).map_err(|e| CounterError::Config {
            message: format!("Failed to read config file {:?}: {}", path, e),
        })?;

        let mut config: Config = toml::from_str(&content).map_err(|e| CounterError::Config {
            message: format!("Failed to parse config file {:?}: {}", path, e),
        })?;

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("COUNTER_CACHE_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("COUNTER_CACHE_PORT") {
            self.server.port = port.parse().map_err(|_| CounterError::Config {
                message: "Invalid port number in COUNTER_CACHE_PORT".to_string(),
            })?;
        }
        if let Ok(db_path) = std::env::var("COUNTER_CACHE_DB_PATH") {
            self.storage.db_path = PathBuf::from(db_path);
        }
        if let Ok(level) = std::env::var("COUNTER_CACHE_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(CounterError::ValidationFailed {
                field: "server.port".to_string(),
                reason: "Port cannot be zero".to_string(),
            });
        }

        if self.cache.stale_marks_per_window == 0 {
            return Err(CounterError::ValidationFailed {
                field: "cache.stale_marks_per_window".to_string(),
                reason: "Ceiling must be at least one mark per window".to_string(),
            });
        }

        if self.cache.rate_limit_window_minutes == 0 {
            return Err(CounterError::ValidationFailed {
                field: "cache.rate_limit_window_minutes".to_string(),
                reason: "Rate-limit window cannot be zero".to_string(),
            });
        }

        for (field, minutes) in [
            ("cache.counter_lock_ttl_minutes", self.cache.counter_lock_ttl_minutes),
            ("cache.warming_lock_ttl_minutes", self.cache.warming_lock_ttl_minutes),
            ("cache.site_wide_lock_ttl_minutes", self.cache.site_wide_lock_ttl_minutes),
        ] {
            if minutes == 0 {
                return Err(CounterError::ValidationFailed {
                    field: field.to_string(),
                    reason: "Lock TTL is mandatory; it backstops crashed holders".to_string(),
                });
            }
        }

        if self.warming.batch_size == 0 {
            return Err(CounterError::ValidationFailed {
                field: "warming.batch_size".to_string(),
                reason: "Batch size must be greater than zero".to_string(),
            });
        }

        for counter in &self.counters {
            if counter.id.is_empty() || counter.id.contains(':') {
                return Err(CounterError::ValidationFailed {
                    field: "counters.id".to_string(),
                    reason: format!("Counter id '{}' must be a non-empty slug without ':'", counter.id),
                });
            }
            if counter.fields.is_empty() {
                return Err(CounterError::ValidationFailed {
                    field: "counters.fields".to_string(),
                    reason: format!("Counter '{}' must sum at least one figure field", counter.id),
                });
            }
        }

        Ok(())
    }

    /// Get configuration as TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CounterError::Config {
            message: format!("Failed to serialize config to TOML: {}", e),
        })
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                enable_cors: true,
            },
            storage: StorageConfig {
                db_path: PathBuf::from("./data/counters.db"),
            },
            cache: CacheSettings {
                fast_cache_ttl_seconds: 300,
                stale_marks_per_window: 5,
                rate_limit_window_minutes: 60,
                session_quiet_window_seconds: 30,
                counter_lock_ttl_minutes: 15,
                warming_lock_ttl_minutes: 20,
                site_wide_lock_ttl_minutes: 30,
            },
            warming: WarmingConfig {
                batch_size: 10,
                batch_pause_ms: 250,
            },
            counters: Vec::new(),
            logging: LoggingConfig {
                level: "info".to_string(),
                json_format: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_lock_ttl_rejected() {
        let mut config = Config::default();
        config.cache.counter_lock_ttl_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_counter_definition_validation() {
        let mut config = Config::default();
        config.counters.push(CounterDefConfig {
            id: "pension:liabilities".to_string(),
            name: "Pension Liabilities".to_string(),
            fields: vec!["pension-liabilities".to_string()],
            per_capita: false,
            critical: false,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let toml = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(
            parsed.cache.stale_marks_per_window,
            config.cache.stale_marks_per_window
        );
    }
}
