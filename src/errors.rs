//! # Error Handling Module
//!
//! ## Purpose
//! Centralized error handling for the counter cache service, providing
//! structured error types and conversion utilities for all system components.
//!
//! ## Input/Output Specification
//! - **Input**: Error conditions from storage, cache, calculation, and API layers
//! - **Output**: Structured error types with context and error chains
//! - **Error Categories**: Configuration, Storage, Cache, Calculation, API
//!
//! ## Propagation Policy
//! Transient infrastructure errors are absorbed at the lowest layer that can
//! still make progress (the orchestrator swallows volatile-cache failures and
//! falls back to the durable store); calculation errors are surfaced to the
//! caller since no other component can recover a missing value.

use thiserror::Error;

/// Result type used throughout the application
pub type Result<T> = std::result::Result<T, CounterError>;

/// Error types for the counter cache service
#[derive(Debug, Error)]
pub enum CounterError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation failed for field '{field}': {reason}")]
    ValidationFailed { field: String, reason: String },

    /// Database connection errors
    #[error("Database connection failed: {db_path} - {reason}")]
    DatabaseConnectionFailed { db_path: String, reason: String },

    /// Database operation errors
    #[error("Storage error during {operation}: {reason}")]
    Storage { operation: String, reason: String },

    /// Serialization/deserialization errors
    #[error("Serialization failed for {data_type}: {reason}")]
    SerializationFailed { data_type: String, reason: String },

    /// Volatile cache substrate unavailable
    #[error("Volatile cache unavailable: {details}")]
    CacheUnavailable { details: String },

    /// Counter computation failure
    #[error("Calculation of '{counter}' failed: {reason}")]
    CalculationFailed { counter: String, reason: String },

    /// Counter id not present in the registry
    #[error("Unknown counter: {counter_id}")]
    UnknownCounter { counter_id: String },

    /// Council not present in storage
    #[error("Council not found: {slug}")]
    CouncilNotFound { slug: String },

    /// Malformed composite counter key
    #[error("Invalid counter key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Internal system errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CounterError {
    /// Check if the error is recoverable (the operation can be retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CounterError::CacheUnavailable { .. }
                | CounterError::DatabaseConnectionFailed { .. }
                | CounterError::Storage { .. }
        )
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            CounterError::Config { .. } | CounterError::ValidationFailed { .. } => "configuration",
            CounterError::DatabaseConnectionFailed { .. }
            | CounterError::Storage { .. }
            | CounterError::SerializationFailed { .. } => "storage",
            CounterError::CacheUnavailable { .. } => "cache",
            CounterError::CalculationFailed { .. }
            | CounterError::UnknownCounter { .. }
            | CounterError::CouncilNotFound { .. } => "calculation",
            CounterError::InvalidKey { .. } => "api",
            CounterError::Internal { .. } => "generic",
        }
    }
}

// Conversion from common error types
impl From<std::io::Error> for CounterError {
    fn from(err: std::io::Error) -> Self {
        CounterError::Internal {
            message: format!("IO error: {}", err),
        }
    }
}

impl From<sled::Error> for CounterError {
    fn from(err: sled::Error) -> Self {
        CounterError::Storage {
            operation: "sled".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<bincode::Error> for CounterError {
    fn from(err: bincode::Error) -> Self {
        CounterError::SerializationFailed {
            data_type: "binary".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CounterError {
    fn from(err: serde_json::Error) -> Self {
        CounterError::SerializationFailed {
            data_type: "json".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for CounterError {
    fn from(err: toml::de::Error) -> Self {
        CounterError::Config {
            message: format!("TOML parse error: {}", err),
        }
    }
}
