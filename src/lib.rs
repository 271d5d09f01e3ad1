//! # Council Counter Cache Service
//!
//! ## Overview
//! This library implements the counter cache and invalidation subsystem for a
//! council financial-transparency site. Named aggregate statistics ("counters",
//! e.g. total debt or debt per capita) are computed over stored financial
//! figures, cached in three tiers, invalidated with rate limiting when figures
//! are edited, and pre-warmed on an external schedule.
//!
//! ## Architecture
//! The system is composed of several key modules:
//! - `storage`: Persistent store for councils and financial figures
//! - `results`: Durable record of previously computed counter values
//! - `fast_cache`: Volatile low-latency cache substrate
//! - `lock`: Distributed locks over the volatile substrate
//! - `calculator`: Aggregate computation over stored figures
//! - `orchestrator`: Three-tier read path with locked recomputation
//! - `invalidation`: Stale marking with rate limits and session batching
//! - `warming`: Scheduled cache warming passes
//! - `api`: REST endpoints for counter reads, edits, and administration
//! - `config`: Configuration management and settings
//! - `errors`: Centralized error handling and types
//!
//! ## Input/Output Specification
//! - **Input**: Financial figure edits, counter read requests, warming triggers
//! - **Output**: Computed counter values or a "pending" outcome, never a stall
//! - **Consistency**: Last-write-wins; at most one recomputation per key at a time
//!
//! ## Usage
//! ```rust,no_run
//! use council_counters::{config::Config, storage::FigureStore, CounterKey};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.toml")?;
//!     let storage = FigureStore::new(config.storage.clone()).await?;
//!     let key = CounterKey::site_wide("total-debt", Some(2024));
//!     println!("looking up {}", key.cache_key());
//!     Ok(())
//! }
//! ```

// Core modules
pub mod config;
pub mod errors;
pub mod storage;
pub mod results;
pub mod fast_cache;
pub mod lock;
pub mod calculator;
pub mod orchestrator;
pub mod invalidation;
pub mod warming;
pub mod api;

// Utilities
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use errors::{CounterError, Result};
pub use orchestrator::CounterCache;

// Core types used throughout the system
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Council identifier: a URL-safe slug such as `"barnet"`
pub type CouncilSlug = String;

/// Composite identity of a counter value.
///
/// `council = None` means site-wide (across every council); `year = None`
/// means the latest available year.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    /// Counter identifier, e.g. `"total-debt"`
    pub counter_id: String,
    /// Council scope; `None` means site-wide
    pub council: Option<CouncilSlug>,
    /// Year label; `None` means latest
    pub year: Option<i32>,
}

/// Scope segment used in canonical keys for site-wide counters
const SCOPE_ALL: &str = "all";
/// Year segment used in canonical keys for "latest"
const YEAR_LATEST: &str = "latest";

impl CounterKey {
    /// Key for a single council's counter
    pub fn for_council(
        counter_id: impl Into<String>,
        council: impl Into<String>,
        year: Option<i32>,
    ) -> Self {
        Self {
            counter_id: counter_id.into(),
            council: Some(council.into()),
            year,
        }
    }

    /// Key for a site-wide counter
    pub fn site_wide(counter_id: impl Into<String>, year: Option<i32>) -> Self {
        Self {
            counter_id: counter_id.into(),
            council: None,
            year,
        }
    }

    /// Canonical string form used for cache, lock, and store keys,
    /// e.g. `"total-debt:all:2024"` or `"total-debt:barnet:latest"`
    pub fn cache_key(&self) -> String {
        let scope = self.council.as_deref().unwrap_or(SCOPE_ALL);
        match self.year {
            Some(year) => format!("{}:{}:{}", self.counter_id, scope, year),
            None => format!("{}:{}:{}", self.counter_id, scope, YEAR_LATEST),
        }
    }

    /// Parse a canonical key string back into its components.
    ///
    /// Used by the administrative surface to address individual entries.
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.split(':').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(CounterError::InvalidKey {
                key: key.to_string(),
                reason: "expected <counter>:<council|all>:<year|latest>".to_string(),
            });
        }

        let council = if parts[1] == SCOPE_ALL {
            None
        } else {
            Some(parts[1].to_string())
        };
        let year = if parts[2] == YEAR_LATEST {
            None
        } else {
            Some(parts[2].parse().map_err(|_| CounterError::InvalidKey {
                key: key.to_string(),
                reason: format!("invalid year segment '{}'", parts[2]),
            })?)
        };

        Ok(Self {
            counter_id: parts[0].to_string(),
            council,
            year,
        })
    }

    /// True when the key covers every council
    pub fn is_site_wide(&self) -> bool {
        self.council.is_none()
    }

    /// True when a slug is usable as a council scope: non-empty, free of the
    /// key delimiter, and not the reserved site-wide segment. A council named
    /// `"all"` would collide with the site-wide cache, lock, and store keys.
    pub fn valid_slug(slug: &str) -> bool {
        !slug.is_empty() && slug != SCOPE_ALL && !slug.contains(':')
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cache_key())
    }
}

/// A successfully computed counter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedCounter {
    /// The aggregate value. Serialized as a string so the binary codec used
    /// by the cache tiers can round-trip it.
    #[serde(with = "rust_decimal::serde::str")]
    pub value: Decimal,
    /// When the value was computed
    pub computed_at: DateTime<Utc>,
    /// Hash of the figures that went into the computation
    pub fingerprint: String,
}

/// Outcome of a counter lookup.
///
/// Replaces the numeric "not available" sentinel: callers can never confuse
/// "still calculating" with a legitimate value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CounterOutcome {
    /// A definite value is available
    Ready(ComputedCounter),
    /// The value is being (or still needs to be) computed
    Pending {
        /// Last known value, if a stale entry exists; shown opportunistically
        stale_value: Option<Decimal>,
    },
}

impl CounterOutcome {
    /// True when a definite value is available
    pub fn is_ready(&self) -> bool {
        matches!(self, CounterOutcome::Ready(_))
    }
}

/// Warming priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmMode {
    /// Site-wide counters only: the homepage figures
    Critical,
    /// Site-wide plus every council's latest-year counters
    Comprehensive,
}

impl std::str::FromStr for WarmMode {
    type Err = CounterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "critical" => Ok(WarmMode::Critical),
            "comprehensive" => Ok(WarmMode::Comprehensive),
            other => Err(CounterError::ValidationFailed {
                field: "mode".to_string(),
                reason: format!("unknown warm mode '{}'", other),
            }),
        }
    }
}

impl fmt::Display for WarmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarmMode::Critical => write!(f, "critical"),
            WarmMode::Comprehensive => write!(f, "comprehensive"),
        }
    }
}

/// A single stored financial figure for one council, year, and field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialFigure {
    /// Council the figure belongs to
    pub council: CouncilSlug,
    /// Financial year the figure covers
    pub year: i32,
    /// Figure field, e.g. `"current-liabilities"`
    pub field: String,
    /// Monetary value, serialized as a string for the binary codec
    #[serde(with = "rust_decimal::serde::str")]
    pub value: Decimal,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Council record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Council {
    /// URL-safe identifier
    pub slug: CouncilSlug,
    /// Display name
    pub name: String,
    /// Resident population, used for per-capita counters
    pub population: Option<u64>,
}

/// Application state shared across components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Config>,
    pub storage: Arc<storage::FigureStore>,
    pub registry: Arc<calculator::CounterRegistry>,
    pub counters: Arc<orchestrator::CounterCache>,
    pub gate: Arc<invalidation::InvalidationGate>,
    pub warming: Arc<warming::WarmingScheduler>,
}
