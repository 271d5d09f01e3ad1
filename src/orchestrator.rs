//! # Cache Orchestrator Module
//!
//! ## Purpose
//! The read-path façade over the three cache tiers: volatile fast cache,
//! durable result store, and live recomputation guarded by a distributed lock.
//!
//! ## Input/Output Specification
//! - **Input**: Counter key plus an `allow_expensive` policy flag
//! - **Output**: `Ready(value)` or `Pending`; a caller is never blocked behind
//!   another caller's computation
//! - **Write path**: Successful recomputations write through both stores
//!
//! ## Failure Policy
//! - Volatile-cache errors are swallowed here and degrade to the durable store
//! - Lock contention is a normal outcome producing `Pending`, never an error
//! - Calculator failures propagate, but only after the lock is released

use crate::calculator::{CounterCalculator, CounterComputation};
use crate::config::CacheSettings;
use crate::errors::Result;
use crate::fast_cache::VolatileStore;
use crate::lock::LockManager;
use crate::results::{CounterResultRecord, ResultStore, ResultStoreStats};
use crate::{ComputedCounter, CounterKey, CounterOutcome};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Namespace prefix for cached counter payloads on the volatile substrate
const VALUE_PREFIX: &str = "counter:";
/// Namespace prefix for recomputation locks
const RECOMPUTE_LOCK_PREFIX: &str = "recompute:";

/// Cache hit/miss statistics for the admin surface
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub fast_hits: u64,
    pub store_hits: u64,
    pub pending_returns: u64,
    pub recomputations: u64,
    pub lock_conflicts: u64,
    pub calculation_failures: u64,
    pub fast_cache_errors: u64,
}

/// Three-tier counter cache
pub struct CounterCache {
    settings: CacheSettings,
    fast: Arc<dyn VolatileStore>,
    results: Arc<ResultStore>,
    calculator: Arc<dyn CounterCalculator>,
    locks: Arc<LockManager>,
    stats: Arc<RwLock<CacheStats>>,
}

impl CounterCache {
    pub fn new(
        settings: CacheSettings,
        fast: Arc<dyn VolatileStore>,
        results: Arc<ResultStore>,
        calculator: Arc<dyn CounterCalculator>,
        locks: Arc<LockManager>,
    ) -> Self {
        Self {
            settings,
            fast,
            results,
            calculator,
            locks,
            stats: Arc::new(RwLock::new(CacheStats::default())),
        }
    }

    fn value_key(key: &CounterKey) -> String {
        format!("{}{}", VALUE_PREFIX, key.cache_key())
    }

    /// Lock name for a key's recomputation family
    pub fn lock_name(key: &CounterKey) -> String {
        format!("{}{}", RECOMPUTE_LOCK_PREFIX, key.cache_key())
    }

    /// Look up a counter value.
    ///
    /// With `allow_expensive = false` (page-render paths) the call never
    /// computes anything: a miss or stale entry yields `Pending`. With
    /// `allow_expensive = true` a miss triggers a locked recomputation unless
    /// another computation for the same key is already in flight.
    pub async fn get(&self, key: &CounterKey, allow_expensive: bool) -> Result<CounterOutcome> {
        // Tier 1: volatile fast cache
        if let Some(counter) = self.fast_lookup(key).await {
            self.stats.write().await.fast_hits += 1;
            return Ok(CounterOutcome::Ready(counter));
        }

        // Tier 2: durable result store
        let record = self.results.get(key)?;
        if let Some(ref record) = record {
            if record.is_fresh() {
                let counter = ComputedCounter {
                    // is_fresh() guarantees the value is present
                    value: record.value.unwrap_or_default(),
                    computed_at: record.computed_at,
                    fingerprint: record.fingerprint.clone(),
                };
                self.fast_store(key, &counter).await;
                self.stats.write().await.store_hits += 1;
                return Ok(CounterOutcome::Ready(counter));
            }
        }
        let stale_value = record.as_ref().and_then(|r| r.value);

        // Tier 3: live recomputation, never on a non-blocking path
        if !allow_expensive {
            self.stats.write().await.pending_returns += 1;
            return Ok(CounterOutcome::Pending { stale_value });
        }

        let ttl = if key.is_site_wide() {
            self.settings.site_wide_lock_ttl()
        } else {
            self.settings.counter_lock_ttl()
        };

        let token = match self.locks.try_acquire(&Self::lock_name(key), ttl).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                // Another computation is in flight; do not wait for it
                tracing::debug!("Recompute of {} already in flight", key);
                let mut stats = self.stats.write().await;
                stats.lock_conflicts += 1;
                stats.pending_returns += 1;
                return Ok(CounterOutcome::Pending { stale_value });
            }
            Err(e) if e.is_recoverable() => {
                // Lock substrate down: refuse to recompute without exclusion
                tracing::warn!("Lock substrate unavailable for {}: {}", key, e);
                let mut stats = self.stats.write().await;
                stats.fast_cache_errors += 1;
                stats.pending_returns += 1;
                return Ok(CounterOutcome::Pending { stale_value });
            }
            Err(e) => return Err(e),
        };

        // The write-through must finish while the lock is still held, or a
        // slow computation could overwrite a newer value stored by the next
        // holder. The result is captured so release runs on every exit path,
        // including calculator failure, before `?` gets a chance to run.
        let outcome = match self.calculator.compute(key).await {
            Ok(computation) => self.store_computation(key, record.as_ref(), computation).await,
            Err(e) => {
                self.stats.write().await.calculation_failures += 1;
                tracing::error!("Recompute of {} failed: {}", key, e);
                Err(e)
            }
        };
        if let Err(e) = self.locks.release(token).await {
            tracing::warn!("Failed to release recompute lock for {}: {}", key, e);
        }
        let counter = outcome?;

        self.stats.write().await.recomputations += 1;
        tracing::info!("Recomputed {} = {}", key, counter.value);

        Ok(CounterOutcome::Ready(counter))
    }

    /// Write a computation through both stores. Runs under the recompute lock.
    async fn store_computation(
        &self,
        key: &CounterKey,
        previous: Option<&CounterResultRecord>,
        computation: CounterComputation,
    ) -> Result<ComputedCounter> {
        if let Some(previous) = previous {
            if previous.is_stale && previous.fingerprint == computation.fingerprint {
                tracing::debug!("{} was marked stale but its inputs are unchanged", key);
            }
        }

        let stored = self
            .results
            .put_fresh(key, computation.value, computation.fingerprint)?;
        let counter = ComputedCounter {
            value: computation.value,
            computed_at: stored.computed_at,
            fingerprint: stored.fingerprint,
        };
        self.fast_store(key, &counter).await;

        Ok(counter)
    }

    /// Fast-cache read; any failure degrades to a miss
    async fn fast_lookup(&self, key: &CounterKey) -> Option<ComputedCounter> {
        match self.fast.get(&Self::value_key(key)).await {
            Ok(Some(bytes)) => match bincode::deserialize(&bytes) {
                Ok(counter) => Some(counter),
                Err(e) => {
                    tracing::warn!("Corrupt fast-cache entry for {}: {}", key, e);
                    let _ = self.fast.remove(&Self::value_key(key)).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                // Not fatal: the durable store still answers
                tracing::warn!("Fast cache unavailable for {}: {}", key, e);
                self.stats.write().await.fast_cache_errors += 1;
                None
            }
        }
    }

    /// Fast-cache write; failures are logged and ignored
    async fn fast_store(&self, key: &CounterKey, counter: &ComputedCounter) {
        let bytes = match bincode::serialize(counter) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to serialize counter {}: {}", key, e);
                return;
            }
        };

        if let Err(e) = self
            .fast
            .set(
                &Self::value_key(key),
                bytes,
                Some(self.settings.fast_cache_ttl()),
            )
            .await
        {
            tracing::warn!("Failed to populate fast cache for {}: {}", key, e);
        }
    }

    /// Evict a key's fast-cache entry; used by the invalidation gate
    pub async fn evict_fast(&self, key: &CounterKey) {
        if let Err(e) = self.fast.remove(&Self::value_key(key)).await {
            tracing::warn!("Failed to evict fast-cache entry for {}: {}", key, e);
        }
    }

    /// Administrative purge: drop a key from both stores
    pub async fn purge(&self, key: &CounterKey) -> Result<bool> {
        self.evict_fast(key).await;
        let removed = self.results.remove(key)?;
        if removed {
            tracing::info!("Purged counter entry {}", key);
        }
        Ok(removed)
    }

    /// Administrative lock clear (full lock name, e.g. `recompute:<key>`)
    pub async fn clear_lock(&self, name: &str) -> Result<bool> {
        self.locks.force_clear(name).await
    }

    /// Hit/miss statistics
    pub async fn get_stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    /// Durable result-store statistics
    pub fn result_stats(&self) -> Result<ResultStoreStats> {
        self.results.get_stats()
    }
}
