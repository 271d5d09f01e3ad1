//! # Warming Scheduler Module
//!
//! ## Purpose
//! Pre-computes a prioritized set of counters through the orchestrator so
//! user-facing reads usually hit a warm cache. Invoked by an external
//! cron-style trigger; this module never schedules itself.
//!
//! ## Input/Output Specification
//! - **Input**: A warm mode (critical or comprehensive tier)
//! - **Output**: A pass report, or `AlreadyRunning` when another pass holds
//!   the overlap guard
//! - **Batching**: Targets are warmed in small batches with a storage health
//!   check between batches; individual failures never abort the pass
//!
//! A pass holds a single coarse lock with a longer TTL than any one
//! recomputation. Nested lock conflicts inside the pass surface as `Pending`
//! outcomes and are simply counted.

use crate::calculator::CounterRegistry;
use crate::config::{CacheSettings, WarmingConfig};
use crate::errors::Result;
use crate::invalidation::InvalidationGate;
use crate::lock::LockManager;
use crate::orchestrator::CounterCache;
use crate::storage::FigureStore;
use crate::{CounterKey, CounterOutcome, WarmMode};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Name of the pass-level overlap guard
pub const WARMING_LOCK: &str = "warming";

/// Outcome of a warming invocation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WarmingOutcome {
    /// The pass ran; counts are in the report
    Completed(WarmingReport),
    /// Another pass holds the overlap guard; nothing was recomputed
    AlreadyRunning,
}

/// Counts from one warming pass
#[derive(Debug, Clone, Serialize)]
pub struct WarmingReport {
    pub mode: WarmMode,
    pub targets: usize,
    pub warmed: usize,
    pub pending: usize,
    pub failed: usize,
    /// True when a health check failed and the pass stopped early
    pub aborted_early: bool,
    pub duration_ms: u64,
}

/// Scheduled cache warmer
pub struct WarmingScheduler {
    settings: CacheSettings,
    warming: WarmingConfig,
    registry: Arc<CounterRegistry>,
    storage: Arc<FigureStore>,
    cache: Arc<CounterCache>,
    gate: Arc<InvalidationGate>,
    locks: Arc<LockManager>,
}

impl WarmingScheduler {
    pub fn new(
        settings: CacheSettings,
        warming: WarmingConfig,
        registry: Arc<CounterRegistry>,
        storage: Arc<FigureStore>,
        cache: Arc<CounterCache>,
        gate: Arc<InvalidationGate>,
        locks: Arc<LockManager>,
    ) -> Self {
        Self {
            settings,
            warming,
            registry,
            storage,
            cache,
            gate,
            locks,
        }
    }

    /// Run one warming pass.
    ///
    /// Returns `AlreadyRunning` (not an error) when another pass is in
    /// flight; a forced run clears the guard first via [`Self::force_run`].
    pub async fn run(&self, mode: WarmMode) -> Result<WarmingOutcome> {
        let Some(guard) = self
            .locks
            .try_acquire(WARMING_LOCK, self.settings.warming_lock_ttl())
            .await?
        else {
            tracing::info!("Warming pass ({}) skipped: another pass is in flight", mode);
            return Ok(WarmingOutcome::AlreadyRunning);
        };

        let result = self.execute_pass(mode).await;
        if let Err(e) = self.locks.release(guard).await {
            tracing::warn!("Failed to release warming lock: {}", e);
        }

        result.map(WarmingOutcome::Completed)
    }

    /// Clear the overlap guard and run. Incident recovery only.
    pub async fn force_run(&self, mode: WarmMode) -> Result<WarmingOutcome> {
        if self.locks.force_clear(WARMING_LOCK).await? {
            tracing::warn!("Warming overlap guard cleared by force run");
        }
        self.run(mode).await
    }

    async fn execute_pass(&self, mode: WarmMode) -> Result<WarmingReport> {
        let timer = crate::utils::Timer::new("warming pass");

        // Bulk-edit sessions that have gone quiet should be visible to this pass
        let flushed = self.gate.flush_idle_sessions().await?;
        if flushed > 0 {
            tracing::debug!("Flushed {} idle editing sessions before warming", flushed);
        }

        let targets = self.target_keys(mode).await?;
        tracing::info!(
            "Warming pass ({}) starting: {} targets in batches of {}",
            mode,
            targets.len(),
            self.warming.batch_size
        );

        let mut report = WarmingReport {
            mode,
            targets: targets.len(),
            warmed: 0,
            pending: 0,
            failed: 0,
            aborted_early: false,
            duration_ms: 0,
        };

        for (batch_index, batch) in targets.chunks(self.warming.batch_size).enumerate() {
            if batch_index > 0 {
                // Transient infrastructure trouble should stop the pass, not
                // hammer a struggling store
                if let Err(e) = self.storage.health_check().await {
                    tracing::warn!("Warming pass stopping early, storage unhealthy: {}", e);
                    report.aborted_early = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(self.warming.batch_pause_ms)).await;
            }

            let results = join_all(batch.iter().map(|key| self.cache.get(key, true))).await;

            for (key, result) in batch.iter().zip(results) {
                match result {
                    Ok(CounterOutcome::Ready(_)) => report.warmed += 1,
                    Ok(CounterOutcome::Pending { .. }) => {
                        // A nested lock conflict; another caller is computing it
                        tracing::debug!("Warming target {} pending elsewhere", key);
                        report.pending += 1;
                    }
                    Err(e) => {
                        tracing::warn!("Warming target {} failed: {}", key, e);
                        report.failed += 1;
                    }
                }
            }
        }

        report.duration_ms = timer.stop();
        tracing::info!(
            "Warming pass ({}) finished: {}/{} warmed, {} pending, {} failed",
            mode,
            report.warmed,
            report.targets,
            report.pending,
            report.failed
        );

        Ok(report)
    }

    /// The target key set for a mode.
    ///
    /// Critical: site-wide latest and latest-year entries for critical-tier
    /// counters. Comprehensive: every counter, site-wide and per council.
    async fn target_keys(&self, mode: WarmMode) -> Result<Vec<CounterKey>> {
        let latest_year = self.storage.latest_year().await?;
        let mut keys = Vec::new();

        for def in self.registry.critical() {
            keys.push(CounterKey::site_wide(def.id.clone(), None));
            if let Some(year) = latest_year {
                keys.push(CounterKey::site_wide(def.id.clone(), Some(year)));
            }
        }

        if mode == WarmMode::Comprehensive {
            for def in self.registry.all() {
                if !def.critical {
                    keys.push(CounterKey::site_wide(def.id.clone(), None));
                }
            }

            let councils = self.storage.list_councils().await?;
            for def in self.registry.all() {
                for council in &councils {
                    keys.push(CounterKey::for_council(
                        def.id.clone(),
                        council.slug.clone(),
                        None,
                    ));
                }
            }
        }

        Ok(keys)
    }
}
