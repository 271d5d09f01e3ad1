//! # Invalidation Gate Module
//!
//! ## Purpose
//! Receives change notifications after financial-figure edits commit and marks
//! the affected counter results stale, protected by a per-key rate limit and
//! coalesced per editing session so bulk entry does not trigger invalidation
//! storms.
//!
//! ## Input/Output Specification
//! - **Input**: One `FigureChange` per durably committed logical edit
//! - **Output**: Stale marks on the result store, fast-cache evictions
//! - **Never**: Triggers recomputation; that happens lazily on the next read
//!   or proactively via warming
//!
//! ## Key Features
//! - One edit fans out to council/site-wide and year/latest key variants
//! - Stale marks above the per-window ceiling are counted and suppressed
//! - Edits carrying an explicit session id are batched and flushed once the
//!   session goes quiet

use crate::config::CacheSettings;
use crate::errors::Result;
use crate::orchestrator::CounterCache;
use crate::results::{ResultStore, StaleMark};
use crate::{CounterKey, CouncilSlug};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// A change notification for one committed figure edit
#[derive(Debug, Clone)]
pub struct FigureChange {
    /// Council whose figure changed
    pub council: CouncilSlug,
    /// Year the figure covers
    pub year: i32,
    /// Counters whose inputs include the edited field
    pub counter_ids: Vec<String>,
    /// Explicit editing-session identifier for batched invalidation
    pub session: Option<String>,
}

/// Pending invalidations for one editing session
struct SessionBatch {
    keys: HashSet<CounterKey>,
    last_edit: Instant,
}

/// Invalidation statistics for the admin surface
#[derive(Debug, Clone, Default, Serialize)]
pub struct GateStats {
    pub marks_applied: u64,
    pub marks_suppressed: u64,
    pub placeholders_created: u64,
    pub keys_batched: u64,
    pub sessions_flushed: u64,
}

/// Gate between figure edits and the result store
pub struct InvalidationGate {
    settings: CacheSettings,
    results: Arc<ResultStore>,
    cache: Arc<CounterCache>,
    sessions: DashMap<String, SessionBatch>,
    stats: Arc<RwLock<GateStats>>,
}

impl InvalidationGate {
    pub fn new(
        settings: CacheSettings,
        results: Arc<ResultStore>,
        cache: Arc<CounterCache>,
    ) -> Self {
        Self {
            settings,
            results,
            cache,
            sessions: DashMap::new(),
            stats: Arc::new(RwLock::new(GateStats::default())),
        }
    }

    /// Counter keys affected by an edit: the council's year and latest
    /// entries, plus the site-wide year and latest entries.
    fn affected_keys(change: &FigureChange) -> Vec<CounterKey> {
        let mut keys = Vec::with_capacity(change.counter_ids.len() * 4);
        for counter_id in &change.counter_ids {
            keys.push(CounterKey::for_council(
                counter_id.clone(),
                change.council.clone(),
                Some(change.year),
            ));
            keys.push(CounterKey::for_council(
                counter_id.clone(),
                change.council.clone(),
                None,
            ));
            keys.push(CounterKey::site_wide(counter_id.clone(), Some(change.year)));
            keys.push(CounterKey::site_wide(counter_id.clone(), None));
        }
        keys
    }

    /// Register a committed edit.
    ///
    /// Must be called exactly once per logical edit, after the underlying
    /// write is durable; an edit that can still roll back must not invalidate.
    pub async fn notify_changed(&self, change: FigureChange) -> Result<()> {
        // Opportunistic housekeeping while we are here anyway
        self.flush_idle_sessions().await?;

        let keys = Self::affected_keys(&change);

        match &change.session {
            Some(session_id) => {
                let mut batch = self
                    .sessions
                    .entry(session_id.clone())
                    .or_insert_with(|| SessionBatch {
                        keys: HashSet::new(),
                        last_edit: Instant::now(),
                    });
                batch.last_edit = Instant::now();
                let added = keys.len();
                batch.keys.extend(keys);
                drop(batch);

                self.stats.write().await.keys_batched += added as u64;
                tracing::debug!(
                    "Batched {} invalidation keys for session '{}'",
                    added,
                    session_id
                );
            }
            None => {
                self.apply_marks(keys).await?;
            }
        }

        Ok(())
    }

    /// Flush one session's batched invalidations immediately.
    /// Returns the number of keys marked.
    pub async fn flush_session(&self, session_id: &str) -> Result<usize> {
        let Some((_, batch)) = self.sessions.remove(session_id) else {
            return Ok(0);
        };

        let count = batch.keys.len();
        self.apply_marks(batch.keys.into_iter().collect()).await?;
        self.stats.write().await.sessions_flushed += 1;

        tracing::debug!("Flushed session '{}' ({} keys)", session_id, count);
        Ok(count)
    }

    /// Flush sessions that have gone quiet. Returns the number flushed.
    pub async fn flush_idle_sessions(&self) -> Result<usize> {
        let quiet = self.settings.session_quiet_window();
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().last_edit.elapsed() >= quiet)
            .map(|entry| entry.key().clone())
            .collect();

        let mut flushed = 0;
        for session_id in idle {
            if self.flush_session(&session_id).await? > 0 {
                flushed += 1;
            }
        }

        Ok(flushed)
    }

    /// Mark each key stale, subject to the per-window ceiling, evicting the
    /// fast-cache entry for every applied mark.
    async fn apply_marks(&self, keys: Vec<CounterKey>) -> Result<()> {
        let ceiling = self.settings.stale_marks_per_window;
        let window = self.settings.rate_limit_window();

        for key in keys {
            match self.results.mark_stale(&key, ceiling, window)? {
                StaleMark::Applied => {
                    self.cache.evict_fast(&key).await;
                    self.stats.write().await.marks_applied += 1;
                    tracing::debug!("Marked {} stale", key);
                }
                StaleMark::Placeholder => {
                    self.stats.write().await.placeholders_created += 1;
                    tracing::debug!("Created stale placeholder for {}", key);
                }
                StaleMark::Suppressed => {
                    // By policy: a storm of edits must not force recomputation
                    self.stats.write().await.marks_suppressed += 1;
                    tracing::debug!("Suppressed stale mark for {} (rate limit)", key);
                }
            }
        }

        Ok(())
    }

    /// Number of sessions currently holding batched invalidations
    pub fn pending_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Invalidation statistics
    pub async fn get_stats(&self) -> GateStats {
        self.stats.read().await.clone()
    }
}
