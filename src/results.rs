//! # Result Store Module
//!
//! ## Purpose
//! Durable record of previously computed counter values, including the stale
//! flag and the bounded stale-mark counter that rate-limits invalidation.
//!
//! ## Input/Output Specification
//! - **Input**: Computed values from the orchestrator, stale marks from the
//!   invalidation gate
//! - **Output**: Cached counter records, stale/total statistics
//! - **Storage**: One tree in the shared sled database, keyed by canonical key
//!
//! ## Invariants
//! - At most one record per composite key; superseded in place, never deleted
//!   except by administrative purge
//! - A stale mark against an absent key creates a valueless stale placeholder
//! - Stale marks past the per-window ceiling are counted but not applied
//!
//! Reads and marks are unsynchronized; a lost mark race costs at most one
//! extra recomputation.

use crate::errors::{CounterError, Result};
use crate::CounterKey;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Tree name inside the shared database
const RESULTS_TREE: &str = "counter_results";

/// Persisted record of one computed counter value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterResultRecord {
    /// The computed value; `None` for a placeholder created by a stale mark
    /// before any computation has succeeded. Serialized as a string so the
    /// binary codec can round-trip it.
    #[serde(with = "rust_decimal::serde::str_option")]
    pub value: Option<Decimal>,
    /// When the value was last computed
    pub computed_at: DateTime<Utc>,
    /// Underlying figures have changed since the last computation
    pub is_stale: bool,
    /// Stale marks received in the current rate-limit window
    pub stale_marks: u32,
    /// Start of the current rate-limit window
    pub window_started_at: DateTime<Utc>,
    /// Hash of the figures used in the last computation
    pub fingerprint: String,
}

impl CounterResultRecord {
    /// True when the record holds a usable, current value
    pub fn is_fresh(&self) -> bool {
        self.value.is_some() && !self.is_stale
    }
}

/// Outcome of a stale-mark attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleMark {
    /// The record was flagged stale
    Applied,
    /// The per-window ceiling was exceeded; the flag was left untouched
    Suppressed,
    /// No record existed; a stale placeholder was created
    Placeholder,
}

/// Durable key-value store of computed counter values
pub struct ResultStore {
    tree: Arc<sled::Tree>,
}

/// Result store statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultStoreStats {
    pub total_entries: usize,
    pub stale_entries: usize,
}

impl ResultStore {
    /// Open the results tree on the shared database
    pub fn new(db: Arc<sled::Db>) -> Result<Self> {
        let tree = db.open_tree(RESULTS_TREE).map_err(|e| CounterError::Storage {
            operation: "open results tree".to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self { tree: Arc::new(tree) })
    }

    /// Retrieve the record for a key
    pub fn get(&self, key: &CounterKey) -> Result<Option<CounterResultRecord>> {
        match self.tree.get(key.cache_key().as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Write a freshly computed value, clearing the stale flag.
    ///
    /// Rate-limit bookkeeping survives the rewrite: the window rolls on its
    /// own schedule, not on recomputation.
    pub fn put_fresh(
        &self,
        key: &CounterKey,
        value: Decimal,
        fingerprint: String,
    ) -> Result<CounterResultRecord> {
        let now = Utc::now();
        let previous = self.get(key)?;

        let record = CounterResultRecord {
            value: Some(value),
            computed_at: now,
            is_stale: false,
            stale_marks: previous.as_ref().map_or(0, |r| r.stale_marks),
            window_started_at: previous.as_ref().map_or(now, |r| r.window_started_at),
            fingerprint,
        };

        self.persist(key, &record)?;
        Ok(record)
    }

    /// Register an invalidation signal for a key.
    ///
    /// Increments the stale-mark counter (resetting it when the rolling window
    /// has passed) and flags the record stale unless the ceiling for the
    /// current window has already been reached.
    pub fn mark_stale(
        &self,
        key: &CounterKey,
        ceiling: u32,
        window: chrono::Duration,
    ) -> Result<StaleMark> {
        let now = Utc::now();
        let existing = self.get(key)?;
        let was_absent = existing.is_none();

        let mut record = existing.unwrap_or(CounterResultRecord {
            value: None,
            computed_at: now,
            is_stale: false,
            stale_marks: 0,
            window_started_at: now,
            fingerprint: String::new(),
        });

        if now - record.window_started_at >= window {
            record.stale_marks = 0;
            record.window_started_at = now;
        }

        record.stale_marks += 1;

        let outcome = if record.stale_marks > ceiling {
            StaleMark::Suppressed
        } else {
            record.is_stale = true;
            if was_absent {
                StaleMark::Placeholder
            } else {
                StaleMark::Applied
            }
        };

        self.persist(key, &record)?;
        Ok(outcome)
    }

    /// Administrative purge of a single entry
    pub fn remove(&self, key: &CounterKey) -> Result<bool> {
        Ok(self.tree.remove(key.cache_key().as_bytes())?.is_some())
    }

    /// Count total and stale entries
    pub fn get_stats(&self) -> Result<ResultStoreStats> {
        let mut total = 0;
        let mut stale = 0;

        for result in self.tree.iter() {
            let (_, value) = result?;
            let record: CounterResultRecord = bincode::deserialize(&value)?;
            total += 1;
            if record.is_stale {
                stale += 1;
            }
        }

        Ok(ResultStoreStats {
            total_entries: total,
            stale_entries: stale,
        })
    }

    fn persist(&self, key: &CounterKey, record: &CounterResultRecord) -> Result<()> {
        let value = bincode::serialize(record)?;
        self.tree.insert(key.cache_key().as_bytes(), value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, ResultStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("results.db")).unwrap();
        let store = ResultStore::new(Arc::new(db)).unwrap();
        (dir, store)
    }

    fn key() -> CounterKey {
        CounterKey::site_wide("total-debt", Some(2024))
    }

    #[test]
    fn test_put_fresh_clears_stale() {
        let (_dir, store) = open_store();
        let window = chrono::Duration::hours(1);

        store.mark_stale(&key(), 5, window).unwrap();
        let record = store
            .put_fresh(&key(), Decimal::new(100, 0), "fp".to_string())
            .unwrap();

        assert!(record.is_fresh());
        assert_eq!(record.stale_marks, 1);
    }

    #[test]
    fn test_decimal_values_survive_storage() {
        let (_dir, store) = open_store();
        // Fractional pennies exercise the full scale of the representation
        let value = Decimal::new(123_456_789_012, 4);

        store.put_fresh(&key(), value, "fp".to_string()).unwrap();
        let record = store.get(&key()).unwrap().unwrap();

        assert_eq!(record.value, Some(value));
    }

    #[test]
    fn test_mark_on_absent_key_creates_placeholder() {
        let (_dir, store) = open_store();
        let outcome = store
            .mark_stale(&key(), 5, chrono::Duration::hours(1))
            .unwrap();

        assert_eq!(outcome, StaleMark::Placeholder);
        let record = store.get(&key()).unwrap().unwrap();
        assert!(record.is_stale);
        assert!(record.value.is_none());
    }

    #[test]
    fn test_ceiling_suppresses_marks() {
        let (_dir, store) = open_store();
        let window = chrono::Duration::hours(1);

        store
            .put_fresh(&key(), Decimal::new(100, 0), "fp".to_string())
            .unwrap();

        for _ in 0..3 {
            assert_eq!(store.mark_stale(&key(), 3, window).unwrap(), StaleMark::Applied);
        }
        assert_eq!(
            store.mark_stale(&key(), 3, window).unwrap(),
            StaleMark::Suppressed
        );

        // A recomputation clears the flag; suppressed marks must not re-flip it
        store
            .put_fresh(&key(), Decimal::new(200, 0), "fp2".to_string())
            .unwrap();
        assert_eq!(
            store.mark_stale(&key(), 3, window).unwrap(),
            StaleMark::Suppressed
        );
        assert!(store.get(&key()).unwrap().unwrap().is_fresh());
    }

    #[test]
    fn test_window_rollover_resets_counter() {
        let (_dir, store) = open_store();
        let window = chrono::Duration::zero();

        store
            .put_fresh(&key(), Decimal::new(100, 0), "fp".to_string())
            .unwrap();

        // Zero-length window: every mark starts a fresh window
        for _ in 0..10 {
            assert_eq!(store.mark_stale(&key(), 1, window).unwrap(), StaleMark::Applied);
        }
    }
}
