//! Integration tests for the counter cache: the three-tier read path, lock
//! discipline, invalidation rate limiting, and warming overlap behavior.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use council_counters::calculator::{
    CounterCalculator, CounterComputation, CounterRegistry, FigureCalculator,
};
use council_counters::config::{CacheSettings, Config, StorageConfig};
use council_counters::errors::{CounterError, Result};
use council_counters::fast_cache::{MemoryStore, VolatileStore};
use council_counters::invalidation::{FigureChange, InvalidationGate};
use council_counters::lock::LockManager;
use council_counters::orchestrator::CounterCache;
use council_counters::results::ResultStore;
use council_counters::storage::FigureStore;
use council_counters::warming::{WarmingOutcome, WarmingScheduler, WARMING_LOCK};
use council_counters::{Council, CounterKey, CounterOutcome, FinancialFigure, WarmMode};

/// Calculator returning a fixed value, counting invocations, optionally
/// sleeping to widen concurrency windows
struct StubCalculator {
    value: Decimal,
    delay: Duration,
    calls: AtomicUsize,
    fail: bool,
}

impl StubCalculator {
    fn new(value: Decimal) -> Self {
        Self {
            value,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    fn slow(value: Decimal, delay: Duration) -> Self {
        Self {
            value,
            delay,
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            value: Decimal::ZERO,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CounterCalculator for StubCalculator {
    async fn compute(&self, key: &CounterKey) -> Result<CounterComputation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(CounterError::CalculationFailed {
                counter: key.counter_id.clone(),
                reason: "stub failure".to_string(),
            });
        }
        Ok(CounterComputation {
            value: self.value,
            fingerprint: format!("fp-{}", self.value),
        })
    }
}

/// Volatile store whose every operation fails, for degraded-mode tests
struct BrokenStore;

#[async_trait]
impl VolatileStore for BrokenStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Err(CounterError::CacheUnavailable {
            details: "broken".to_string(),
        })
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
        Err(CounterError::CacheUnavailable {
            details: "broken".to_string(),
        })
    }

    async fn set_if_absent(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<bool> {
        Err(CounterError::CacheUnavailable {
            details: "broken".to_string(),
        })
    }

    async fn remove(&self, _key: &str) -> Result<bool> {
        Err(CounterError::CacheUnavailable {
            details: "broken".to_string(),
        })
    }

    async fn remove_if_equal(&self, _key: &str, _expected: &[u8]) -> Result<bool> {
        Err(CounterError::CacheUnavailable {
            details: "broken".to_string(),
        })
    }
}

struct MockHarness {
    _dir: tempfile::TempDir,
    cache: Arc<CounterCache>,
    results: Arc<ResultStore>,
    locks: Arc<LockManager>,
    calculator: Arc<StubCalculator>,
}

/// Cache wired to a stub calculator and in-memory volatile store
fn mock_harness(calculator: StubCalculator, settings: CacheSettings) -> MockHarness {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path().join("cache.db")).unwrap();
    let results = Arc::new(ResultStore::new(Arc::new(db)).unwrap());
    let fast: Arc<dyn VolatileStore> = Arc::new(MemoryStore::new());
    let locks = Arc::new(LockManager::new(Arc::clone(&fast)));
    let calculator = Arc::new(calculator);

    let cache = Arc::new(CounterCache::new(
        settings,
        fast,
        Arc::clone(&results),
        Arc::clone(&calculator) as Arc<dyn CounterCalculator>,
        Arc::clone(&locks),
    ));

    MockHarness {
        _dir: dir,
        cache,
        results,
        locks,
        calculator,
    }
}

fn key() -> CounterKey {
    CounterKey::site_wide("total-debt", Some(2024))
}

#[tokio::test]
async fn cold_miss_is_pending_without_expensive_permission() {
    let h = mock_harness(StubCalculator::new(dec!(900)), Config::default().cache);

    let outcome = h.cache.get(&key(), false).await.unwrap();
    assert_eq!(outcome, CounterOutcome::Pending { stale_value: None });
    assert_eq!(h.calculator.calls(), 0);
}

#[tokio::test]
async fn expensive_get_computes_and_populates_both_stores() {
    let h = mock_harness(StubCalculator::new(dec!(900)), Config::default().cache);

    let outcome = h.cache.get(&key(), true).await.unwrap();
    match outcome {
        CounterOutcome::Ready(counter) => assert_eq!(counter.value, dec!(900)),
        other => panic!("expected Ready, got {:?}", other),
    }
    assert_eq!(h.calculator.calls(), 1);

    // Durable record is fresh
    let record = h.results.get(&key()).unwrap().unwrap();
    assert!(record.is_fresh());
    assert_eq!(record.value, Some(dec!(900)));

    // Fast cache is warm: a non-expensive read is now Ready with no recompute
    let outcome = h.cache.get(&key(), false).await.unwrap();
    assert!(outcome.is_ready());
    assert_eq!(h.calculator.calls(), 1);
    assert_eq!(h.cache.get_stats().await.fast_hits, 1);
}

#[tokio::test]
async fn fresh_store_entry_bypasses_calculator() {
    let h = mock_harness(StubCalculator::new(dec!(1)), Config::default().cache);

    h.results
        .put_fresh(&key(), dec!(42), "seeded".to_string())
        .unwrap();

    let outcome = h.cache.get(&key(), false).await.unwrap();
    match outcome {
        CounterOutcome::Ready(counter) => assert_eq!(counter.value, dec!(42)),
        other => panic!("expected Ready, got {:?}", other),
    }
    assert_eq!(h.calculator.calls(), 0);
}

#[tokio::test]
async fn repeated_expensive_gets_are_idempotent() {
    let h = mock_harness(StubCalculator::new(dec!(900)), Config::default().cache);

    let first = h.cache.get(&key(), true).await.unwrap();
    let second = h.cache.get(&key(), true).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.calculator.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_expensive_gets_run_calculator_once() {
    let h = mock_harness(
        StubCalculator::slow(dec!(900), Duration::from_millis(150)),
        Config::default().cache,
    );

    let k = key();
    let (a, b) = tokio::join!(h.cache.get(&k, true), h.cache.get(&k, true));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(h.calculator.calls(), 1);
    // One caller computed; the other either saw the lock conflict (Pending)
    // or, if serialized, the already-stored value
    assert!(a.is_ready() || b.is_ready());
    for outcome in [a, b] {
        if let CounterOutcome::Ready(counter) = outcome {
            assert_eq!(counter.value, dec!(900));
        }
    }
}

/// Volatile store that counts counter payloads written while the matching
/// recompute lock is not held
struct ReleaseOrderStore {
    inner: MemoryStore,
    unlocked_writes: AtomicUsize,
}

impl ReleaseOrderStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            unlocked_writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl VolatileStore for ReleaseOrderStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        // Key layout on the shared substrate: values live under "counter:",
        // their recompute locks under "lock:recompute:"
        if let Some(suffix) = key.strip_prefix("counter:") {
            let lock_key = format!("lock:recompute:{}", suffix);
            if self.inner.get(&lock_key).await?.is_none() {
                self.unlocked_writes.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.inner.remove(key).await
    }

    async fn remove_if_equal(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.inner.remove_if_equal(key, expected).await
    }
}

#[tokio::test]
async fn write_through_completes_before_lock_release() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path().join("cache.db")).unwrap();
    let results = Arc::new(ResultStore::new(Arc::new(db)).unwrap());
    let fast = Arc::new(ReleaseOrderStore::new());
    let calculator = Arc::new(StubCalculator::new(dec!(900)));
    let cache = CounterCache::new(
        Config::default().cache,
        Arc::clone(&fast) as Arc<dyn VolatileStore>,
        Arc::clone(&results),
        Arc::clone(&calculator) as Arc<dyn CounterCalculator>,
        Arc::new(LockManager::new(Arc::clone(&fast) as Arc<dyn VolatileStore>)),
    );

    let outcome = cache.get(&key(), true).await.unwrap();
    assert!(outcome.is_ready());
    assert_eq!(calculator.calls(), 1);

    // The value must land in both stores while the lock is still held; a
    // write after release could clobber a newer holder's result
    assert_eq!(fast.unlocked_writes.load(Ordering::SeqCst), 0);
    assert!(results.get(&key()).unwrap().unwrap().is_fresh());

    // And the lock is free again once the write-through is done
    let was_held = cache
        .clear_lock(&CounterCache::lock_name(&key()))
        .await
        .unwrap();
    assert!(!was_held);
}

#[tokio::test]
async fn calculator_failure_releases_the_lock() {
    let h = mock_harness(StubCalculator::failing(), Config::default().cache);

    let err = h.cache.get(&key(), true).await.unwrap_err();
    assert!(matches!(err, CounterError::CalculationFailed { .. }));
    assert_eq!(h.calculator.calls(), 1);

    // The lock must be free immediately, even though no value was stored
    let token = h
        .locks
        .try_acquire(&CounterCache::lock_name(&key()), Duration::from_secs(60))
        .await
        .unwrap();
    assert!(token.is_some());
    assert!(h.results.get(&key()).unwrap().is_none());
}

#[tokio::test]
async fn lock_contention_yields_pending_with_stale_value() {
    let h = mock_harness(StubCalculator::new(dec!(900)), Config::default().cache);

    h.cache.get(&key(), true).await.unwrap();
    h.results
        .mark_stale(&key(), 5, chrono::Duration::hours(1))
        .unwrap();
    h.cache.evict_fast(&key()).await;

    // Simulate a recompute in flight elsewhere
    let held = h
        .locks
        .try_acquire(&CounterCache::lock_name(&key()), Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let outcome = h.cache.get(&key(), true).await.unwrap();
    assert_eq!(
        outcome,
        CounterOutcome::Pending {
            stale_value: Some(dec!(900)),
        }
    );
    assert_eq!(h.calculator.calls(), 1);

    h.locks.release(held).await.unwrap();
}

#[tokio::test]
async fn broken_fast_cache_degrades_to_durable_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path().join("cache.db")).unwrap();
    let results = Arc::new(ResultStore::new(Arc::new(db)).unwrap());
    let calculator = Arc::new(StubCalculator::new(dec!(7)));
    // Fast cache is down; locks live on a healthy substrate
    let cache = CounterCache::new(
        Config::default().cache,
        Arc::new(BrokenStore),
        Arc::clone(&results),
        Arc::clone(&calculator) as Arc<dyn CounterCalculator>,
        Arc::new(LockManager::new(Arc::new(MemoryStore::new()))),
    );

    let outcome = cache.get(&key(), true).await.unwrap();
    assert!(outcome.is_ready());

    // Next read serves from the durable store despite the dead fast cache
    let outcome = cache.get(&key(), false).await.unwrap();
    assert!(outcome.is_ready());
    assert_eq!(calculator.calls(), 1);
    assert!(cache.get_stats().await.fast_cache_errors > 0);
}

struct FullHarness {
    _dir: tempfile::TempDir,
    storage: Arc<FigureStore>,
    cache: Arc<CounterCache>,
    results: Arc<ResultStore>,
    gate: Arc<InvalidationGate>,
    warming: Arc<WarmingScheduler>,
    locks: Arc<LockManager>,
}

/// Full stack over the real figure calculator, seeded with two councils
async fn full_harness(settings: CacheSettings) -> FullHarness {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(
        FigureStore::new(StorageConfig {
            db_path: dir.path().join("figures.db"),
        })
        .await
        .unwrap(),
    );
    let results = Arc::new(ResultStore::new(storage.database()).unwrap());
    let fast: Arc<dyn VolatileStore> = Arc::new(MemoryStore::new());
    let locks = Arc::new(LockManager::new(Arc::clone(&fast)));
    let registry = Arc::new(CounterRegistry::built_in());
    let calculator = Arc::new(FigureCalculator::new(
        Arc::clone(&storage),
        Arc::clone(&registry),
    ));

    let cache = Arc::new(CounterCache::new(
        settings.clone(),
        fast,
        Arc::clone(&results),
        calculator,
        Arc::clone(&locks),
    ));
    let gate = Arc::new(InvalidationGate::new(
        settings.clone(),
        Arc::clone(&results),
        Arc::clone(&cache),
    ));
    let warming = Arc::new(WarmingScheduler::new(
        settings,
        Config::default().warming,
        registry,
        Arc::clone(&storage),
        Arc::clone(&cache),
        Arc::clone(&gate),
        Arc::clone(&locks),
    ));

    for (slug, name, population) in [
        ("barnet", "Barnet", Some(390_000u64)),
        ("camden", "Camden", Some(210_000)),
    ] {
        storage
            .store_council(&Council {
                slug: slug.to_string(),
                name: name.to_string(),
                population,
            })
            .await
            .unwrap();
    }

    let figures = vec![
        figure("barnet", 2024, "current-liabilities", dec!(100)),
        figure("barnet", 2024, "long-term-liabilities", dec!(500)),
        figure("camden", 2024, "current-liabilities", dec!(50)),
        figure("camden", 2024, "long-term-liabilities", dec!(250)),
    ];
    storage.store_figures_batch(&figures).await.unwrap();

    FullHarness {
        _dir: dir,
        storage,
        cache,
        results,
        gate,
        warming,
        locks,
    }
}

fn figure(council: &str, year: i32, field: &str, value: Decimal) -> FinancialFigure {
    FinancialFigure {
        council: council.to_string(),
        year,
        field: field.to_string(),
        value,
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn edit_invalidates_and_next_expensive_get_reflects_it() {
    let h = full_harness(Config::default().cache).await;
    let council_key = CounterKey::for_council("total-debt", "barnet", Some(2024));
    let site_key = CounterKey::site_wide("total-debt", Some(2024));

    // Warm both keys
    let before = h.cache.get(&council_key, true).await.unwrap();
    h.cache.get(&site_key, true).await.unwrap();
    match &before {
        CounterOutcome::Ready(counter) => assert_eq!(counter.value, dec!(600)),
        other => panic!("expected Ready, got {:?}", other),
    }

    // Edit barnet's debt figure, then notify exactly once
    h.storage
        .store_figure(&figure("barnet", 2024, "current-liabilities", dec!(150)))
        .await
        .unwrap();
    h.gate
        .notify_changed(FigureChange {
            council: "barnet".to_string(),
            year: 2024,
            counter_ids: vec!["total-debt".to_string()],
            session: None,
        })
        .await
        .unwrap();

    // Both the council and site-wide entries are now stale
    assert!(h.results.get(&council_key).unwrap().unwrap().is_stale);
    assert!(h.results.get(&site_key).unwrap().unwrap().is_stale);

    // Non-blocking read shows pending with the old value
    let outcome = h.cache.get(&council_key, false).await.unwrap();
    assert_eq!(
        outcome,
        CounterOutcome::Pending {
            stale_value: Some(dec!(600)),
        }
    );

    // Expensive read recomputes with the edit applied
    let outcome = h.cache.get(&council_key, true).await.unwrap();
    match outcome {
        CounterOutcome::Ready(counter) => assert_eq!(counter.value, dec!(650)),
        other => panic!("expected Ready, got {:?}", other),
    }
}

#[tokio::test]
async fn suppressed_marks_do_not_reflip_recomputed_entries() {
    let mut settings = Config::default().cache;
    settings.stale_marks_per_window = 2;
    let h = full_harness(settings).await;
    let site_key = CounterKey::site_wide("total-debt", Some(2024));

    h.cache.get(&site_key, true).await.unwrap();

    let notify = |h: &FullHarness| {
        let gate = Arc::clone(&h.gate);
        async move {
            gate.notify_changed(FigureChange {
                council: "barnet".to_string(),
                year: 2024,
                counter_ids: vec!["total-debt".to_string()],
                session: None,
            })
            .await
            .unwrap();
        }
    };

    // Exhaust the ceiling for this window
    notify(&h).await;
    notify(&h).await;
    assert!(h.results.get(&site_key).unwrap().unwrap().is_stale);

    // A recomputation clears the flag
    h.cache.get(&site_key, true).await.unwrap();
    assert!(h.results.get(&site_key).unwrap().unwrap().is_fresh());

    // Further notifications within the window are suppressed, not applied
    notify(&h).await;
    assert!(h.results.get(&site_key).unwrap().unwrap().is_fresh());
    assert!(h.gate.get_stats().await.marks_suppressed > 0);
}

#[tokio::test]
async fn session_edits_invalidate_once_after_flush() {
    let h = full_harness(Config::default().cache).await;
    let site_key = CounterKey::site_wide("total-debt", Some(2024));
    h.cache.get(&site_key, true).await.unwrap();

    // A wizard session saves the same figure three times
    for value in [dec!(110), dec!(120), dec!(130)] {
        h.storage
            .store_figure(&figure("barnet", 2024, "current-liabilities", value))
            .await
            .unwrap();
        h.gate
            .notify_changed(FigureChange {
                council: "barnet".to_string(),
                year: 2024,
                counter_ids: vec!["total-debt".to_string()],
                session: Some("wizard-7".to_string()),
            })
            .await
            .unwrap();
    }

    // Coalesced: nothing marked yet
    assert!(h.results.get(&site_key).unwrap().unwrap().is_fresh());

    h.gate.flush_session("wizard-7").await.unwrap();
    let record = h.results.get(&site_key).unwrap().unwrap();
    assert!(record.is_stale);
    assert_eq!(record.stale_marks, 1);
}

#[tokio::test]
async fn warming_pass_populates_critical_counters() {
    let h = full_harness(Config::default().cache).await;

    let outcome = h.warming.run(WarmMode::Critical).await.unwrap();
    let report = match outcome {
        WarmingOutcome::Completed(report) => report,
        WarmingOutcome::AlreadyRunning => panic!("no other pass should be running"),
    };

    assert!(report.targets > 0);
    assert_eq!(report.warmed, report.targets);
    assert_eq!(report.failed, 0);

    // The site-wide total is now a cache hit on the non-blocking path
    let outcome = h
        .cache
        .get(&CounterKey::site_wide("total-debt", None), false)
        .await
        .unwrap();
    assert!(outcome.is_ready());
}

#[tokio::test]
async fn overlapping_warming_pass_reports_already_running() {
    let h = full_harness(Config::default().cache).await;

    // Another pass holds the overlap guard
    let guard = h
        .locks
        .try_acquire(WARMING_LOCK, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let outcome = h.warming.run(WarmMode::Critical).await.unwrap();
    assert!(matches!(outcome, WarmingOutcome::AlreadyRunning));
    // Zero recomputations happened
    assert_eq!(h.cache.get_stats().await.recomputations, 0);

    h.locks.release(guard).await.unwrap();

    // With the guard released the pass runs normally
    let outcome = h.warming.run(WarmMode::Critical).await.unwrap();
    assert!(matches!(outcome, WarmingOutcome::Completed(_)));
}

#[tokio::test]
async fn force_run_clears_a_wedged_overlap_guard() {
    let h = full_harness(Config::default().cache).await;

    // A crashed pass left the guard behind
    h.locks
        .try_acquire(WARMING_LOCK, Duration::from_secs(3600))
        .await
        .unwrap()
        .unwrap();

    let outcome = h.warming.force_run(WarmMode::Critical).await.unwrap();
    assert!(matches!(outcome, WarmingOutcome::Completed(_)));
}
