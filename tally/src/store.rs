//! Backing metric store
//!
//! The drain loop writes through [`MetricStore`]. What the store does with a
//! write, and how it manages its connections, is its own business; the drain
//! loop only cares whether the write succeeded.

use std::sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use rustc_hash::FxHashMap;

use crate::key::{CompositeKey, DimensionId, EntityId, MetricTarget};

/// Errors produced by a [`MetricStore`]
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store refused the write, for instance on a constraint violation.
    #[error("write rejected: {0}")]
    Rejected(String),
    /// Any other store-specific failure.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// A store that durably applies counter increments
pub trait MetricStore: Send + Sync {
    /// Name of the store, used to identify it in errors and logs.
    fn name(&self) -> &str;

    /// Add `amount` to the counter identified by the remaining arguments.
    ///
    /// This call may block on I/O.
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not apply the increment. The
    /// caller does not retry.
    fn apply_increment(
        &self,
        target: &MetricTarget,
        entity: EntityId,
        event_ms: Option<i64>,
        dimension: DimensionId,
        amount: f64,
    ) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
struct Totals {
    counters: FxHashMap<CompositeKey, f64>,
    written: f64,
    rejected: f64,
}

/// In-memory [`MetricStore`] with fault injection
///
/// Keeps a running total per counter. Failures can be injected either for the
/// next `n` writes or for every `n`th write; a refused write's amount is
/// tallied separately so callers can reconcile what was reported against
/// what landed.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    totals: Mutex<Totals>,
    writes: AtomicU64,
    failures: AtomicU64,
    fail_next: AtomicU64,
    fail_every: AtomicU64,
}

impl MemoryStore {
    /// Create a new, empty [`MemoryStore`].
    #[must_use]
    pub fn new<S>(name: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            name: name.into(),
            totals: Mutex::new(Totals::default()),
            writes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            fail_next: AtomicU64::new(0),
            fail_every: AtomicU64::new(0),
        }
    }

    /// Refuse the next `n` writes.
    pub fn fail_next(&self, n: u64) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Refuse every `n`th write attempt. Zero disables.
    pub fn fail_every(&self, n: u64) {
        self.fail_every.store(n, Ordering::SeqCst);
    }

    /// Total stored for the counter identified by `key`, if ever written.
    #[must_use]
    pub fn total(&self, key: &CompositeKey) -> Option<f64> {
        self.lock().counters.get(key).copied()
    }

    /// Number of distinct counters written.
    #[must_use]
    pub fn counters(&self) -> usize {
        self.lock().counters.len()
    }

    /// Number of successful writes.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of refused writes.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Sum of every amount successfully written.
    #[must_use]
    pub fn written_amount(&self) -> f64 {
        self.lock().written
    }

    /// Sum of every amount in a refused write.
    #[must_use]
    pub fn rejected_amount(&self) -> f64 {
        self.lock().rejected
    }

    fn lock(&self) -> MutexGuard<'_, Totals> {
        // The totals are plain sums, a panic mid-update cannot leave them
        // half written.
        self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn should_fail(&self) -> bool {
        let attempt = self.writes.load(Ordering::SeqCst) + self.failures.load(Ordering::SeqCst) + 1;

        let mut remaining = self.fail_next.load(Ordering::SeqCst);
        while remaining > 0 {
            match self.fail_next.compare_exchange_weak(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(x) => remaining = x,
            }
        }

        let every = self.fail_every.load(Ordering::SeqCst);
        every > 0 && attempt % every == 0
    }
}

impl MetricStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply_increment(
        &self,
        target: &MetricTarget,
        entity: EntityId,
        event_ms: Option<i64>,
        dimension: DimensionId,
        amount: f64,
    ) -> Result<(), StorageError> {
        if self.should_fail() {
            self.failures.fetch_add(1, Ordering::SeqCst);
            self.lock().rejected += amount;
            return Err(StorageError::Unavailable(format!(
                "injected failure writing {target}"
            )));
        }

        let key = CompositeKey::new(entity, *target, event_ms, dimension);
        let mut totals = self.lock();
        *totals.counters.entry(key).or_insert(0.0) += amount;
        totals.written += amount;
        drop(totals);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
