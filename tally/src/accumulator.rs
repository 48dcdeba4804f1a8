//! Concurrent accumulation of pending increments
//!
//! The [`AccumulationMap`] holds at most one [`PendingIncrement`] per
//! [`CompositeKey`]. Any number of reporters merge into it concurrently while a
//! single drain loop removes entries from it.
//!
//! # Merge protocol
//!
//! Reporters never hold a slot across a read-modify-write. A report:
//!
//! 1. inserts a zero-amount increment for the key if absent and reads back
//!    whatever is present,
//! 2. computes the candidate value, the observed amount plus the reported
//!    amount,
//! 3. replaces the slot with the candidate only if the slot still holds
//!    exactly the observed value,
//! 4. on failure starts over from 1.
//!
//! If the drain loop removes the key between 1 and 3 the swap fails and the
//! next attempt re-inserts a zero baseline, so the reported amount lands in a
//! fresh entry for the next drain rather than being lost. For a key present in
//! the map the amount is therefore always the sum of everything reported for
//! that key since it was last removed.

use dashmap::DashMap;

use crate::{increment::PendingIncrement, key::CompositeKey};

/// Mapping from [`CompositeKey`] to the amount pending for that key.
#[derive(Debug, Default)]
pub struct AccumulationMap {
    inner: DashMap<CompositeKey, PendingIncrement>,
}

impl AccumulationMap {
    /// Create a new, empty [`AccumulationMap`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `increment` into the entry for its key.
    ///
    /// Returns the number of times the swap lost a race and had to be
    /// retried. Never blocks for longer than a shard lock is held by a single
    /// map operation.
    pub fn report(&self, increment: PendingIncrement) -> u64 {
        let key = increment.key();
        let zero = increment.zeroed();
        let mut retries: u64 = 0;

        loop {
            // The guard returned by `or_insert` is released at the end of this
            // statement. Holding it across the swap would make this a plain
            // locked update.
            let current: PendingIncrement = *self.inner.entry(key).or_insert(zero);
            let next = current.merged(increment.amount);

            if self.compare_and_swap(&key, &current, next) {
                return retries;
            }
            retries += 1;
        }
    }

    /// Replace the value under `key` with `next` if the map still holds
    /// exactly `expected` there.
    fn compare_and_swap(
        &self,
        key: &CompositeKey,
        expected: &PendingIncrement,
        next: PendingIncrement,
    ) -> bool {
        match self.inner.get_mut(key) {
            Some(mut slot) if slot.is_identical(expected) => {
                *slot = next;
                true
            }
            _ => false,
        }
    }

    /// Remove and return an arbitrary entry, `None` if the map is empty.
    ///
    /// No order among keys is promised.
    pub fn remove_one(&self) -> Option<(CompositeKey, PendingIncrement)> {
        loop {
            // Copy the key out so the iterator's shard guard is dropped
            // before `remove` asks for the same shard's write lock.
            let key = {
                let first = self.inner.iter().next()?;
                *first.key()
            };
            if let Some(entry) = self.inner.remove(&key) {
                return Some(entry);
            }
        }
    }

    /// Remove and return the entry for `key`, if any.
    pub fn remove(&self, key: &CompositeKey) -> Option<PendingIncrement> {
        self.inner.remove(key).map(|(_, pending)| pending)
    }

    /// Snapshot of the keys present at the time of the call.
    #[must_use]
    pub fn keys(&self) -> Vec<CompositeKey> {
        self.inner.iter().map(|entry| *entry.key()).collect()
    }

    /// The pending increment for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &CompositeKey) -> Option<PendingIncrement> {
        self.inner.get(key).map(|entry| *entry.value())
    }

    /// Number of keys with a pending amount.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no key has a pending amount.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
