//! The pending amount for one key

use crate::key::{CompositeKey, DimensionId, EntityId, MetricTarget};

/// An immutable pending increment
///
/// Values of this type are never mutated in place. A merge produces a new
/// value with a larger amount, see [`PendingIncrement::merged`]. Equality
/// compares every field, amount included.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingIncrement {
    /// Entity the counter belongs to.
    pub entity: EntityId,
    /// Dimension of the counter.
    pub dimension: DimensionId,
    /// Event time in milliseconds since the epoch, if any.
    pub event_ms: Option<i64>,
    /// Counter family to write to.
    pub target: MetricTarget,
    /// Accumulated amount.
    pub amount: f64,
}

impl PendingIncrement {
    /// Create a new [`PendingIncrement`].
    #[must_use]
    pub fn new(
        entity: EntityId,
        dimension: DimensionId,
        event_ms: Option<i64>,
        target: MetricTarget,
        amount: f64,
    ) -> Self {
        Self {
            entity,
            dimension,
            event_ms,
            target,
            amount,
        }
    }

    /// A zero-amount increment with the same identity as `self`.
    #[must_use]
    pub fn zeroed(&self) -> Self {
        Self {
            amount: 0.0,
            ..*self
        }
    }

    /// The key this increment coalesces under.
    #[must_use]
    pub fn key(&self) -> CompositeKey {
        CompositeKey::new(self.entity, self.target, self.event_ms, self.dimension)
    }

    /// A copy of `self` with `delta` added to the amount.
    #[must_use]
    pub fn merged(&self, delta: f64) -> Self {
        Self {
            amount: self.amount + delta,
            ..*self
        }
    }

    /// Whether `self` and `other` are the same value bit for bit.
    ///
    /// Unlike `==` this treats a NaN amount as identical to itself, which the
    /// merge loop relies on to make progress.
    #[must_use]
    pub(crate) fn is_identical(&self, other: &Self) -> bool {
        self.amount.to_bits() == other.amount.to_bits()
            && self.entity == other.entity
            && self.dimension == other.dimension
            && self.event_ms == other.event_ms
            && self.target == other.target
    }
}

#[cfg(test)]
mod test {
    use uuid::Uuid;

    use super::PendingIncrement;
    use crate::key::MetricTarget;

    fn increment(amount: f64) -> PendingIncrement {
        PendingIncrement::new(
            Uuid::from_u128(1),
            Uuid::from_u128(2),
            Some(10),
            MetricTarget::new(Uuid::from_u128(3), 4),
            amount,
        )
    }

    #[test]
    fn equality_includes_amount() {
        assert_eq!(increment(1.0), increment(1.0));
        assert_ne!(increment(1.0), increment(2.0));
    }

    #[test]
    fn merged_keeps_identity() {
        let base = increment(3.0);
        let next = base.merged(4.5);
        assert_eq!(next.key(), base.key());
        assert!((next.amount - 7.5).abs() < f64::EPSILON);
        // The original is untouched.
        assert!((base.amount - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn nan_is_identical_to_itself() {
        let nan = increment(f64::NAN);
        let copy = nan;
        assert_ne!(nan, copy);
        assert!(nan.is_identical(&copy));
        assert!(!nan.is_identical(&increment(0.0)));
    }
}
