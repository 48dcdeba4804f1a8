//! Identity of a coalesced counter
//!
//! Increments merge only when all five logical fields agree: entity, metric
//! type, metric symbol, event time and dimension. [`CompositeKey`] is the
//! hashable form of those fields.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of the entity a counter belongs to.
pub type EntityId = Uuid;

/// Identifier of the dimension a counter is broken down by.
pub type DimensionId = Uuid;

/// The counter family an increment is written to
///
/// A target carries everything the backing store needs to locate the counter
/// table: the metric type and the symbol within that type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricTarget {
    /// Type of the metric owner.
    pub type_id: Uuid,
    /// Symbol of the metric field within `type_id`.
    pub symbol_id: u32,
}

impl MetricTarget {
    /// Create a new [`MetricTarget`].
    #[must_use]
    pub fn new(type_id: Uuid, symbol_id: u32) -> Self {
        Self { type_id, symbol_id }
    }
}

impl fmt::Display for MetricTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_id, self.symbol_id)
    }
}

/// Merge key for pending increments
///
/// An absent event time is its own key component. It does not collide with
/// an event time of zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    entity: EntityId,
    target: MetricTarget,
    event_ms: Option<i64>,
    dimension: DimensionId,
}

impl CompositeKey {
    /// Derive the key for an increment's logical fields.
    #[must_use]
    pub fn new(
        entity: EntityId,
        target: MetricTarget,
        event_ms: Option<i64>,
        dimension: DimensionId,
    ) -> Self {
        Self {
            entity,
            target,
            event_ms,
            dimension,
        }
    }

    /// The entity component of this key.
    #[must_use]
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// The metric target component of this key.
    #[must_use]
    pub fn target(&self) -> MetricTarget {
        self.target
    }

    /// The event time component of this key, milliseconds since the epoch.
    #[must_use]
    pub fn event_ms(&self) -> Option<i64> {
        self.event_ms
    }

    /// The dimension component of this key.
    #[must_use]
    pub fn dimension(&self) -> DimensionId {
        self.dimension
    }
}

/// Renders `entity:type_id:symbol_id:event_ms:dimension`. The event segment
/// is empty when there is no event time.
impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.entity, self.target)?;
        if let Some(ms) = self.event_ms {
            write!(f, "{ms}")?;
        }
        write!(f, ":{}", self.dimension)
    }
}
