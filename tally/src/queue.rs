//! Public entry point for reporting increments

use std::{sync::Arc, time::Duration};

use metrics::counter;
use tracing::warn;

use crate::{
    accumulator::AccumulationMap,
    drain::{self, DrainSummary, DrainTask, FailurePolicy},
    increment::PendingIncrement,
    key::{DimensionId, EntityId, MetricTarget},
    scheduler::Scheduler,
    store::MetricStore,
};

/// Coalesces counter increments and drains them to a [`MetricStore`]
///
/// Cloning is cheap, clones share the same map and drain task.
#[derive(Debug, Clone)]
pub struct IncrementQueue {
    map: Arc<AccumulationMap>,
    task: Arc<DrainTask>,
}

impl IncrementQueue {
    /// Create a new [`IncrementQueue`] writing to `store`, with drain cycles
    /// run by `scheduler`. Failed cycles discard pending increments.
    #[must_use]
    pub fn new(store: Arc<dyn MetricStore>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_policy(store, scheduler, FailurePolicy::default())
    }

    /// As [`IncrementQueue::new`] with an explicit [`FailurePolicy`].
    #[must_use]
    pub fn with_policy(
        store: Arc<dyn MetricStore>,
        scheduler: Arc<dyn Scheduler>,
        policy: FailurePolicy,
    ) -> Self {
        let map = Arc::new(AccumulationMap::new());
        let task = DrainTask::new(Arc::clone(&map), store, scheduler, policy);
        Self { map, task }
    }

    /// Add `amount` to the pending increment for the counter identified by
    /// the other arguments and make sure a drain cycle runs within `delay`.
    ///
    /// If a cycle is already scheduled or running `delay` is ignored. Never
    /// blocks on the store and never fails. A non-finite `amount` is dropped.
    pub fn report_increment(
        &self,
        entity: EntityId,
        dimension: DimensionId,
        event_ms: Option<i64>,
        target: MetricTarget,
        amount: f64,
        delay: Duration,
    ) {
        if !amount.is_finite() {
            counter!("tally_increments_rejected").increment(1);
            warn!(%entity, %dimension, %target, amount, "dropping non-finite increment");
            return;
        }

        let retries = self.map.report(PendingIncrement::new(
            entity, dimension, event_ms, target, amount,
        ));
        counter!("tally_increments_reported").increment(1);
        if retries > 0 {
            counter!("tally_merge_retries").increment(retries);
        }

        self.task.schedule(delay);
    }

    /// Drain all pending increments now.
    ///
    /// # Errors
    ///
    /// See [`DrainTask::flush`].
    pub fn flush(&self) -> Result<DrainSummary, drain::Error> {
        self.task.flush()
    }

    /// The map pending increments accumulate in.
    #[must_use]
    pub fn map(&self) -> &AccumulationMap {
        &self.map
    }

    /// The drain task bound to this queue.
    #[must_use]
    pub fn task(&self) -> &Arc<DrainTask> {
        &self.task
    }
}
