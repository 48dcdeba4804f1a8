//! The debounced drain task
//!
//! A [`DrainTask`] is bound to one [`AccumulationMap`] and one
//! [`MetricStore`] for its whole life. Reporters call
//! [`DrainTask::schedule`] after every merge; only the first call while the
//! task is idle reaches the [`Scheduler`], every other call is a no-op until
//! the resulting cycle has finished. When the scheduler runs the [`Cycle`] the
//! task removes entries from the map one at a time and writes each to the
//! store, stopping as soon as it observes the map empty.
//!
//! A failed store write ends the cycle with [`Error::Storage`]. The amount of
//! the entry being written is lost; it is not put back. What happens to the
//! entries still in the map is decided by [`FailurePolicy`]. Either way the
//! task returns to idle so the next report schedules a fresh cycle.

use std::{fmt, sync::Arc, time::Duration};

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::{
    accumulator::AccumulationMap,
    scheduler::Scheduler,
    store::{MetricStore, StorageError},
};

mod state;

pub use state::Phase;
use state::CycleState;

const APPLY_INCREMENT: &str = "apply_increment";

/// Errors produced by [`DrainTask`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The backing store failed a write. The drain cycle was aborted.
    #[error("{operation} failed against store {store}: {source}")]
    Storage {
        /// Name of the store that failed.
        store: String,
        /// The store operation that failed.
        operation: &'static str,
        /// The underlying store error.
        #[source]
        source: StorageError,
    },
    /// A drain cycle is already running.
    #[error("drain cycle already running")]
    Busy,
}

/// What to do with entries still pending when a store write fails
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Drop every entry pending at the time of failure. The next cycle only
    /// sees amounts reported after the failure.
    #[default]
    DiscardPending,
    /// Leave pending entries in place for the next cycle.
    RetainPending,
}

/// Result of a drain cycle that ran to completion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrainSummary {
    /// Ticket of the cycle.
    pub ticket: u64,
    /// Number of store writes performed.
    pub written: u64,
    /// Sum of the amounts written.
    pub amount: f64,
}

/// Result of running a [`Cycle`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// The cycle drained the map.
    Drained(DrainSummary),
    /// The cycle was claimed by [`DrainTask::flush`] before it could start
    /// and did nothing.
    Superseded,
}

/// The single-flight drain task
pub struct DrainTask {
    map: Arc<AccumulationMap>,
    store: Arc<dyn MetricStore>,
    scheduler: Arc<dyn Scheduler>,
    policy: FailurePolicy,
    state: CycleState,
}

impl fmt::Debug for DrainTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainTask")
            .field("store", &self.store.name())
            .field("scheduler", &self.scheduler)
            .field("policy", &self.policy)
            .field("state", &self.state.load())
            .field("pending", &self.map.len())
            .finish()
    }
}

impl DrainTask {
    /// Create a new [`DrainTask`] bound to `map` and `store`.
    #[must_use]
    pub fn new(
        map: Arc<AccumulationMap>,
        store: Arc<dyn MetricStore>,
        scheduler: Arc<dyn Scheduler>,
        policy: FailurePolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            map,
            store,
            scheduler,
            policy,
            state: CycleState::new(),
        })
    }

    /// Current phase and cycle ticket.
    #[must_use]
    pub fn phase(&self) -> (Phase, u64) {
        self.state.load()
    }

    /// The map this task drains.
    #[must_use]
    pub fn map(&self) -> &Arc<AccumulationMap> {
        &self.map
    }

    /// Request a drain cycle within `delay`.
    ///
    /// Returns `true` if this call scheduled a cycle, `false` if one was
    /// already scheduled or running, in which case `delay` is ignored.
    pub fn schedule(self: &Arc<Self>, delay: Duration) -> bool {
        let Some(ticket) = self.state.try_schedule() else {
            counter!("tally_schedule_coalesced").increment(1);
            return false;
        };
        trace!(ticket, delay_ms = delay.as_millis(), "drain cycle scheduled");
        self.scheduler.defer(
            delay,
            Cycle {
                task: Arc::clone(self),
                ticket,
                delay,
            },
        );
        true
    }

    /// Drain the map now, without waiting for a scheduled cycle.
    ///
    /// A scheduled but not yet started cycle is superseded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] if a cycle is running and [`Error::Storage`] if
    /// a store write fails.
    pub fn flush(self: &Arc<Self>) -> Result<DrainSummary, Error> {
        let ticket = self.state.try_preempt().ok_or(Error::Busy)?;
        self.drain(ticket, Duration::ZERO)
    }

    fn drain(self: &Arc<Self>, ticket: u64, delay: Duration) -> Result<DrainSummary, Error> {
        let res = {
            // Returns the task to idle however the cycle exits.
            let _running = Running {
                state: &self.state,
                ticket,
            };
            self.drain_entries(ticket)
        };
        if res.is_ok() {
            self.rearm_if_pending(ticket, delay);
        }
        res
    }

    /// Schedule another cycle if increments are pending after `ticket`
    /// finished.
    ///
    /// A reporter that merges after the cycle saw the map empty but before
    /// the cycle went idle has its `schedule` call coalesced into the cycle
    /// that is ending. Without this its increment would wait for some later
    /// report.
    fn rearm_if_pending(self: &Arc<Self>, ticket: u64, delay: Duration) {
        if !self.map.is_empty() && self.schedule(delay) {
            debug!(ticket, "increments arrived as the cycle ended, rescheduled");
        }
    }

    fn drain_entries(&self, ticket: u64) -> Result<DrainSummary, Error> {
        counter!("tally_drain_cycles").increment(1);
        debug!(ticket, pending = self.map.len(), "drain cycle started");

        let mut summary = DrainSummary {
            ticket,
            written: 0,
            amount: 0.0,
        };
        while let Some((key, pending)) = self.map.remove_one() {
            if let Err(source) = self.store.apply_increment(
                &pending.target,
                pending.entity,
                pending.event_ms,
                pending.dimension,
                pending.amount,
            ) {
                counter!("tally_increments_written").increment(summary.written);
                counter!("tally_drain_failures").increment(1);
                error!(
                    ticket,
                    store = self.store.name(),
                    %key,
                    amount = pending.amount,
                    "{APPLY_INCREMENT} failed, increment dropped: {source}"
                );
                self.apply_failure_policy(ticket);
                return Err(Error::Storage {
                    store: self.store.name().to_string(),
                    operation: APPLY_INCREMENT,
                    source,
                });
            }
            summary.written += 1;
            summary.amount += pending.amount;
        }

        counter!("tally_increments_written").increment(summary.written);
        debug!(
            ticket,
            written = summary.written,
            amount = summary.amount,
            "drain cycle finished"
        );
        Ok(summary)
    }

    fn apply_failure_policy(&self, ticket: u64) {
        match self.policy {
            FailurePolicy::RetainPending => {
                debug!(ticket, pending = self.map.len(), "retaining pending increments");
            }
            FailurePolicy::DiscardPending => {
                // Only keys pending now. Keys first reported while we discard
                // belong to the next cycle.
                let mut discarded: u64 = 0;
                let mut amount = 0.0;
                for key in self.map.keys() {
                    if let Some(increment) = self.map.remove(&key) {
                        discarded += 1;
                        amount += increment.amount;
                    }
                }
                if discarded > 0 {
                    counter!("tally_increments_discarded").increment(discarded);
                    warn!(ticket, discarded, amount, "discarded pending increments");
                }
            }
        }
    }
}

struct Running<'a> {
    state: &'a CycleState,
    ticket: u64,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.state.finish(self.ticket);
    }
}

/// A scheduled drain cycle, handed to a [`Scheduler`]
///
/// The scheduler calls [`Cycle::run`] once the requested delay has elapsed.
/// Dropping a cycle without running it returns the task to idle, so the next
/// report schedules again.
#[derive(Debug)]
#[must_use = "a cycle that is never run does not drain the map"]
pub struct Cycle {
    task: Arc<DrainTask>,
    ticket: u64,
    delay: Duration,
}

impl Cycle {
    /// Ticket of this cycle.
    #[must_use]
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Delay requested when this cycle was scheduled.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run the drain cycle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if a store write fails. The task is idle
    /// again by the time this returns, or scheduled if increments arrived
    /// as a successful cycle ended.
    pub fn run(self) -> Result<Outcome, Error> {
        if !self.task.state.try_start(self.ticket) {
            trace!(ticket = self.ticket, "drain cycle superseded");
            return Ok(Outcome::Superseded);
        }
        self.task.drain(self.ticket, self.delay).map(Outcome::Drained)
    }
}

impl Drop for Cycle {
    fn drop(&mut self) {
        // Once run, the ticket has moved past `Scheduled` and this is a no-op.
        if self.task.state.abandon(self.ticket) {
            warn!(ticket = self.ticket, "drain cycle dropped before it ran");
        }
    }
}
