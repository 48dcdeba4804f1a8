//! Deferred execution of drain cycles
//!
//! The drain task does not own a timer. It hands each [`Cycle`] to a
//! [`Scheduler`] together with the delay requested by the reporter that
//! scheduled it, and the scheduler is responsible for calling
//! [`Cycle::run`] once that delay has passed.

use std::{
    fmt,
    mem,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{runtime::Handle, task, time};
use tracing::{debug, error};

use crate::drain::{self, Cycle, Outcome};

/// Errors produced by [`TokioScheduler`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No tokio runtime to capture.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Runs a [`Cycle`] after a delay
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Arrange for `cycle` to be run once `delay` has elapsed.
    fn defer(&self, delay: Duration, cycle: Cycle);
}

/// A [`Scheduler`] backed by a tokio runtime
///
/// Each cycle waits on a tokio timer and then runs on the blocking pool, the
/// store writes it performs being synchronous. A failed cycle is logged;
/// reporters never see it.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Create a new [`TokioScheduler`] spawning onto `handle`.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Create a new [`TokioScheduler`] spawning onto the current runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if called outside of a tokio runtime.
    pub fn current() -> Result<Self, Error> {
        Ok(Self::new(Handle::try_current()?))
    }
}

impl Scheduler for TokioScheduler {
    fn defer(&self, delay: Duration, cycle: Cycle) {
        self.handle.spawn(async move {
            time::sleep(delay).await;
            let ticket = cycle.ticket();
            match task::spawn_blocking(move || cycle.run()).await {
                Ok(Ok(Outcome::Drained(summary))) => {
                    debug!(
                        ticket,
                        written = summary.written,
                        "scheduled drain cycle complete"
                    );
                }
                Ok(Ok(Outcome::Superseded)) => {}
                Ok(Err(err)) => error!(ticket, "scheduled drain cycle failed: {err}"),
                Err(err) => error!(ticket, "scheduled drain cycle did not complete: {err}"),
            }
        });
    }
}

/// A [`Scheduler`] that holds cycles until asked to run them
///
/// Delays are recorded but not waited on. Useful in tests and wherever the
/// embedding program drives its own timers.
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<(Duration, Cycle)>>,
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Cycles point back at the drain task, which points at this
        // scheduler. Print only the delays.
        f.debug_struct("ManualScheduler")
            .field("delays", &self.delays())
            .finish()
    }
}

impl ManualScheduler {
    /// Create a new, empty [`ManualScheduler`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cycles waiting to be run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Requested delay of each waiting cycle, in the order deferred.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        self.lock().iter().map(|(delay, _)| *delay).collect()
    }

    /// Run every waiting cycle on the calling thread, returning each result
    /// in the order the cycles were deferred.
    pub fn run_pending(&self) -> Vec<Result<Outcome, drain::Error>> {
        // Take the cycles out first, a running cycle's reporters may defer
        // again.
        let cycles = mem::take(&mut *self.lock());
        cycles.into_iter().map(|(_, cycle)| cycle.run()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(Duration, Cycle)>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for ManualScheduler {
    fn defer(&self, delay: Duration, cycle: Cycle) {
        self.lock().push((delay, cycle));
    }
}
