//! Process-wide [`IncrementQueue`]
//!
//! Programs that want a single queue reachable from anywhere install it once
//! at startup, the way a global `metrics` recorder is installed. Nothing is
//! bound implicitly by whoever happens to report first.

use once_cell::sync::OnceCell;

use crate::queue::IncrementQueue;

static QUEUE: OnceCell<IncrementQueue> = OnceCell::new();

/// Errors produced by [`install`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A queue is already installed.
    #[error("an increment queue is already installed")]
    AlreadyInstalled,
}

/// Install `queue` as the process-wide [`IncrementQueue`].
///
/// # Errors
///
/// Returns [`Error::AlreadyInstalled`] if a queue was installed before.
pub fn install(queue: IncrementQueue) -> Result<(), Error> {
    QUEUE.set(queue).map_err(|_| Error::AlreadyInstalled)
}

/// The installed [`IncrementQueue`], if any.
#[must_use]
pub fn get() -> Option<&'static IncrementQueue> {
    QUEUE.get()
}
