//! Write-coalescing buffer for metric counter increments
//!
//! Many callers report small increments keyed by entity, dimension, event
//! time and metric. Writing each of these to the backing metrics store would
//! swamp it under high fan-in. Instead increments that share a key are merged
//! into a single pending amount in an [`accumulator::AccumulationMap`] and a
//! single [`drain::DrainTask`] flushes the pending amounts to the store after
//! a bounded delay, collapsing many writes into one per key per window.
//!
//! The entry point for callers is [`queue::IncrementQueue`].

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]

pub mod accumulator;
pub mod config;
pub mod drain;
pub mod global;
pub mod increment;
pub mod key;
pub mod queue;
pub mod scheduler;
pub mod store;

pub use increment::PendingIncrement;
pub use key::{CompositeKey, DimensionId, EntityId, MetricTarget};
pub use queue::IncrementQueue;
