//! Configuration of the `tally-load` harness
//!
//! The harness is configured from YAML. Every field has a default so an empty
//! document is a valid configuration.

use std::{net::SocketAddr, num::NonZeroU32, time::Duration};

use serde::Deserialize;

use crate::drain::FailurePolicy;

/// Errors produced when validating a [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A duration given in seconds is negative or not finite.
    #[error("{field} must be a finite, non-negative number of seconds, got {value}")]
    Seconds {
        /// Name of the offending field.
        field: &'static str,
        /// The value given.
        value: f64,
    },
    /// YAML could not be deserialized.
    #[error("Failed to deserialize config: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
}

/// Main configuration struct for the harness
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Number of reporter threads.
    pub reporters: NonZeroU32,
    /// How long reporters run, in seconds.
    pub duration_secs: f64,
    /// Delay requested with every report, in seconds.
    pub delay_secs: f64,
    /// Distinct entities reported against.
    pub entities: NonZeroU32,
    /// Distinct dimensions reported against.
    pub dimensions: NonZeroU32,
    /// Distinct metric targets reported against.
    pub targets: NonZeroU32,
    /// Distinct event times reported against. Zero reports without an event
    /// time.
    pub event_buckets: u32,
    /// Largest absolute amount of a single report. Amounts are whole numbers
    /// so sums stay exact.
    pub max_amount: u32,
    /// Fail every `n`th store write. Zero disables.
    pub fail_every: u64,
    /// What drain cycles do with pending increments after a failure.
    pub failure_policy: FailurePolicy,
    /// Address to expose Prometheus metrics on, if any.
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reporters: non_zero(8),
            duration_secs: 10.0,
            delay_secs: 0.5,
            entities: non_zero(64),
            dimensions: non_zero(4),
            targets: non_zero(2),
            event_buckets: 4,
            max_amount: 100,
            fail_every: 0,
            failure_policy: FailurePolicy::RetainPending,
            prometheus_addr: None,
        }
    }
}

impl Config {
    /// Parse a [`Config`] from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed or names unknown fields.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// How long reporters run.
    ///
    /// # Errors
    ///
    /// Returns an error if `duration_secs` is negative or not finite.
    pub fn duration(&self) -> Result<Duration, Error> {
        seconds("duration_secs", self.duration_secs)
    }

    /// Delay requested with every report.
    ///
    /// # Errors
    ///
    /// Returns an error if `delay_secs` is negative or not finite.
    pub fn delay(&self) -> Result<Duration, Error> {
        seconds("delay_secs", self.delay_secs)
    }
}

fn non_zero(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN)
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, Error> {
    Duration::try_from_secs_f64(value).map_err(|_| Error::Seconds { field, value })
}
