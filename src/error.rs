//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different ways a measurement session can fail, from a bad rig description to an
//! instrument that stops answering halfway through a sweep.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches
//!   in the configuration file or environment overrides.
//! - **`Configuration`**: Semantic errors in the rig description that pass parsing but are
//!   logically wrong (a puck pin outside 7-14, a switch label without a switch, an unknown
//!   device name, an ambiguous sweep). Fatal at setup, never retried.
//! - **`Lookup`**: A connection name that cannot be resolved to exactly one switch port.
//!   Raised while a measurement plan is being built.
//! - **`ActuatorTimeout`**: The cryostat, magnet or rotator did not report a stable
//!   setpoint in time. Aborts the sweep.
//! - **`InstrumentIo`**: Transport failures and unparseable instrument responses. Kept
//!   separate from `Configuration` so that a flaky GPIB cable is not reported as a typo.
//! - **`InsufficientSamples`**: The sampling options leave nothing after trimming.
//! - **`Io`** / **`Csv`**: Output file problems.
//! - **`FeatureNotEnabled`**: Functionality that was not compiled in (e.g. VISA).

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// The physical actuator a setpoint wait was issued to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actuator {
    /// Horizontal rotator position.
    Rotator,
    /// Superconducting magnet field.
    Magnet,
    /// Sample chamber temperature.
    Temperature,
}

impl std::fmt::Display for Actuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Actuator::Rotator => "rotator",
            Actuator::Magnet => "magnet",
            Actuator::Temperature => "temperature controller",
        };
        f.write_str(name)
    }
}

/// Failure to resolve a connection or instrument name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// No registry entry carries the name.
    #[error("could not find any instances of '{0}'")]
    NotFound(String),

    /// More than one registry entry claims the name.
    #[error("found {count} instances of '{name}'")]
    Ambiguous {
        /// The name that was looked up.
        name: String,
        /// How many entries matched.
        count: usize,
    },
}

/// Primary error type for the crate.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The configuration sources could not be loaded or deserialized.
    #[error("Configuration load error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The rig description is inconsistent.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A name could not be resolved to a single entry.
    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    /// An actuator did not settle before the timeout elapsed.
    #[error("Timed out after {timeout:?} waiting for the {actuator} to reach its setpoint")]
    ActuatorTimeout {
        /// The actuator that was waited on.
        actuator: Actuator,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// Communication with an instrument failed or returned garbage.
    #[error("Instrument I/O error on '{instrument}': {message}")]
    InstrumentIo {
        /// Instrument (or switch) name.
        instrument: String,
        /// What went wrong.
        message: String,
    },

    /// Sampling options leave no readings after skipping and trimming.
    #[error("Insufficient samples: {available} readings left after skipping, cannot drop {dropped} from each end")]
    InsufficientSamples {
        /// Readings kept after the settle skip.
        available: usize,
        /// Readings to drop from each end.
        dropped: usize,
    },

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding or decoding error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Functionality that was not compiled in.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Shorthand for an [`DaqError::InstrumentIo`] error.
    pub fn io(instrument: impl Into<String>, message: impl Into<String>) -> Self {
        DaqError::InstrumentIo {
            instrument: instrument.into(),
            message: message.into(),
        }
    }
}
