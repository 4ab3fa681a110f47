//! Core library for the ppms_daq application.
//!
//! Resistance sweeps on a Quantum Design PPMS with a horizontal rotator,
//! Keithley instruments on GPIB and a LinkBone relay matrix that routes the
//! sample leads. The library holds the connection registry, the measurement
//! plan, the sampler and the sweep driver; the binary in `main.rs` wires
//! them to a configuration file.

pub mod adapters;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod instrument;
pub mod logging;
pub mod metadata;
pub mod plan;
pub mod rig;
pub mod sampler;
pub mod setpoints;
pub mod sweep;
pub mod topology;
