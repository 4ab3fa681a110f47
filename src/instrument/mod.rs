//! Capability traits for the instruments on the rig.
//!
//! The sweep and sampler only see these traits. Each has a hardware driver
//! (see [`keithley`] and [`crate::hardware::linkbone`]) and a simulated
//! stand-in in [`crate::hardware::mock`]; which one is used is decided when
//! the [`crate::rig::Rig`] is assembled.

pub mod keithley;

use crate::error::{Actuator, AppResult, DaqError};
use crate::topology::SwitchPort;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reads DC voltages.
#[async_trait]
pub trait Voltmeter: Send {
    /// Fetch the latest reading, in volts.
    async fn fetch(&mut self) -> AppResult<f64>;
}

/// Output limits applied before a current source is enabled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceLimits {
    /// Source range in amps.
    pub range: f64,
    /// Compliance voltage in volts.
    pub compliance: f64,
}

impl Default for SourceLimits {
    fn default() -> Self {
        Self {
            range: 10e-3,
            compliance: 20.0,
        }
    }
}

/// Sources a DC current.
#[async_trait]
pub trait CurrentSource: Send {
    /// Put the source in current mode with the given range and compliance.
    async fn configure(&mut self, limits: SourceLimits) -> AppResult<()>;
    /// Set the output level in amps. Takes effect immediately if enabled.
    async fn set_amplitude(&mut self, amps: f64) -> AppResult<()>;
    /// Turn the output on.
    async fn enable(&mut self) -> AppResult<()>;
    /// Turn the output off.
    async fn disable(&mut self) -> AppResult<()>;
}

/// Single square current pulse, used for switching measurements.
#[derive(Debug, Clone, PartialEq)]
pub struct SquarePulse {
    /// Amplitude in amps.
    pub amplitude: f64,
    /// Width in seconds.
    pub width: f64,
    /// DC offset in amps.
    pub offset: f64,
    /// Delay between arming and firing.
    pub wait_after_arm: Duration,
}

impl Default for SquarePulse {
    fn default() -> Self {
        Self {
            amplitude: 1e-5,
            width: 1e-3,
            offset: 0.0,
            wait_after_arm: Duration::from_secs(2),
        }
    }
}

/// Sources current pulses.
#[async_trait]
pub trait Pulser: Send {
    /// Fire a square pulse.
    async fn pulse_out(&mut self, pulse: &SquarePulse) -> AppResult<()>;
}

/// Outcome of waiting for an actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// The setpoint was reached.
    Stable,
    /// The timeout elapsed first.
    TimedOut,
}

impl Settle {
    /// Turn a timed-out wait into an [`DaqError::ActuatorTimeout`].
    pub fn require(self, actuator: Actuator, timeout: Duration) -> AppResult<()> {
        match self {
            Settle::Stable => Ok(()),
            Settle::TimedOut => Err(DaqError::ActuatorTimeout { actuator, timeout }),
        }
    }
}

/// How the magnet holds its field once the setpoint is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldMode {
    /// The supply keeps driving the magnet.
    #[default]
    Driven,
    /// The persistent switch is closed and the supply ramps down.
    Persistent,
}

/// Cryostat with magnet and horizontal rotator.
#[async_trait]
pub trait Cryostat: Send {
    /// Current temperature in kelvin.
    async fn temperature(&mut self) -> AppResult<f64>;
    /// Start ramping to `kelvin` at `rate` K/min.
    async fn set_temperature(&mut self, kelvin: f64, rate: f64) -> AppResult<()>;
    /// Block until the temperature is stable.
    async fn wait_for_temperature(&mut self, timeout: Duration) -> AppResult<Settle>;

    /// Current field in oersted.
    async fn field(&mut self) -> AppResult<f64>;
    /// Start ramping to `oersted` at `rate` Oe/s.
    async fn set_field(&mut self, oersted: f64, rate: f64, mode: FieldMode) -> AppResult<()>;
    /// Block until the field is stable.
    async fn wait_for_field(&mut self, timeout: Duration) -> AppResult<Settle>;

    /// Current rotator position in degrees.
    async fn position(&mut self) -> AppResult<f64>;
    /// Start rotating to `degrees` at `speed` deg/s.
    async fn set_position(&mut self, degrees: f64, speed: f64) -> AppResult<()>;
    /// Block until the rotator has stopped at its setpoint.
    async fn wait_for_position(&mut self, timeout: Duration) -> AppResult<Settle>;
}

/// Relay matrix switch.
#[async_trait]
pub trait RelaySwitch: Send {
    /// Send one raw text command.
    async fn send_command(&mut self, command: &str) -> AppResult<()>;

    /// Close the relay joining two ports.
    async fn connect(&mut self, first: SwitchPort, second: SwitchPort) -> AppResult<()> {
        self.send_command(&format!("on {},{}", first, second)).await
    }

    /// Open every relay.
    async fn reset(&mut self) -> AppResult<()> {
        self.send_command("reset").await
    }
}
