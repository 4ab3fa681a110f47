//! SCPI drivers for the Keithley instruments on the GPIB bus.
//!
//! | Model | Role | Trait |
//! |-------|------|-------|
//! | 2182  | nanovoltmeter | [`Voltmeter`] |
//! | 2400  | DC current source | [`CurrentSource`] |
//! | 6221  | waveform current source | [`Pulser`] |

use super::{CurrentSource, Pulser, SourceLimits, SquarePulse, Voltmeter};
use crate::adapters::Adapter;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use tracing::debug;

/// Keithley 2182 nanovoltmeter.
pub struct Keithley2182 {
    name: String,
    adapter: Box<dyn Adapter>,
}

impl Keithley2182 {
    /// Wrap an opened adapter.
    pub fn new(name: impl Into<String>, adapter: Box<dyn Adapter>) -> Self {
        Self {
            name: name.into(),
            adapter,
        }
    }
}

#[async_trait]
impl Voltmeter for Keithley2182 {
    async fn fetch(&mut self) -> AppResult<f64> {
        let response = self.adapter.query("fetch?").await?;
        response.trim().parse::<f64>().map_err(|e| {
            DaqError::io(
                &self.name,
                format!("unparseable reading '{}': {}", response, e),
            )
        })
    }
}

/// Keithley 2400 source meter in current-source mode.
pub struct Keithley2400 {
    name: String,
    adapter: Box<dyn Adapter>,
}

impl Keithley2400 {
    /// Wrap an opened adapter.
    pub fn new(name: impl Into<String>, adapter: Box<dyn Adapter>) -> Self {
        Self {
            name: name.into(),
            adapter,
        }
    }
}

#[async_trait]
impl CurrentSource for Keithley2400 {
    async fn configure(&mut self, limits: SourceLimits) -> AppResult<()> {
        debug!(
            instrument = %self.name,
            range = limits.range,
            compliance = limits.compliance,
            "Configuring current source"
        );
        self.adapter.write(":SOUR:FUNC CURR").await?;
        self.adapter.write(":SOUR:CURR:MODE FIX").await?;
        self.adapter
            .write(&format!(":SOUR:CURR:RANG {:e}", limits.range))
            .await?;
        self.adapter
            .write(&format!(":SENS:VOLT:PROT {}", limits.compliance))
            .await
    }

    async fn set_amplitude(&mut self, amps: f64) -> AppResult<()> {
        self.adapter
            .write(&format!(":SOUR:CURR:LEV {:e}", amps))
            .await
    }

    async fn enable(&mut self) -> AppResult<()> {
        self.adapter.write(":OUTP ON").await
    }

    async fn disable(&mut self) -> AppResult<()> {
        self.adapter.write(":SOUR:CURR:LEV 0").await?;
        self.adapter.write(":OUTP OFF").await
    }
}

/// Keithley 6221 AC/DC current source.
pub struct Keithley6221 {
    adapter: Box<dyn Adapter>,
}

impl Keithley6221 {
    /// Wrap an opened adapter.
    pub fn new(adapter: Box<dyn Adapter>) -> Self {
        Self { adapter }
    }

    async fn arm_and_start(&mut self, wait_after_arm: std::time::Duration) -> AppResult<()> {
        self.adapter.write("SOUR:WAVE:ARM").await?;
        tokio::time::sleep(wait_after_arm).await;
        self.adapter.write("SOUR:WAVE:INIT").await
    }
}

#[async_trait]
impl Pulser for Keithley6221 {
    async fn pulse_out(&mut self, pulse: &SquarePulse) -> AppResult<()> {
        self.adapter.write("SOUR:WAVE:ABOR").await?;
        self.adapter.write("SOUR:WAVE:FUNC SQUARE").await?;
        self.adapter.write("SOUR:WAVE:FREQ 1").await?;
        self.adapter
            .write(&format!("SOUR:WAVE:OFFS {}", pulse.offset))
            .await?;
        self.adapter
            .write(&format!("SOUR:WAVE:AMPL {}", pulse.amplitude))
            .await?;
        self.adapter
            .write(&format!("SOUR:WAVE:DUR:TIME {}", pulse.width))
            .await?;
        self.arm_and_start(pulse.wait_after_arm).await
    }
}
