//! Measurement plan: what is measured at every setpoint.
//!
//! Connection names are resolved to switch ports when a [`MeasurementSpec`]
//! or [`PulseSpec`] is built, so a typo in the rig description is reported
//! before the cryostat moves, and the sweep loop never searches the
//! topology.

use crate::error::{AppResult, DaqError};
use crate::metadata::Metadata;
use crate::sampler::Sampler;
use crate::topology::{InstrumentKind, SwitchPort, Topology};
use std::fmt;

/// A pair of connections to join through the matrix switch.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchRoute {
    /// Connection names as written in the configuration.
    pub connections: (String, String),
    /// Switch ports the names resolved to.
    pub ports: (SwitchPort, SwitchPort),
}

impl SwitchRoute {
    /// Resolve both connection names against `topology`.
    pub fn resolve(topology: &Topology, first: &str, second: &str) -> AppResult<Self> {
        if !topology.has_switch() {
            return Err(DaqError::Configuration(
                "Add a matrix switch before defining switch connections".into(),
            ));
        }
        let ports = topology.resolve_pair(first, second)?;
        Ok(Self {
            connections: (first.to_string(), second.to_string()),
            ports,
        })
    }

    fn resolve_all(topology: &Topology, pairs: &[(String, String)]) -> AppResult<Vec<Self>> {
        pairs
            .iter()
            .map(|(a, b)| Self::resolve(topology, a, b))
            .collect()
    }
}

/// Where the measurement current comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum CurrentDrive {
    /// The named current source is switched on for each sample.
    Source(String),
    /// The plan's continuous current flows throughout the sweep.
    Continuous,
}

/// One named measurement taken at every setpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSpec {
    name: String,
    voltmeter: String,
    drive: CurrentDrive,
    amplitude: f64,
    routes: Vec<SwitchRoute>,
}

impl MeasurementSpec {
    /// Build a measurement, resolving every referenced name.
    pub fn new(
        topology: &Topology,
        name: impl Into<String>,
        voltmeter: &str,
        drive: CurrentDrive,
        amplitude: f64,
        connections: &[(String, String)],
    ) -> AppResult<Self> {
        topology.instrument_of_kind(voltmeter, InstrumentKind::Voltmeter)?;
        if let CurrentDrive::Source(source) = &drive {
            topology.instrument_of_kind(source, InstrumentKind::CurrentSource)?;
        }
        Ok(Self {
            name: name.into(),
            voltmeter: voltmeter.to_string(),
            drive,
            amplitude,
            routes: SwitchRoute::resolve_all(topology, connections)?,
        })
    }

    /// Measurement name, used as the column prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Voltmeter device name.
    pub fn voltmeter(&self) -> &str {
        &self.voltmeter
    }

    /// Current drive.
    pub fn drive(&self) -> &CurrentDrive {
        &self.drive
    }

    /// Current amplitude in amps, as recorded in the data file.
    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    /// Switch routes energised before sampling.
    pub fn routes(&self) -> &[SwitchRoute] {
        &self.routes
    }
}

/// A named current pulse, fired on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseSpec {
    name: String,
    pulser: String,
    amplitude: f64,
    width: f64,
    routes: Vec<SwitchRoute>,
}

impl PulseSpec {
    /// Build a pulse, resolving every referenced name.
    pub fn new(
        topology: &Topology,
        name: impl Into<String>,
        pulser: &str,
        amplitude: f64,
        width: f64,
        connections: &[(String, String)],
    ) -> AppResult<Self> {
        topology.instrument_of_kind(pulser, InstrumentKind::Pulser)?;
        if width <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "pulse width must be positive, got {}",
                width
            )));
        }
        Ok(Self {
            name: name.into(),
            pulser: pulser.to_string(),
            amplitude,
            width,
            routes: SwitchRoute::resolve_all(topology, connections)?,
        })
    }

    /// Pulse name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pulser device name.
    pub fn pulser(&self) -> &str {
        &self.pulser
    }

    /// Amplitude in amps.
    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    /// Width in seconds.
    pub fn width(&self) -> f64 {
        self.width
    }

    /// Switch routes energised before firing.
    pub fn routes(&self) -> &[SwitchRoute] {
        &self.routes
    }
}

/// A current kept flowing for the whole sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousCurrent {
    /// Current source device name.
    pub source: String,
    /// Amplitude in amps.
    pub amplitude: f64,
}

/// Ordered measurements plus everything needed to take them.
#[derive(Debug, Clone)]
pub struct MeasurementPlan {
    metadata: Metadata,
    sampler: Sampler,
    continuous: Option<ContinuousCurrent>,
    measurements: Vec<MeasurementSpec>,
    pulses: Vec<PulseSpec>,
}

impl MeasurementPlan {
    /// An empty plan.
    pub fn new(metadata: Metadata, sampler: Sampler) -> Self {
        Self {
            metadata,
            sampler,
            continuous: None,
            measurements: Vec::new(),
            pulses: Vec::new(),
        }
    }

    /// Keep `source` at `amplitude` for the whole sweep.
    ///
    /// Only allowed with unipolar sampling.
    pub fn set_continuous_current(
        &mut self,
        topology: &Topology,
        source: &str,
        amplitude: f64,
    ) -> AppResult<()> {
        if self.sampler.sampling().bipolar {
            return Err(DaqError::Configuration(
                "A continuous current requires unipolar sampling (set sampling.bipolar = false)"
                    .into(),
            ));
        }
        topology.instrument_of_kind(source, InstrumentKind::CurrentSource)?;
        if let Some(spec) = self
            .measurements
            .iter()
            .find(|m| m.drive == CurrentDrive::Source(source.to_string()))
        {
            return Err(sourced_continuous_error(&spec.name, source));
        }
        self.continuous = Some(ContinuousCurrent {
            source: source.to_string(),
            amplitude,
        });
        for spec in &mut self.measurements {
            if spec.drive == CurrentDrive::Continuous {
                spec.amplitude = amplitude;
            }
        }
        Ok(())
    }

    /// Append a measurement. Names must be unique.
    ///
    /// A continuous-drive measurement takes the continuous amplitude, which
    /// must already be set.
    pub fn add_measurement(&mut self, mut spec: MeasurementSpec) -> AppResult<()> {
        if self.measurements.iter().any(|m| m.name == spec.name) {
            return Err(DaqError::Configuration(format!(
                "A measurement named '{}' already exists",
                spec.name
            )));
        }
        if spec.drive == CurrentDrive::Continuous {
            let continuous = self.continuous.as_ref().ok_or_else(|| {
                DaqError::Configuration(format!(
                    "Measurement '{}' uses the continuous current, define [continuous_current] first",
                    spec.name
                ))
            })?;
            spec.amplitude = continuous.amplitude;
        }
        if let (CurrentDrive::Source(source), Some(continuous)) = (&spec.drive, &self.continuous) {
            if *source == continuous.source {
                return Err(sourced_continuous_error(&spec.name, source));
            }
        }
        self.measurements.push(spec);
        Ok(())
    }

    /// Append a pulse. Names must be unique.
    pub fn add_pulse(&mut self, pulse: PulseSpec) -> AppResult<()> {
        if self.pulses.iter().any(|p| p.name == pulse.name) {
            return Err(DaqError::Configuration(format!(
                "A pulse named '{}' already exists",
                pulse.name
            )));
        }
        self.pulses.push(pulse);
        Ok(())
    }

    /// Run identification.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The sampler every measurement uses.
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// The continuous current, if any.
    pub fn continuous(&self) -> Option<&ContinuousCurrent> {
        self.continuous.as_ref()
    }

    /// Measurements in the order they are taken.
    pub fn measurements(&self) -> &[MeasurementSpec] {
        &self.measurements
    }

    /// Configured pulses.
    pub fn pulses(&self) -> &[PulseSpec] {
        &self.pulses
    }

    /// Look up a pulse by name.
    pub fn pulse(&self, name: &str) -> AppResult<&PulseSpec> {
        self.pulses
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| crate::error::LookupError::NotFound(name.to_string()).into())
    }

    /// Measurement columns, three per measurement.
    pub fn column_names(&self) -> Vec<String> {
        self.measurements
            .iter()
            .flat_map(|m| {
                [
                    format!("{}_DC_Current(A)", m.name),
                    format!("{}_Average_V", m.name),
                    format!("{}_Std_V", m.name),
                ]
            })
            .collect()
    }

    /// The "Measurement Settings" block, with `run` (timing and sweep
    /// settings) appended.
    pub fn settings_header(&self, run: &str) -> String {
        format!(
            "\n*********************\nMeasurement Settings:\n*********************\n{}{}\n",
            self, run
        )
    }
}

// Sampling switches its source off afterwards, which would stop the
// continuous current for every later measurement.
fn sourced_continuous_error(measurement: &str, source: &str) -> DaqError {
    DaqError::Configuration(format!(
        "Measurement '{}' sources '{}', which carries the continuous current; use current_source = \"continuous\"",
        measurement, source
    ))
}

impl fmt::Display for MeasurementPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Continuous current?:")?;
        match &self.continuous {
            Some(cc) => {
                write!(f, "Yes")?;
                write!(f, "\nDevice Name: {}", cc.source)?;
                write!(f, "\nCurrent Amplitude: {:.2}mA", cc.amplitude * 1000.0)?;
            }
            None => write!(f, "No")?,
        }

        write!(f, "\n\nMeasurement List:")?;
        for m in &self.measurements {
            write!(f, "\n\n\t Measurement Name:{}", m.name)?;
            write!(f, "\n\t Voltmeter:{}", m.voltmeter)?;
            if let CurrentDrive::Source(source) = &m.drive {
                write!(f, "\n\t Current Source Name: {}", source)?;
                write!(f, "\n\t Current Amplitude: {:.2}mA", m.amplitude * 1000.0)?;
            }
            write_routes(f, &m.routes)?;
        }

        if !self.pulses.is_empty() {
            write!(f, "\n\nPulse List:")?;
            for p in &self.pulses {
                write!(f, "\n\n\t Pulse Name:{}", p.name)?;
                write!(f, "\n\t Pulser:{}", p.pulser)?;
                write!(f, "\n\t Pulse Amplitude: {:.2}mA", p.amplitude * 1000.0)?;
                write!(f, "\n\t Pulse Width: {:e}s", p.width)?;
                write_routes(f, &p.routes)?;
            }
        }

        let source = self.sampler.source();
        write!(f, "\n\nCurrent Source Settings:")?;
        write!(f, "\n\ncurrent source range: {:.1}(mA)", source.range * 1e3)?;
        write!(
            f,
            "\ncurrent source compliance voltage: {:.1}(V)",
            source.compliance
        )?;

        let s = self.sampler.sampling();
        write!(f, "\n\nVoltage Measurement Settings:")?;
        write!(f, "\n\naverage both current polarities?: {}", s.bipolar)?;
        write!(
            f,
            "\nwait time after current turns on to start measuring: {:.2}(s)",
            s.wait_after_on.as_secs_f64()
        )?;
        write!(
            f,
            "\nnumber of Voltage measurement points per polarity: {}",
            s.num_points
        )?;
        write!(
            f,
            "\ntime per Voltage measurement point: {:.2}(s)",
            s.time_per_point.as_secs_f64()
        )?;
        write!(
            f,
            "\nnumber of Voltage measurement points to skip at ends: {}",
            s.skip_points
        )?;
        write!(
            f,
            "\nnumber of Voltage measurement outlier points to drop at each end: {}",
            s.drop_outliers
        )?;

        write!(f, "\n\nmeasurement note: \n{}", self.metadata.note)?;
        write!(f, "\n\nsample ID: {}", self.metadata.sample_id)?;
        write!(f, "\nmeasurement ID: {}", self.metadata.measurement_id)?;
        write!(f, "\nsoftware version: {}", self.metadata.software_version)
    }
}

fn write_routes(f: &mut fmt::Formatter<'_>, routes: &[SwitchRoute]) -> fmt::Result {
    if routes.is_empty() {
        return Ok(());
    }
    write!(
        f,
        "\n\t {:30}{:14}:",
        "Switch Connection Pairs", "Matrix Switch Addresses"
    )?;
    for r in routes {
        write!(
            f,
            "\n\t {:8}{:5}{:20}{:3}{:3}{:10}",
            r.connections.0,
            ",",
            r.connections.1,
            r.ports.0.to_string(),
            ",",
            r.ports.1.to_string()
        )?;
    }
    Ok(())
}
