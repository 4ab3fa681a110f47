//! Configuration System using Figment
//!
//! The whole rig is described in one TOML file: which instruments exist and
//! where their leads are patched, what to measure, and what to sweep.
//! Configuration is loaded from:
//! 1. the TOML file given on the command line (default `config/rig.toml`)
//! 2. Environment variables (prefixed with `PPMS_DAQ_`, `__` between levels)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! PPMS_DAQ_APPLICATION__LOG_LEVEL=debug
//! PPMS_DAQ_STORAGE__SAMPLE_ID=Pt_YIG_02
//! PPMS_DAQ_SAMPLING__NUM_POINTS=50
//! ```
//!
//! # Example
//!
//! ```toml
//! [switch]
//! address = "192.168.0.8"
//!
//! [[puck]]
//! pin = 7
//! name = "HB+"
//! port = "a"
//!
//! [[instruments]]
//! model = "keithley2182"
//! gpib = 7
//! terminals = [{ name = "V+", port = "p" }, { name = "V-", port = "n" }]
//!
//! [[measurements]]
//! name = "Rxx"
//! amplitude = 1e-4
//! switch = [["HB+", "V+"]]
//!
//! [sweep]
//! angle = { nodes = [0, 360], steps = [10] }
//! field = 1000
//! temperature = 300
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::mock::SampleModel;
use crate::hardware::LinkBoneOptions;
use crate::metadata::{Metadata, MetadataBuilder};
use crate::plan::{CurrentDrive, MeasurementPlan, MeasurementSpec, PulseSpec};
use crate::sampler::{Sampler, SamplingOptions, SourceOptions};
use crate::sweep::{RampOptions, Setpoints, Sweep, TimingOptions};
use crate::topology::{Endpoint, InstrumentModel, InstrumentRecord, SwitchPort, Terminal, Topology};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/rig.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "PPMS_DAQ_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationSettings,
    /// Cryostat, if one is part of the rig
    pub ppms: Option<PpmsSettings>,
    /// Relay matrix switch, if one is part of the rig
    pub switch: Option<SwitchSettings>,
    /// Sample model used by simulated instruments
    pub simulation: SimulationSettings,
    /// GPIB instruments
    pub instruments: Vec<InstrumentSettings>,
    /// Rotator puck pins
    pub puck: Vec<PuckSettings>,
    /// Voltage sampling
    pub sampling: SamplingOptions,
    /// Current source range and compliance
    pub source: SourceOptions,
    /// Current kept on for the whole sweep
    pub continuous_current: Option<ContinuousCurrentSettings>,
    /// Measurements taken at every setpoint
    pub measurements: Vec<MeasurementSettings>,
    /// Pulses that can be fired on demand
    pub pulses: Vec<PulseSettings>,
    /// Swept and fixed parameters
    pub sweep: SweepSettings,
    /// Waits and timeouts
    pub timing: TimingOptions,
    /// Output location and run identification
    pub storage: StorageSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "ppms_daq".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Cryostat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PpmsSettings {
    /// IP address of the PPMS control computer
    #[serde(default = "default_ppms_address")]
    pub address: String,
    /// Use a simulated cryostat
    #[serde(default)]
    pub simulated: bool,
    /// Ramp rates
    #[serde(flatten)]
    pub ramps: RampOptions,
}

/// Matrix switch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchSettings {
    /// Host or host:port of the switch
    #[serde(default = "default_switch_address")]
    pub address: String,
    /// Use a simulated switch
    #[serde(default)]
    pub simulated: bool,
    /// Keep-alive period, zero to disable
    #[serde(default = "default_keepalive", with = "humantime_serde")]
    pub keepalive: Duration,
    /// Pause after each command before its reply is read
    #[serde(default = "default_command_settle", with = "humantime_serde")]
    pub command_settle: Duration,
}

impl SwitchSettings {
    /// Telnet session options for the hardware switch.
    pub fn options(&self) -> LinkBoneOptions {
        LinkBoneOptions {
            keepalive: (!self.keepalive.is_zero()).then_some(self.keepalive),
            command_settle: self.command_settle,
            ..LinkBoneOptions::default()
        }
    }
}

/// Parameters of the simulated sample and cryostat
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Sample resistance in ohms
    pub resistance: f64,
    /// Offset voltage in volts
    pub offset: f64,
    /// Peak noise in volts
    pub noise: f64,
    /// Noise generator seed
    pub seed: u64,
    /// Time a simulated actuator takes to settle
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        let model = SampleModel::default();
        Self {
            resistance: model.resistance,
            offset: model.offset,
            noise: model.noise,
            seed: 0,
            settle: Duration::from_millis(50),
        }
    }
}

impl SimulationSettings {
    /// The electrical model of the simulated sample.
    pub fn sample_model(&self) -> SampleModel {
        SampleModel {
            resistance: self.resistance,
            offset: self.offset,
            noise: self.noise,
        }
    }
}

/// One GPIB instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSettings {
    /// Device name; defaults to the role ("Voltmeter", "CurrentSource", "Pulser")
    #[serde(default)]
    pub name: Option<String>,
    /// Instrument model
    pub model: InstrumentModel,
    /// GPIB primary address
    pub gpib: u8,
    /// Use a simulated instrument
    #[serde(default)]
    pub simulated: bool,
    /// VISA I/O timeout
    #[serde(default = "default_visa_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Leads patched into the switch
    #[serde(default)]
    pub terminals: Vec<TerminalSettings>,
}

impl InstrumentSettings {
    /// Device name, falling back to the role name.
    pub fn device_name(&self) -> &str {
        self.name
            .as_deref()
            .unwrap_or_else(|| self.model.default_name())
    }
}

/// One instrument lead
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSettings {
    /// Connection name
    pub name: String,
    /// Switch port
    pub port: SwitchPort,
}

/// One rotator puck pin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PuckSettings {
    /// Pin number, 7 to 14
    pub pin: u8,
    /// Connection name
    pub name: String,
    /// Switch port, top row only
    #[serde(default)]
    pub port: Option<SwitchPort>,
}

/// Continuous current configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousCurrentSettings {
    /// Current source device name
    #[serde(default = "default_current_source")]
    pub source: String,
    /// Amplitude in amps
    pub amplitude: f64,
}

/// One measurement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementSettings {
    /// Measurement name
    pub name: String,
    /// Voltmeter device name
    #[serde(default = "default_voltmeter")]
    pub voltmeter: String,
    /// Current source device name, or "continuous"
    #[serde(default = "default_current_source")]
    pub current_source: String,
    /// Current amplitude in amps
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
    /// Connection pairs to join through the switch
    #[serde(default)]
    pub switch: Vec<[String; 2]>,
}

impl MeasurementSettings {
    /// The current drive named by `current_source`.
    pub fn drive(&self) -> CurrentDrive {
        if self.current_source.eq_ignore_ascii_case(CONTINUOUS) {
            CurrentDrive::Continuous
        } else {
            CurrentDrive::Source(self.current_source.clone())
        }
    }
}

const CONTINUOUS: &str = "continuous";

/// One pulse
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseSettings {
    /// Pulse name
    pub name: String,
    /// Pulser device name
    #[serde(default = "default_pulser")]
    pub pulser: String,
    /// Amplitude in amps
    #[serde(default = "default_pulse_amplitude")]
    pub amplitude: f64,
    /// Width in seconds
    #[serde(default = "default_pulse_width")]
    pub width: f64,
    /// Delay between arming and firing
    #[serde(default = "default_wait_after_arm", with = "humantime_serde")]
    pub wait_after_arm: Duration,
    /// Connection pairs to join through the switch
    #[serde(default)]
    pub switch: Vec<[String; 2]>,
}

/// Swept and fixed parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// Rotator angle in degrees; omit when the rotator is not used
    pub angle: Option<Setpoints>,
    /// Field in oersted
    pub field: Setpoints,
    /// Temperature in kelvin
    pub temperature: Setpoints,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            angle: None,
            field: Setpoints::Scalar(100.0),
            temperature: Setpoints::Scalar(300.0),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root folder for data files
    pub save_folder: PathBuf,
    /// Sample under test, used as a sub-folder
    pub sample_id: String,
    /// Run identifier, used in the file name
    pub measurement_id: String,
    /// Free-text note written to the header
    pub note: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            save_folder: PathBuf::from("./data/PPMS_SMR/"),
            sample_id: String::new(),
            measurement_id: String::new(),
            note: String::new(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_ppms_address() -> String {
    "192.168.0.7".to_string()
}

fn default_switch_address() -> String {
    "192.168.0.8".to_string()
}

fn default_keepalive() -> Duration {
    Duration::from_secs(30)
}

fn default_command_settle() -> Duration {
    Duration::from_millis(100)
}

fn default_visa_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_voltmeter() -> String {
    "Voltmeter".to_string()
}

fn default_current_source() -> String {
    "CurrentSource".to_string()
}

fn default_pulser() -> String {
    "Pulser".to_string()
}

fn default_amplitude() -> f64 {
    1e-4
}

fn default_pulse_amplitude() -> f64 {
    1e-3
}

fn default_pulse_width() -> f64 {
    5e-6
}

fn default_wait_after_arm() -> Duration {
    Duration::from_secs(2)
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DaqError::Configuration(format!(
                "configuration file '{}' not found",
                path.display()
            )));
        }
        let settings: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Sampling leaves readings after skipping and trimming
    /// - Instrument, measurement and pulse names are unique
    pub fn validate(&self) -> AppResult<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_log_levels.join(", ")
            )));
        }

        self.sampling.kept_count()?;

        unique("instrument", self.instruments.iter().map(|i| i.device_name()))?;
        unique("measurement", self.measurements.iter().map(|m| m.name.as_str()))?;
        unique("pulse", self.pulses.iter().map(|p| p.name.as_str()))?;
        Ok(())
    }

    /// Build the connection registry.
    pub fn topology(&self) -> AppResult<Topology> {
        let mut topology = Topology::new();
        if let Some(ppms) = &self.ppms {
            topology.attach_ppms(Endpoint {
                address: ppms.address.clone(),
                simulated: ppms.simulated,
            });
        }
        if let Some(switch) = &self.switch {
            topology.attach_switch(Endpoint {
                address: switch.address.clone(),
                simulated: switch.simulated,
            });
        }
        for i in &self.instruments {
            let terminals = i
                .terminals
                .iter()
                .map(|t| Terminal {
                    name: t.name.clone(),
                    port: t.port,
                })
                .collect();
            let record = InstrumentRecord::new(i.device_name(), i.model, i.gpib, terminals)?
                .simulated(i.simulated);
            topology.add_instrument(record)?;
        }
        for p in &self.puck {
            topology.add_puck_connection(p.pin, p.name.clone(), p.port)?;
        }
        Ok(topology)
    }

    /// Run identification.
    pub fn metadata(&self) -> Metadata {
        MetadataBuilder::new()
            .sample_id(&self.storage.sample_id)
            .measurement_id(&self.storage.measurement_id)
            .note(&self.storage.note)
            .build()
    }

    /// Build the measurement plan, resolving every name against `topology`.
    pub fn plan(&self, topology: &Topology) -> AppResult<MeasurementPlan> {
        let sampler = Sampler::new(self.sampling.clone(), self.source);
        let mut plan = MeasurementPlan::new(self.metadata(), sampler);

        if let Some(cc) = &self.continuous_current {
            plan.set_continuous_current(topology, &cc.source, cc.amplitude)?;
        }
        for m in &self.measurements {
            let spec = MeasurementSpec::new(
                topology,
                m.name.clone(),
                &m.voltmeter,
                m.drive(),
                m.amplitude,
                &pairs(&m.switch),
            )?;
            plan.add_measurement(spec)?;
        }
        for p in &self.pulses {
            let pulse = PulseSpec::new(
                topology,
                p.name.clone(),
                &p.pulser,
                p.amplitude,
                p.width,
                &pairs(&p.switch),
            )?;
            plan.add_pulse(pulse)?;
        }
        Ok(plan)
    }

    /// Work out the sweep from the `[sweep]` section.
    pub fn sweep(&self) -> AppResult<Sweep> {
        Sweep::from_parameters(
            self.sweep.angle.as_ref(),
            &self.sweep.field,
            &self.sweep.temperature,
        )
    }

    /// Ramp rates, defaults when no cryostat is configured.
    pub fn ramps(&self) -> RampOptions {
        self.ppms.as_ref().map(|p| p.ramps).unwrap_or_default()
    }

    /// Wait before firing a configured pulse.
    pub fn pulse_wait_after_arm(&self, name: &str) -> Duration {
        self.pulses
            .iter()
            .find(|p| p.name == name)
            .map_or_else(default_wait_after_arm, |p| p.wait_after_arm)
    }
}

fn pairs(switch: &[[String; 2]]) -> Vec<(String, String)> {
    switch
        .iter()
        .map(|[a, b]| (a.clone(), b.clone()))
        .collect()
}

fn unique<'a>(what: &str, names: impl Iterator<Item = &'a str>) -> AppResult<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(DaqError::Configuration(format!(
                "Duplicate {} name: {}",
                what, name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.application.log_level, "info");
        assert_eq!(settings.sampling.num_points, 30);
        assert_eq!(settings.timing.position_timeout, Duration::from_secs(1200));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(matches!(
            settings.validate(),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_default_instrument_names() {
        let settings: Settings = Figment::new()
            .merge(Toml::string(
                r#"
                [[instruments]]
                model = "keithley2182"
                gpib = 7

                [[instruments]]
                model = "2182"
                gpib = 8
                "#,
            ))
            .extract()
            .unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate instrument name: Voltmeter"));
    }

    #[test]
    fn test_zero_keepalive_disables_pinging() {
        let mut switch = SwitchSettings {
            address: default_switch_address(),
            simulated: false,
            keepalive: Duration::ZERO,
            command_settle: Duration::from_millis(250),
        };
        let options = switch.options();
        assert_eq!(options.keepalive, None);
        assert_eq!(options.command_settle, Duration::from_millis(250));

        switch.keepalive = default_keepalive();
        assert_eq!(switch.options().keepalive, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_continuous_keyword() {
        let m = MeasurementSettings {
            name: "Rxx".into(),
            voltmeter: default_voltmeter(),
            current_source: "Continuous".into(),
            amplitude: 0.0,
            switch: vec![],
        };
        assert_eq!(m.drive(), CurrentDrive::Continuous);
    }
}
