//! Mock Hardware Implementations
//!
//! Provides simulated instruments for running the rig without hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `SimBench` - Shared sample model: a linear resistor fed by every enabled source
//! - `MockVoltmeter` - Reads the bench, or replays a scripted list of readings
//! - `MockCurrentSource` - Drives current into the bench
//! - `MockPulser` - Records fired pulses
//! - `MockCryostat` - Temperature, field and rotator with a fixed settle delay
//! - `MockSwitch` - Records relay commands
//!
//! Every mock is `Clone` and clones share state, so a test can keep a handle
//! after handing the instrument to a [`crate::rig::Rig`].

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::error::{Actuator, AppResult, DaqError};
use crate::instrument::{
    CurrentSource, Cryostat, FieldMode, Pulser, RelaySwitch, Settle, SourceLimits,
    SquarePulse, Voltmeter,
};

// =============================================================================
// SimBench - Simulated Sample
// =============================================================================

/// Electrical model of the sample under test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleModel {
    /// Resistance in ohms.
    pub resistance: f64,
    /// Thermal offset voltage in volts.
    pub offset: f64,
    /// Peak amplitude of uniform noise added to each reading, in volts.
    pub noise: f64,
}

impl Default for SampleModel {
    fn default() -> Self {
        Self {
            resistance: 100.0,
            offset: 0.0,
            noise: 0.0,
        }
    }
}

struct BenchState {
    model: SampleModel,
    outputs: HashMap<String, f64>,
    rng: StdRng,
}

/// Shared state of the simulated sample.
///
/// Current sources register their output here and voltmeters read
/// `V = R * sum(I) + offset + noise`.
#[derive(Clone)]
pub struct SimBench {
    state: Arc<RwLock<BenchState>>,
}

impl SimBench {
    /// Create a bench with a seeded noise generator.
    pub fn new(model: SampleModel, seed: u64) -> Self {
        Self {
            state: Arc::new(RwLock::new(BenchState {
                model,
                outputs: HashMap::new(),
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    /// Total current currently flowing through the sample.
    pub async fn current(&self) -> f64 {
        self.state.read().await.outputs.values().sum()
    }

    async fn set_output(&self, source: &str, amps: Option<f64>) {
        let mut state = self.state.write().await;
        match amps {
            Some(amps) => state.outputs.insert(source.to_string(), amps),
            None => state.outputs.remove(source),
        };
    }

    async fn voltage(&self) -> f64 {
        let mut state = self.state.write().await;
        let current: f64 = state.outputs.values().sum();
        let model = state.model;
        let noise = if model.noise > 0.0 {
            state.rng.gen_range(-model.noise..=model.noise)
        } else {
            0.0
        };
        model.resistance * current + model.offset + noise
    }
}

impl Default for SimBench {
    fn default() -> Self {
        Self::new(SampleModel::default(), 0)
    }
}

// =============================================================================
// MockVoltmeter
// =============================================================================

enum Readings {
    Bench(SimBench),
    Script(VecDeque<f64>),
    Failing(String),
}

/// Simulated nanovoltmeter.
#[derive(Clone)]
pub struct MockVoltmeter {
    name: String,
    readings: Arc<RwLock<Readings>>,
    fetches: Arc<RwLock<usize>>,
}

impl MockVoltmeter {
    /// Voltmeter that measures the simulated sample.
    pub fn new(name: impl Into<String>, bench: SimBench) -> Self {
        Self::with_readings_source(name, Readings::Bench(bench))
    }

    /// Voltmeter that returns `values` in order and errors once they run out.
    pub fn scripted(name: impl Into<String>, values: impl IntoIterator<Item = f64>) -> Self {
        Self::with_readings_source(name, Readings::Script(values.into_iter().collect()))
    }

    /// Voltmeter whose every fetch fails with an I/O error.
    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_readings_source(name, Readings::Failing(message.into()))
    }

    fn with_readings_source(name: impl Into<String>, readings: Readings) -> Self {
        Self {
            name: name.into(),
            readings: Arc::new(RwLock::new(readings)),
            fetches: Arc::new(RwLock::new(0)),
        }
    }

    /// Number of fetches issued so far.
    pub async fn fetch_count(&self) -> usize {
        *self.fetches.read().await
    }
}

#[async_trait]
impl Voltmeter for MockVoltmeter {
    async fn fetch(&mut self) -> AppResult<f64> {
        *self.fetches.write().await += 1;
        let mut readings = self.readings.write().await;
        match &mut *readings {
            Readings::Bench(bench) => Ok(bench.voltage().await),
            Readings::Script(values) => values
                .pop_front()
                .ok_or_else(|| DaqError::io(&self.name, "scripted readings exhausted")),
            Readings::Failing(message) => Err(DaqError::io(&self.name, message.clone())),
        }
    }
}

// =============================================================================
// MockCurrentSource
// =============================================================================

/// Recorded state of a simulated current source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceState {
    /// Last limits passed to `configure`, if any.
    pub limits: Option<SourceLimits>,
    /// Programmed level in amps.
    pub amplitude: f64,
    /// Whether the output is on.
    pub enabled: bool,
    /// Every level that was applied with the output on, in order.
    pub applied: Vec<f64>,
}

/// Simulated DC current source feeding a [`SimBench`].
#[derive(Clone)]
pub struct MockCurrentSource {
    name: String,
    bench: SimBench,
    state: Arc<RwLock<SourceState>>,
}

impl MockCurrentSource {
    /// Create a source attached to `bench`.
    pub fn new(name: impl Into<String>, bench: SimBench) -> Self {
        Self {
            name: name.into(),
            bench,
            state: Arc::new(RwLock::new(SourceState::default())),
        }
    }

    /// Snapshot of the source state.
    pub async fn state(&self) -> SourceState {
        self.state.read().await.clone()
    }

    async fn sync_bench(&self) {
        let state = self.state.read().await;
        let output = state.enabled.then_some(state.amplitude);
        self.bench.set_output(&self.name, output).await;
    }
}

#[async_trait]
impl CurrentSource for MockCurrentSource {
    async fn configure(&mut self, limits: SourceLimits) -> AppResult<()> {
        self.state.write().await.limits = Some(limits);
        Ok(())
    }

    async fn set_amplitude(&mut self, amps: f64) -> AppResult<()> {
        {
            let mut state = self.state.write().await;
            state.amplitude = amps;
            if state.enabled {
                state.applied.push(amps);
            }
        }
        self.sync_bench().await;
        Ok(())
    }

    async fn enable(&mut self) -> AppResult<()> {
        {
            let mut state = self.state.write().await;
            if !state.enabled {
                state.enabled = true;
                let amps = state.amplitude;
                state.applied.push(amps);
            }
        }
        debug!(source = %self.name, "MockCurrentSource: output on");
        self.sync_bench().await;
        Ok(())
    }

    async fn disable(&mut self) -> AppResult<()> {
        {
            let mut state = self.state.write().await;
            state.enabled = false;
            state.amplitude = 0.0;
        }
        debug!(source = %self.name, "MockCurrentSource: output off");
        self.sync_bench().await;
        Ok(())
    }
}

// =============================================================================
// MockPulser
// =============================================================================

/// Simulated pulse source. Pulses are recorded, not applied to the bench.
#[derive(Clone, Default)]
pub struct MockPulser {
    pulses: Arc<RwLock<Vec<SquarePulse>>>,
}

impl MockPulser {
    /// Create a pulser with an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pulse fired so far.
    pub async fn pulses(&self) -> Vec<SquarePulse> {
        self.pulses.read().await.clone()
    }
}

#[async_trait]
impl Pulser for MockPulser {
    async fn pulse_out(&mut self, pulse: &SquarePulse) -> AppResult<()> {
        sleep(pulse.wait_after_arm).await;
        debug!(
            amplitude = pulse.amplitude,
            width = pulse.width,
            "MockPulser: pulse"
        );
        self.pulses.write().await.push(pulse.clone());
        Ok(())
    }
}

// =============================================================================
// MockCryostat
// =============================================================================

#[derive(Debug, Clone)]
struct CryostatState {
    temperature: f64,
    field: f64,
    position: f64,
    field_mode: FieldMode,
    stuck: Option<Actuator>,
}

/// Simulated cryostat with magnet and rotator.
///
/// Setpoints are reached after `settle` unless the actuator has been marked
/// stuck with [`MockCryostat::stick`], in which case the reading never moves
/// and every wait runs out its timeout.
#[derive(Clone)]
pub struct MockCryostat {
    state: Arc<RwLock<CryostatState>>,
    settle: Duration,
}

impl MockCryostat {
    /// Cryostat at room temperature, zero field, zero angle.
    pub fn new(settle: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(CryostatState {
                temperature: 300.0,
                field: 0.0,
                position: 0.0,
                field_mode: FieldMode::Driven,
                stuck: None,
            })),
            settle,
        }
    }

    /// Make one actuator ignore its setpoints.
    pub async fn stick(&self, actuator: Actuator) {
        self.state.write().await.stuck = Some(actuator);
    }

    /// Mode of the last field command.
    pub async fn field_mode(&self) -> FieldMode {
        self.state.read().await.field_mode
    }

    async fn is_stuck(&self, actuator: Actuator) -> bool {
        self.state.read().await.stuck == Some(actuator)
    }

    async fn wait_for(&self, actuator: Actuator, timeout: Duration) -> Settle {
        if self.is_stuck(actuator).await {
            sleep(timeout).await;
            return Settle::TimedOut;
        }
        if self.settle > timeout {
            sleep(timeout).await;
            return Settle::TimedOut;
        }
        sleep(self.settle).await;
        Settle::Stable
    }
}

impl Default for MockCryostat {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

#[async_trait]
impl Cryostat for MockCryostat {
    async fn temperature(&mut self) -> AppResult<f64> {
        Ok(self.state.read().await.temperature)
    }

    async fn set_temperature(&mut self, kelvin: f64, rate: f64) -> AppResult<()> {
        debug!(kelvin, rate, "MockCryostat: temperature setpoint");
        let mut state = self.state.write().await;
        if state.stuck != Some(Actuator::Temperature) {
            state.temperature = kelvin;
        }
        Ok(())
    }

    async fn wait_for_temperature(&mut self, timeout: Duration) -> AppResult<Settle> {
        Ok(self.wait_for(Actuator::Temperature, timeout).await)
    }

    async fn field(&mut self) -> AppResult<f64> {
        Ok(self.state.read().await.field)
    }

    async fn set_field(&mut self, oersted: f64, rate: f64, mode: FieldMode) -> AppResult<()> {
        debug!(oersted, rate, ?mode, "MockCryostat: field setpoint");
        let mut state = self.state.write().await;
        state.field_mode = mode;
        if state.stuck != Some(Actuator::Magnet) {
            state.field = oersted;
        }
        Ok(())
    }

    async fn wait_for_field(&mut self, timeout: Duration) -> AppResult<Settle> {
        Ok(self.wait_for(Actuator::Magnet, timeout).await)
    }

    async fn position(&mut self) -> AppResult<f64> {
        Ok(self.state.read().await.position)
    }

    async fn set_position(&mut self, degrees: f64, speed: f64) -> AppResult<()> {
        debug!(degrees, speed, "MockCryostat: rotator setpoint");
        let mut state = self.state.write().await;
        if state.stuck != Some(Actuator::Rotator) {
            state.position = degrees;
        }
        Ok(())
    }

    async fn wait_for_position(&mut self, timeout: Duration) -> AppResult<Settle> {
        Ok(self.wait_for(Actuator::Rotator, timeout).await)
    }
}

// =============================================================================
// MockSwitch
// =============================================================================

/// Simulated relay matrix that records every command.
#[derive(Clone, Default)]
pub struct MockSwitch {
    commands: Arc<RwLock<Vec<String>>>,
}

impl MockSwitch {
    /// Create a switch with an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command received so far.
    pub async fn commands(&self) -> Vec<String> {
        self.commands.read().await.clone()
    }
}

#[async_trait]
impl RelaySwitch for MockSwitch {
    async fn send_command(&mut self, command: &str) -> AppResult<()> {
        debug!(command, "MockSwitch: command");
        self.commands.write().await.push(command.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::SwitchPort;

    #[tokio::test]
    async fn test_bench_is_ohmic() {
        let bench = SimBench::new(
            SampleModel {
                resistance: 50.0,
                offset: 1e-6,
                noise: 0.0,
            },
            7,
        );
        let mut source = MockCurrentSource::new("CurrentSource", bench.clone());
        let mut vm = MockVoltmeter::new("Voltmeter", bench.clone());

        assert!((vm.fetch().await.unwrap() - 1e-6).abs() < 1e-15);

        source.set_amplitude(1e-3).await.unwrap();
        source.enable().await.unwrap();
        assert!((vm.fetch().await.unwrap() - (0.05 + 1e-6)).abs() < 1e-12);

        source.disable().await.unwrap();
        assert_eq!(bench.current().await, 0.0);
        assert_eq!(source.state().await.applied, vec![1e-3]);
    }

    #[tokio::test]
    async fn test_noise_is_bounded_and_seeded() {
        let model = SampleModel {
            resistance: 1.0,
            offset: 0.0,
            noise: 1e-3,
        };
        let mut a = MockVoltmeter::new("A", SimBench::new(model, 42));
        let mut b = MockVoltmeter::new("B", SimBench::new(model, 42));
        for _ in 0..20 {
            let va = a.fetch().await.unwrap();
            assert!(va.abs() <= 1e-3);
            assert_eq!(va, b.fetch().await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_scripted_voltmeter_runs_out() {
        let mut vm = MockVoltmeter::scripted("Voltmeter", [1.0, 2.0]);
        assert_eq!(vm.fetch().await.unwrap(), 1.0);
        assert_eq!(vm.fetch().await.unwrap(), 2.0);
        assert!(matches!(
            vm.fetch().await,
            Err(DaqError::InstrumentIo { .. })
        ));
        assert_eq!(vm.fetch_count().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cryostat_reaches_setpoints() {
        let mut cryo = MockCryostat::default();
        cryo.set_temperature(10.0, 5.0).await.unwrap();
        cryo.set_field(5000.0, 100.0, FieldMode::Persistent)
            .await
            .unwrap();
        let settle = cryo
            .wait_for_field(Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(settle, Settle::Stable);
        assert_eq!(cryo.temperature().await.unwrap(), 10.0);
        assert_eq!(cryo.field().await.unwrap(), 5000.0);
        assert_eq!(cryo.field_mode().await, FieldMode::Persistent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_rotator_times_out() {
        let mut cryo = MockCryostat::default();
        cryo.stick(Actuator::Rotator).await;
        cryo.set_position(90.0, 5.0).await.unwrap();

        let start = tokio::time::Instant::now();
        let settle = cryo
            .wait_for_position(Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(settle, Settle::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(cryo.position().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_switch_records_connect_and_reset() {
        let mut switch = MockSwitch::new();
        let log = switch.clone();
        switch
            .connect(SwitchPort::new('a').unwrap(), SwitchPort::new('p').unwrap())
            .await
            .unwrap();
        switch.reset().await.unwrap();
        assert_eq!(log.commands().await, vec!["on a,p", "reset"]);
    }
}
