//! The assembled rig.
//!
//! A [`Rig`] owns one driver per device in the [`Topology`], real or
//! simulated, and knows how to route the matrix switch around a measurement.
//! Routing is scoped: the relays for a measurement or pulse are closed, the
//! work is done, and the switch is reset afterwards whatever the outcome.

use crate::adapters::{Adapter, VisaAdapter};
use crate::config::Settings;
use crate::data::Reading;
use crate::error::{AppResult, DaqError};
use crate::hardware::{
    LinkBoneSwitch, MockCryostat, MockCurrentSource, MockPulser, MockSwitch, MockVoltmeter,
    SimBench,
};
use crate::instrument::keithley::{Keithley2182, Keithley2400, Keithley6221};
use crate::instrument::{
    Cryostat, CurrentSource, Pulser, RelaySwitch, SourceLimits, SquarePulse, Voltmeter,
};
use crate::plan::{ContinuousCurrent, CurrentDrive, MeasurementSpec, PulseSpec, SwitchRoute};
use crate::sampler::{Drive, Sampler};
use crate::topology::{InstrumentKind, Topology};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Device drivers keyed by device name.
pub struct Rig {
    topology: Topology,
    voltmeters: HashMap<String, Box<dyn Voltmeter>>,
    sources: HashMap<String, Box<dyn CurrentSource>>,
    pulsers: HashMap<String, Box<dyn Pulser>>,
    cryostat: Option<Box<dyn Cryostat>>,
    switch: Option<Box<dyn RelaySwitch>>,
}

impl Rig {
    /// A rig with no drivers attached yet.
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            voltmeters: HashMap::new(),
            sources: HashMap::new(),
            pulsers: HashMap::new(),
            cryostat: None,
            switch: None,
        }
    }

    /// Attach a voltmeter driver.
    pub fn with_voltmeter(mut self, name: impl Into<String>, driver: Box<dyn Voltmeter>) -> Self {
        self.voltmeters.insert(name.into(), driver);
        self
    }

    /// Attach a current source driver.
    pub fn with_current_source(
        mut self,
        name: impl Into<String>,
        driver: Box<dyn CurrentSource>,
    ) -> Self {
        self.sources.insert(name.into(), driver);
        self
    }

    /// Attach a pulser driver.
    pub fn with_pulser(mut self, name: impl Into<String>, driver: Box<dyn Pulser>) -> Self {
        self.pulsers.insert(name.into(), driver);
        self
    }

    /// Attach the cryostat driver.
    pub fn with_cryostat(mut self, driver: Box<dyn Cryostat>) -> Self {
        self.cryostat = Some(driver);
        self
    }

    /// Attach the switch driver.
    pub fn with_switch(mut self, driver: Box<dyn RelaySwitch>) -> Self {
        self.switch = Some(driver);
        self
    }

    /// Build the topology from `settings` and open every device it names.
    ///
    /// Simulated instruments share one [`SimBench`], so a simulated voltmeter
    /// sees the current of every simulated source.
    pub async fn from_settings(settings: &Settings) -> AppResult<Self> {
        let topology = settings.topology()?;
        let bench = SimBench::new(
            settings.simulation.sample_model(),
            settings.simulation.seed,
        );
        let mut rig = Self::new(topology.clone());

        for instrument in &settings.instruments {
            let record = topology.instrument(instrument.device_name())?;
            let name = record.name().to_string();
            if record.is_simulated() {
                info!("Using simulated {} '{}'", record.kind(), name);
                rig = match record.kind() {
                    InstrumentKind::Voltmeter => {
                        let vm = MockVoltmeter::new(name.clone(), bench.clone());
                        rig.with_voltmeter(name, Box::new(vm))
                    }
                    InstrumentKind::CurrentSource => {
                        let source = MockCurrentSource::new(name.clone(), bench.clone());
                        rig.with_current_source(name, Box::new(source))
                    }
                    InstrumentKind::Pulser => rig.with_pulser(name, Box::new(MockPulser::new())),
                };
                continue;
            }

            let mut adapter =
                VisaAdapter::gpib(record.gpib_address()).with_timeout(instrument.timeout);
            adapter.connect().await?;
            info!("Connected to {}", adapter.info());
            let adapter: Box<dyn Adapter> = Box::new(adapter);
            rig = match record.kind() {
                InstrumentKind::Voltmeter => {
                    let driver = Keithley2182::new(name.clone(), adapter);
                    rig.with_voltmeter(name, Box::new(driver))
                }
                InstrumentKind::CurrentSource => {
                    let driver = Keithley2400::new(name.clone(), adapter);
                    rig.with_current_source(name, Box::new(driver))
                }
                InstrumentKind::Pulser => rig.with_pulser(name, Box::new(Keithley6221::new(adapter))),
            };
        }

        if let Some(ppms) = &settings.ppms {
            if !ppms.simulated {
                return Err(DaqError::Configuration(format!(
                    "No driver for the PPMS at {}: the Quantum Design control library is not \
                     available, set ppms.simulated = true",
                    ppms.address
                )));
            }
            info!("Using simulated PPMS");
            rig = rig.with_cryostat(Box::new(MockCryostat::new(settings.simulation.settle)));
        }

        if let Some(switch) = &settings.switch {
            if switch.simulated {
                info!("Using simulated matrix switch");
                rig = rig.with_switch(Box::new(MockSwitch::new()));
            } else {
                let driver = LinkBoneSwitch::connect(&switch.address, switch.options()).await?;
                rig = rig.with_switch(Box::new(driver));
            }
        }

        Ok(rig)
    }

    /// The connection registry the rig was built from.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The cryostat driver.
    pub fn cryostat(&mut self) -> AppResult<&mut dyn Cryostat> {
        match self.cryostat.as_mut() {
            Some(cryostat) => Ok(cryostat.as_mut()),
            None => Err(DaqError::Configuration(
                "Add a PPMS before running a sweep".to_string(),
            )),
        }
    }

    /// Open every relay. Does nothing without a switch.
    pub async fn reset_switch(&mut self) -> AppResult<()> {
        match self.switch.as_mut() {
            Some(switch) => {
                debug!("Resetting matrix switch");
                switch.reset().await
            }
            None => Ok(()),
        }
    }

    /// Take one measurement: route, sample, then reset the switch.
    pub async fn measure(
        &mut self,
        spec: &MeasurementSpec,
        sampler: &Sampler,
        wait_after_switch: Duration,
    ) -> AppResult<Reading> {
        let result = self.routed_measure(spec, sampler, wait_after_switch).await;
        let reset = self.reset_switch().await;
        keep_first_error(result, reset)
    }

    async fn routed_measure(
        &mut self,
        spec: &MeasurementSpec,
        sampler: &Sampler,
        wait_after_switch: Duration,
    ) -> AppResult<Reading> {
        self.close_routes(spec.routes(), wait_after_switch).await?;

        let voltmeter = device(&mut self.voltmeters, spec.voltmeter(), "voltmeter")?;
        let drive = match spec.drive() {
            CurrentDrive::Source(name) => {
                Drive::Sourced(device(&mut self.sources, name, "current source")?)
            }
            CurrentDrive::Continuous => Drive::Continuous,
        };

        debug!(measurement = spec.name(), "Sampling");
        let stats = sampler.sample(voltmeter, drive, spec.amplitude()).await?;
        Ok(Reading {
            amplitude: spec.amplitude(),
            mean: stats.mean,
            std: stats.std,
        })
    }

    /// Fire a pulse: reset, route, pulse, then reset the switch again.
    ///
    /// Pulses are fired outside a sweep, so relays left closed by an earlier
    /// session are opened first.
    pub async fn fire_pulse(
        &mut self,
        pulse: &PulseSpec,
        wait_after_switch: Duration,
        wait_after_arm: Duration,
    ) -> AppResult<()> {
        let result = self
            .routed_pulse(pulse, wait_after_switch, wait_after_arm)
            .await;
        let reset = self.reset_switch().await;
        keep_first_error(result, reset)
    }

    async fn routed_pulse(
        &mut self,
        pulse: &PulseSpec,
        wait_after_switch: Duration,
        wait_after_arm: Duration,
    ) -> AppResult<()> {
        self.reset_switch().await?;
        self.close_routes(pulse.routes(), wait_after_switch).await?;
        let pulser = device(&mut self.pulsers, pulse.pulser(), "pulser")?;
        info!(
            amplitude = pulse.amplitude(),
            width = pulse.width(),
            "Firing pulse '{}'",
            pulse.name()
        );
        pulser
            .pulse_out(&SquarePulse {
                amplitude: pulse.amplitude(),
                width: pulse.width(),
                offset: 0.0,
                wait_after_arm,
            })
            .await
    }

    /// Switch the continuous current on and let it settle.
    pub async fn start_continuous(
        &mut self,
        current: &ContinuousCurrent,
        limits: SourceLimits,
        settle: Duration,
    ) -> AppResult<()> {
        let source = device(&mut self.sources, &current.source, "current source")?;
        info!(
            "Switching on continuous current of {:e} A from '{}'",
            current.amplitude, current.source
        );
        source.configure(limits).await?;
        source.set_amplitude(current.amplitude).await?;
        source.enable().await?;
        sleep(settle).await;
        Ok(())
    }

    /// Switch the continuous current off.
    pub async fn stop_continuous(&mut self, current: &ContinuousCurrent) -> AppResult<()> {
        let source = device(&mut self.sources, &current.source, "current source")?;
        info!("Switching off continuous current from '{}'", current.source);
        source.disable().await
    }

    async fn close_routes(&mut self, routes: &[SwitchRoute], wait: Duration) -> AppResult<()> {
        if routes.is_empty() {
            return Ok(());
        }
        let switch = self.switch.as_mut().ok_or_else(|| {
            DaqError::Configuration("Switch connections defined but no switch is attached".into())
        })?;
        for route in routes {
            let (first, second) = route.ports;
            debug!(
                "Connecting {} ({}) to {} ({})",
                route.connections.0, first, route.connections.1, second
            );
            switch.connect(first, second).await?;
            sleep(wait).await;
        }
        Ok(())
    }
}

fn device<'a, T: ?Sized>(
    drivers: &'a mut HashMap<String, Box<T>>,
    name: &str,
    role: &str,
) -> AppResult<&'a mut T> {
    match drivers.get_mut(name) {
        Some(driver) => Ok(driver.as_mut()),
        None => Err(DaqError::Configuration(format!(
            "No {} driver named '{}' is attached",
            role, name
        ))),
    }
}

fn keep_first_error<T>(result: AppResult<T>, cleanup: AppResult<()>) -> AppResult<T> {
    match (result, cleanup) {
        (result, Ok(())) => result,
        (Ok(_), Err(e)) => Err(e),
        (Err(original), Err(e)) => {
            warn!("Failed to reset the switch after error: {}", e);
            Err(original)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SampleModel;
    use crate::plan::CurrentDrive;
    use crate::sampler::{SamplingOptions, SourceOptions};
    use crate::topology::{Endpoint, InstrumentModel, InstrumentRecord, SwitchPort, Terminal};

    fn port(c: char) -> SwitchPort {
        SwitchPort::new(c).unwrap()
    }

    fn topology() -> Topology {
        let mut t = Topology::new();
        t.attach_switch(Endpoint {
            address: "sim".into(),
            simulated: true,
        });
        t.add_puck_connection(7, "HB+", Some(port('a'))).unwrap();
        t.add_puck_connection(8, "HB-", Some(port('b'))).unwrap();
        t.add_instrument(
            InstrumentRecord::new(
                "Voltmeter",
                InstrumentModel::Keithley2182,
                7,
                vec![
                    Terminal { name: "V+".into(), port: port('p') },
                    Terminal { name: "V-".into(), port: port('o') },
                ],
            )
            .unwrap(),
        )
        .unwrap();
        t.add_instrument(
            InstrumentRecord::new("CurrentSource", InstrumentModel::Keithley2400, 24, vec![])
                .unwrap(),
        )
        .unwrap();
        t.add_instrument(
            InstrumentRecord::new("Pulser", InstrumentModel::Keithley6221, 12, vec![]).unwrap(),
        )
        .unwrap();
        t
    }

    fn sampler() -> Sampler {
        Sampler::new(
            SamplingOptions {
                num_points: 4,
                skip_points: 0,
                drop_outliers: 1,
                bipolar: false,
                ..SamplingOptions::default()
            },
            SourceOptions::default(),
        )
    }

    fn pairs(p: &[(&str, &str)]) -> Vec<(String, String)> {
        p.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_routes_then_resets() {
        let topology = topology();
        let bench = SimBench::new(
            SampleModel {
                resistance: 200.0,
                ..SampleModel::default()
            },
            1,
        );
        let switch = MockSwitch::new();
        let source = MockCurrentSource::new("CurrentSource", bench.clone());
        let mut rig = Rig::new(topology.clone())
            .with_switch(Box::new(switch.clone()))
            .with_voltmeter("Voltmeter", Box::new(MockVoltmeter::new("Voltmeter", bench)))
            .with_current_source("CurrentSource", Box::new(source.clone()));

        let spec = MeasurementSpec::new(
            &topology,
            "Rxx",
            "Voltmeter",
            CurrentDrive::Source("CurrentSource".into()),
            1e-3,
            &pairs(&[("HB+", "V+"), ("HB-", "V-")]),
        )
        .unwrap();

        let reading = rig
            .measure(&spec, &sampler(), Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(reading.amplitude, 1e-3);
        assert!((reading.mean - 0.2).abs() < 1e-12);
        assert_eq!(switch.commands().await, vec!["on a,p", "on b,o", "reset"]);
        assert!(!source.state().await.enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_reset_after_failed_sample() {
        let topology = topology();
        let switch = MockSwitch::new();
        let source = MockCurrentSource::new("CurrentSource", SimBench::default());
        let mut rig = Rig::new(topology.clone())
            .with_switch(Box::new(switch.clone()))
            .with_voltmeter(
                "Voltmeter",
                Box::new(MockVoltmeter::failing("Voltmeter", "GPIB timeout")),
            )
            .with_current_source("CurrentSource", Box::new(source.clone()));
        let spec = MeasurementSpec::new(
            &topology,
            "Rxx",
            "Voltmeter",
            CurrentDrive::Source("CurrentSource".into()),
            1e-3,
            &pairs(&[("HB+", "V+")]),
        )
        .unwrap();

        let err = rig
            .measure(&spec, &sampler(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::InstrumentIo { .. }));
        assert_eq!(switch.commands().await.last().unwrap(), "reset");
        assert!(!source.state().await.enabled);
    }

    struct JammedSwitch;

    #[async_trait::async_trait]
    impl RelaySwitch for JammedSwitch {
        async fn send_command(&mut self, command: &str) -> AppResult<()> {
            if command == "reset" {
                return Err(DaqError::io("Switch", "relay stuck"));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn test_sampling_error_wins_over_reset_error() {
        let topology = topology();
        let mut rig = Rig::new(topology.clone())
            .with_switch(Box::new(JammedSwitch))
            .with_voltmeter(
                "Voltmeter",
                Box::new(MockVoltmeter::failing("Voltmeter", "GPIB timeout")),
            )
            .with_current_source(
                "CurrentSource",
                Box::new(MockCurrentSource::new("CurrentSource", SimBench::default())),
            );
        let spec = MeasurementSpec::new(
            &topology,
            "Rxx",
            "Voltmeter",
            CurrentDrive::Source("CurrentSource".into()),
            1e-3,
            &pairs(&[("HB+", "V+")]),
        )
        .unwrap();

        let err = rig
            .measure(&spec, &sampler(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("GPIB timeout"));
        assert!(logs_contain("Failed to reset the switch after error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_pulse() {
        let topology = topology();
        let switch = MockSwitch::new();
        let pulser = MockPulser::new();
        let mut rig = Rig::new(topology.clone())
            .with_switch(Box::new(switch.clone()))
            .with_pulser("Pulser", Box::new(pulser.clone()));
        let pulse = PulseSpec::new(
            &topology,
            "write",
            "Pulser",
            5e-3,
            1e-4,
            &pairs(&[("HB+", "HB-")]),
        )
        .unwrap();

        rig.fire_pulse(&pulse, Duration::ZERO, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(switch.commands().await, vec!["reset", "on a,b", "reset"]);
        assert_eq!(
            pulser.pulses().await,
            vec![SquarePulse {
                amplitude: 5e-3,
                width: 1e-4,
                offset: 0.0,
                wait_after_arm: Duration::from_secs(2),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_driver_is_reported() {
        let topology = topology();
        let mut rig = Rig::new(topology.clone());
        let spec = MeasurementSpec::new(
            &topology,
            "Rxx",
            "Voltmeter",
            CurrentDrive::Source("CurrentSource".into()),
            1e-3,
            &[],
        )
        .unwrap();
        assert!(matches!(
            rig.measure(&spec, &sampler(), Duration::ZERO).await,
            Err(DaqError::Configuration(_))
        ));
        assert!(rig.cryostat().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_current_cycle() {
        let topology = topology();
        let source = MockCurrentSource::new("CurrentSource", SimBench::default());
        let mut rig =
            Rig::new(topology).with_current_source("CurrentSource", Box::new(source.clone()));
        let cc = ContinuousCurrent {
            source: "CurrentSource".into(),
            amplitude: 2e-4,
        };
        rig.start_continuous(&cc, SourceLimits::default(), Duration::from_secs(3))
            .await
            .unwrap();
        let state = source.state().await;
        assert!(state.enabled);
        assert_eq!(state.applied, vec![2e-4]);

        rig.stop_continuous(&cc).await.unwrap();
        assert!(!source.state().await.enabled);
    }
}
