//! Sweep driver.
//!
//! A sweep varies exactly one of angle, field and temperature and holds the
//! other two fixed. At every setpoint the actuator is commanded, the driver
//! blocks until it reports stable, reads back the actual angle, temperature
//! and field, and runs every measurement of the [`MeasurementPlan`] in order.
//! Each setpoint produces one [`DataRow`].
//!
//! A remnant angle sweep is the one exception to "one list": at every angle
//! the magnet is taken to a saturation field and then to the measurement
//! field, and a row is recorded after each.

use crate::data::{DataRow, StorageWriter};
use crate::error::{Actuator, AppResult, DaqError};
use crate::instrument::FieldMode;
use crate::plan::MeasurementPlan;
use crate::rig::Rig;
use crate::setpoints::with_steps;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// A setpoint parameter as written in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Setpoints {
    /// A single fixed value.
    Scalar(f64),
    /// An explicit list of values.
    List(Vec<f64>),
    /// A piecewise-linear walk, see [`with_steps`].
    Stepped {
        /// Turning points.
        nodes: Vec<f64>,
        /// Step between consecutive nodes.
        steps: Vec<f64>,
    },
}

impl Setpoints {
    /// Whether this parameter is swept.
    pub fn is_list(&self) -> bool {
        !matches!(self, Setpoints::Scalar(_))
    }

    /// The fixed value, if not swept.
    pub fn scalar(&self) -> Option<f64> {
        match self {
            Setpoints::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// Every value, in sweep order.
    pub fn values(&self) -> AppResult<Vec<f64>> {
        let values = match self {
            Setpoints::Scalar(v) => vec![*v],
            Setpoints::List(values) => values.clone(),
            Setpoints::Stepped { nodes, steps } => with_steps(nodes, steps)?,
        };
        if values.is_empty() {
            return Err(DaqError::Configuration(
                "setpoint list is empty".to_string(),
            ));
        }
        Ok(values)
    }
}

/// Field handling during an angle sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldSchedule {
    /// The field is held at one value.
    Fixed(f64),
    /// The magnet visits `saturation` then `measure` at every angle.
    Remnant {
        /// Field that saturates the magnetisation.
        saturation: f64,
        /// Field at which the remnant state is measured.
        measure: f64,
    },
}

impl FieldSchedule {
    /// Fields visited at each angle, in order.
    pub fn fields(&self) -> Vec<f64> {
        match *self {
            FieldSchedule::Fixed(field) => vec![field],
            FieldSchedule::Remnant {
                saturation,
                measure,
            } => vec![saturation, measure],
        }
    }

    /// Field set before the sweep starts.
    pub fn initial(&self) -> f64 {
        match *self {
            FieldSchedule::Fixed(field) => field,
            FieldSchedule::Remnant { saturation, .. } => saturation,
        }
    }
}

/// What is swept and what is held fixed.
#[derive(Debug, Clone, PartialEq)]
pub enum Sweep {
    /// Rotate through `angles`.
    Angle {
        /// Angles in degrees.
        angles: Vec<f64>,
        /// Field handling.
        field: FieldSchedule,
        /// Fixed temperature in kelvin.
        temperature: f64,
    },
    /// Ramp the magnet through `fields`.
    Field {
        /// Fields in oersted.
        fields: Vec<f64>,
        /// Fixed temperature in kelvin.
        temperature: f64,
        /// Fixed angle in degrees, `None` to leave the rotator alone.
        angle: Option<f64>,
    },
    /// Ramp the temperature through `temperatures`.
    Temperature {
        /// Temperatures in kelvin.
        temperatures: Vec<f64>,
        /// Fixed field in oersted.
        field: f64,
        /// Fixed angle in degrees, `None` to leave the rotator alone.
        angle: Option<f64>,
    },
}

impl Sweep {
    /// Work out the sweep from three parameters of which exactly one is a
    /// list. `angle = None` means the rotator is not used.
    ///
    /// The exception is a remnant angle sweep: a list of angles together with
    /// a list of exactly two fields.
    pub fn from_parameters(
        angle: Option<&Setpoints>,
        field: &Setpoints,
        temperature: &Setpoints,
    ) -> AppResult<Self> {
        let angle_swept = angle.is_some_and(Setpoints::is_list);
        match (angle, angle_swept, field.is_list(), temperature.is_list()) {
            (Some(angles), true, false, false) => Ok(Sweep::Angle {
                angles: angles.values()?,
                field: FieldSchedule::Fixed(fixed(field)?),
                temperature: fixed(temperature)?,
            }),
            (Some(angles), true, true, false) => match field.values()?.as_slice() {
                [saturation, measure] => Ok(Sweep::Angle {
                    angles: angles.values()?,
                    field: FieldSchedule::Remnant {
                        saturation: *saturation,
                        measure: *measure,
                    },
                    temperature: fixed(temperature)?,
                }),
                other => Err(DaqError::Configuration(format!(
                    "A remnant angle sweep needs exactly two fields (saturation, measurement), got {}",
                    other.len()
                ))),
            },
            (_, false, true, false) => Ok(Sweep::Field {
                fields: field.values()?,
                temperature: fixed(temperature)?,
                angle: angle.and_then(Setpoints::scalar),
            }),
            (_, false, false, true) => Ok(Sweep::Temperature {
                temperatures: temperature.values()?,
                field: fixed(field)?,
                angle: angle.and_then(Setpoints::scalar),
            }),
            _ => Err(DaqError::Configuration(
                "Could not determine the sweep: give a list for exactly one of angle, field and \
                 temperature (or angles with two fields for a remnant sweep)"
                    .to_string(),
            )),
        }
    }

    /// Short name of the sweep type.
    pub fn measurement_type(&self) -> &'static str {
        match self {
            Sweep::Angle {
                field: FieldSchedule::Fixed(_),
                ..
            } => "RvsAngle",
            Sweep::Angle { .. } => "RvsAngle_Remnant",
            Sweep::Field { angle: None, .. } => "RvsH_NoRotator",
            Sweep::Field { .. } => "RvsH_SpecificAngle",
            Sweep::Temperature { angle: None, .. } => "RvsT_NoRotator",
            Sweep::Temperature { .. } => "RvsT_SpecificAngle",
        }
    }

    /// Number of rows the sweep records.
    pub fn row_count(&self) -> usize {
        match self {
            Sweep::Angle { angles, field, .. } => angles.len() * field.fields().len(),
            Sweep::Field { fields, .. } => fields.len(),
            Sweep::Temperature { temperatures, .. } => temperatures.len(),
        }
    }
}

fn fixed(setpoints: &Setpoints) -> AppResult<f64> {
    setpoints.scalar().ok_or_else(|| {
        DaqError::Configuration("expected a single value, got a list".to_string())
    })
}

impl fmt::Display for Sweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sweep::Angle {
                angles,
                field,
                temperature,
            } => {
                write!(f, "angle setpoints: {:?}(deg)", angles)?;
                write!(f, "\nmagnetic field setpoint: {:?}(Oe)", field.fields())?;
                write!(f, "\ntemperature setpoint: {}(K)", temperature)?;
            }
            Sweep::Field {
                fields,
                temperature,
                angle,
            } => {
                write!(f, "angle setpoint: {}", format_angle(*angle))?;
                write!(f, "\nmagnetic field setpoints: {:?}(Oe)", fields)?;
                write!(f, "\ntemperature setpoint: {}(K)", temperature)?;
            }
            Sweep::Temperature {
                temperatures,
                field,
                angle,
            } => {
                write!(f, "angle setpoint: {}", format_angle(*angle))?;
                write!(f, "\nmagnetic field setpoint: {}(Oe)", field)?;
                write!(f, "\ntemperature setpoints: {:?}(K)", temperatures)?;
            }
        }
        write!(f, "\nMeasurement type: \n{}", self.measurement_type())
    }
}

fn format_angle(angle: Option<f64>) -> String {
    angle.map_or_else(|| "no rotator".to_string(), |a| format!("{}(deg)", a))
}

/// Waits and limits used while sweeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingOptions {
    /// Wait for the fixed parameters to settle before recording.
    pub wait_for_setpoints: bool,
    /// Extra pause before the first setpoint.
    #[serde(with = "humantime_serde")]
    pub initial_wait: Duration,
    /// Pause after each relay is closed.
    #[serde(with = "humantime_serde")]
    pub wait_after_switch: Duration,
    /// Limit for a temperature wait.
    #[serde(with = "humantime_serde")]
    pub temperature_timeout: Duration,
    /// Limit for a field wait.
    #[serde(with = "humantime_serde")]
    pub field_timeout: Duration,
    /// Limit for a rotator wait.
    #[serde(with = "humantime_serde")]
    pub position_timeout: Duration,
}

impl Default for TimingOptions {
    fn default() -> Self {
        Self {
            wait_for_setpoints: true,
            initial_wait: Duration::ZERO,
            wait_after_switch: Duration::from_millis(300),
            temperature_timeout: Duration::from_secs(6000),
            field_timeout: Duration::from_secs(3600),
            position_timeout: Duration::from_secs(1200),
        }
    }
}

/// Actuator ramp rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampOptions {
    /// Temperature ramp in K/min.
    pub temperature_rate: f64,
    /// Field ramp in Oe/s.
    pub field_rate: f64,
    /// Rotator speed in deg/s.
    pub rotator_speed: f64,
    /// Magnet mode after each field change.
    pub field_mode: FieldMode,
}

impl Default for RampOptions {
    fn default() -> Self {
        Self {
            temperature_rate: 20.0,
            field_rate: 100.0,
            rotator_speed: 1.0,
            field_mode: FieldMode::Driven,
        }
    }
}

/// Runs a [`Sweep`] on a [`Rig`].
pub struct SweepDriver<'a> {
    rig: &'a mut Rig,
    plan: &'a MeasurementPlan,
    timing: TimingOptions,
    ramps: RampOptions,
}

impl<'a> SweepDriver<'a> {
    /// Create a driver.
    pub fn new(
        rig: &'a mut Rig,
        plan: &'a MeasurementPlan,
        timing: TimingOptions,
        ramps: RampOptions,
    ) -> Self {
        Self {
            rig,
            plan,
            timing,
            ramps,
        }
    }

    /// Timing and sweep settings, appended to the measurement settings block.
    pub fn run_settings(&self, sweep: &Sweep) -> String {
        let t = &self.timing;
        format!(
            "\n\nTiming Settings:\
             \n\nwait for initial setpoints?: {}\
             \nwait time at measurement start: {:?}\
             \nwait time after switching connections: {:?}\
             \n\nOverall Measurement Settings:\n\n{}",
            t.wait_for_setpoints, t.initial_wait, t.wait_after_switch, sweep
        )
    }

    /// Run the sweep, writing every row to `storage` as it is taken.
    ///
    /// A continuous current, if the plan has one, is switched on after the
    /// fixed parameters are set and switched off when the sweep ends, also
    /// when it fails.
    pub async fn run(
        &mut self,
        sweep: &Sweep,
        storage: &mut dyn StorageWriter,
    ) -> AppResult<Vec<DataRow>> {
        if self.plan.measurements().is_empty() {
            return Err(DaqError::Configuration(
                "Add at least one measurement before running a sweep".to_string(),
            ));
        }
        self.plan.sampler().sampling().kept_count()?;
        info!(
            "Starting {} sweep with {} setpoints",
            sweep.measurement_type(),
            sweep.row_count()
        );

        self.rig.reset_switch().await?;
        self.set_fixed_parameters(sweep).await?;

        if let Some(cc) = self.plan.continuous() {
            let limits = (*self.plan.sampler().source()).into();
            let wait = self.plan.sampler().sampling().wait_after_on;
            self.rig.start_continuous(cc, limits, wait).await?;
        }

        let result = self.record(sweep, storage).await;

        if let Some(cc) = self.plan.continuous() {
            if let Err(e) = self.rig.stop_continuous(cc).await {
                if result.is_ok() {
                    return Err(e);
                }
                warn!("Failed to switch off the continuous current: {}", e);
            }
        }
        if let Err(e) = storage.shutdown().await {
            if result.is_ok() {
                return Err(e);
            }
            warn!("Failed to close the data file: {}", e);
        }
        if let Ok(rows) = &result {
            info!("Sweep finished, {} rows recorded", rows.len());
        }
        result
    }

    async fn set_fixed_parameters(&mut self, sweep: &Sweep) -> AppResult<()> {
        let ramps = self.ramps;
        let timing = self.timing.clone();
        let cryostat = self.rig.cryostat()?;

        match sweep {
            Sweep::Temperature { field, angle, .. } => {
                cryostat
                    .set_field(*field, ramps.field_rate, ramps.field_mode)
                    .await?;
                if let Some(angle) = angle {
                    cryostat.set_position(*angle, ramps.rotator_speed).await?;
                    if timing.wait_for_setpoints {
                        cryostat
                            .wait_for_position(timing.position_timeout)
                            .await?
                            .require(Actuator::Rotator, timing.position_timeout)?;
                    }
                }
                if timing.wait_for_setpoints {
                    cryostat
                        .wait_for_field(timing.field_timeout)
                        .await?
                        .require(Actuator::Magnet, timing.field_timeout)?;
                }
            }
            Sweep::Field {
                temperature, angle, ..
            } => {
                cryostat
                    .set_temperature(*temperature, ramps.temperature_rate)
                    .await?;
                if let Some(angle) = angle {
                    cryostat.set_position(*angle, ramps.rotator_speed).await?;
                    if timing.wait_for_setpoints {
                        cryostat
                            .wait_for_position(timing.position_timeout)
                            .await?
                            .require(Actuator::Rotator, timing.position_timeout)?;
                    }
                }
                if timing.wait_for_setpoints {
                    cryostat
                        .wait_for_temperature(timing.temperature_timeout)
                        .await?
                        .require(Actuator::Temperature, timing.temperature_timeout)?;
                    cryostat
                        .wait_for_field(timing.field_timeout)
                        .await?
                        .require(Actuator::Magnet, timing.field_timeout)?;
                }
            }
            Sweep::Angle {
                field, temperature, ..
            } => {
                cryostat
                    .set_temperature(*temperature, ramps.temperature_rate)
                    .await?;
                cryostat
                    .set_field(field.initial(), ramps.field_rate, ramps.field_mode)
                    .await?;
                if timing.wait_for_setpoints {
                    cryostat
                        .wait_for_temperature(timing.temperature_timeout)
                        .await?
                        .require(Actuator::Temperature, timing.temperature_timeout)?;
                    cryostat
                        .wait_for_field(timing.field_timeout)
                        .await?
                        .require(Actuator::Magnet, timing.field_timeout)?;
                }
            }
        }
        Ok(())
    }

    async fn record(
        &mut self,
        sweep: &Sweep,
        storage: &mut dyn StorageWriter,
    ) -> AppResult<Vec<DataRow>> {
        sleep(self.timing.initial_wait).await;

        storage.init(self.plan.metadata()).await?;
        let header = format!(
            "{}{}",
            self.rig.topology().settings_header(),
            self.plan.settings_header(&self.run_settings(sweep))
        );
        storage
            .set_header(&header, &self.plan.column_names())
            .await?;

        let ramps = self.ramps;
        let timing = self.timing.clone();
        let mut rows = Vec::with_capacity(sweep.row_count());

        match sweep {
            Sweep::Temperature { temperatures, .. } => {
                for &temperature in temperatures {
                    info!("Ramping temperature to {:.1} K", temperature);
                    let cryostat = self.rig.cryostat()?;
                    cryostat
                        .set_temperature(temperature, ramps.temperature_rate)
                        .await?;
                    cryostat
                        .wait_for_temperature(timing.temperature_timeout)
                        .await?
                        .require(Actuator::Temperature, timing.temperature_timeout)?;
                    rows.push(self.measure_row(storage).await?);
                }
            }
            Sweep::Field { fields, .. } => {
                for &field in fields {
                    info!("Ramping field to {:.1} Oe", field);
                    let cryostat = self.rig.cryostat()?;
                    cryostat
                        .set_field(field, ramps.field_rate, ramps.field_mode)
                        .await?;
                    cryostat
                        .wait_for_field(timing.field_timeout)
                        .await?
                        .require(Actuator::Magnet, timing.field_timeout)?;
                    rows.push(self.measure_row(storage).await?);
                }
            }
            Sweep::Angle { angles, field, .. } => {
                let remnant = matches!(field, FieldSchedule::Remnant { .. });
                for &angle in angles {
                    info!("Rotating to {:.1} deg", angle);
                    let cryostat = self.rig.cryostat()?;
                    cryostat.set_position(angle, ramps.rotator_speed).await?;
                    cryostat
                        .wait_for_position(timing.position_timeout)
                        .await?
                        .require(Actuator::Rotator, timing.position_timeout)?;

                    for value in field.fields() {
                        let cryostat = self.rig.cryostat()?;
                        cryostat
                            .set_field(value, ramps.field_rate, ramps.field_mode)
                            .await?;
                        if remnant {
                            cryostat
                                .wait_for_field(timing.field_timeout)
                                .await?
                                .require(Actuator::Magnet, timing.field_timeout)?;
                        }
                        rows.push(self.measure_row(storage).await?);
                    }
                }
            }
        }
        Ok(rows)
    }

    async fn measure_row(&mut self, storage: &mut dyn StorageWriter) -> AppResult<DataRow> {
        let cryostat = self.rig.cryostat()?;
        let angle = cryostat.position().await?;
        let temperature = cryostat.temperature().await?;
        let field = cryostat.field().await?;

        let mut readings = Vec::with_capacity(self.plan.measurements().len());
        for spec in self.plan.measurements() {
            let reading = self
                .rig
                .measure(spec, self.plan.sampler(), self.timing.wait_after_switch)
                .await?;
            readings.push(reading);
        }

        let row = DataRow {
            angle,
            temperature,
            field,
            readings,
        };
        storage.write(std::slice::from_ref(&row)).await?;
        info!(
            angle = row.angle,
            temperature = row.temperature,
            field = row.field,
            "Recorded data row"
        );
        Ok(row)
    }
}
