//! Voltage sampling for a single measurement.
//!
//! A sample is taken in one or two legs. Each leg waits `time_per_point`
//! before every reading, discards the first `skip_points` readings while the
//! sample settles, sorts what is left and drops `drop_outliers` readings from
//! each end. The remaining readings are reduced to a population mean and
//! standard deviation.
//!
//! In bipolar mode the second leg is taken with the current reversed and the
//! legs are combined as `mean = (mean+ - mean-) / 2`, `std = (std+ + std-) / 2`,
//! which cancels thermal offsets.

use crate::error::{AppResult, DaqError};
use crate::instrument::{CurrentSource, SourceLimits, Voltmeter};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How voltage readings are collected and reduced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingOptions {
    /// Readings taken per polarity.
    pub num_points: usize,
    /// Delay before each reading.
    #[serde(with = "humantime_serde")]
    pub time_per_point: Duration,
    /// Leading readings discarded while the sample settles.
    pub skip_points: usize,
    /// Readings dropped from each end of the sorted leg.
    pub drop_outliers: usize,
    /// Measure with both current polarities.
    pub bipolar: bool,
    /// Delay between enabling the source and the first reading.
    #[serde(with = "humantime_serde")]
    pub wait_after_on: Duration,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            num_points: 30,
            time_per_point: Duration::from_millis(100),
            skip_points: 5,
            drop_outliers: 3,
            bipolar: true,
            wait_after_on: Duration::from_secs(3),
        }
    }
}

impl SamplingOptions {
    /// Number of readings that survive skipping and trimming in each leg.
    ///
    /// Fails when nothing would be left.
    pub fn kept_count(&self) -> AppResult<usize> {
        let available = self.num_points.saturating_sub(self.skip_points);
        if available <= 2 * self.drop_outliers {
            return Err(DaqError::InsufficientSamples {
                available,
                dropped: self.drop_outliers,
            });
        }
        Ok(available - 2 * self.drop_outliers)
    }
}

/// Range and compliance applied to a current source before every sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceOptions {
    /// Source range in amps.
    pub range: f64,
    /// Compliance voltage in volts.
    pub compliance: f64,
}

impl Default for SourceOptions {
    fn default() -> Self {
        let limits = SourceLimits::default();
        Self {
            range: limits.range,
            compliance: limits.compliance,
        }
    }
}

impl From<SourceOptions> for SourceLimits {
    fn from(options: SourceOptions) -> Self {
        SourceLimits {
            range: options.range,
            compliance: options.compliance,
        }
    }
}

/// Where the sample current comes from during a measurement.
pub enum Drive<'a> {
    /// The sampler switches this source on and off around the readings.
    Sourced(&'a mut dyn CurrentSource),
    /// A current is already flowing for the whole sweep; the sampler only reads.
    Continuous,
}

/// Reduced result of one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleStats {
    /// Mean voltage in volts.
    pub mean: f64,
    /// Standard deviation in volts.
    pub std: f64,
    /// Readings kept per leg.
    pub count: usize,
}

/// Takes voltage samples with fixed options.
#[derive(Debug, Clone, Default)]
pub struct Sampler {
    sampling: SamplingOptions,
    source: SourceOptions,
}

impl Sampler {
    /// Create a sampler.
    pub fn new(sampling: SamplingOptions, source: SourceOptions) -> Self {
        Self { sampling, source }
    }

    /// The sampling options in use.
    pub fn sampling(&self) -> &SamplingOptions {
        &self.sampling
    }

    /// The source options in use.
    pub fn source(&self) -> &SourceOptions {
        &self.source
    }

    /// Take one sample at `amplitude` amps.
    ///
    /// With a sourced drive the source is always disabled before returning,
    /// also when a reading failed.
    pub async fn sample(
        &self,
        voltmeter: &mut dyn Voltmeter,
        drive: Drive<'_>,
        amplitude: f64,
    ) -> AppResult<SampleStats> {
        self.sampling.kept_count()?;

        match drive {
            Drive::Continuous => {
                if self.sampling.bipolar {
                    return Err(DaqError::Configuration(
                        "a continuous current cannot be reversed for bipolar sampling".to_string(),
                    ));
                }
                self.leg(voltmeter).await
            }
            Drive::Sourced(source) => {
                let result = self.sourced(voltmeter, &mut *source, amplitude).await;
                match (source.disable().await, result) {
                    (Ok(()), result) => result,
                    (Err(e), Ok(_)) => Err(e),
                    (Err(e), Err(original)) => {
                        warn!("Failed to disable current source after error: {}", e);
                        Err(original)
                    }
                }
            }
        }
    }

    async fn sourced(
        &self,
        voltmeter: &mut dyn Voltmeter,
        source: &mut dyn CurrentSource,
        amplitude: f64,
    ) -> AppResult<SampleStats> {
        debug!(amplitude, "Sourcing current");
        source.configure(self.source.into()).await?;
        source.set_amplitude(amplitude).await?;
        source.enable().await?;
        sleep(self.sampling.wait_after_on).await;

        let positive = self.leg(voltmeter).await?;
        if !self.sampling.bipolar {
            return Ok(positive);
        }

        debug!(amplitude = -amplitude, "Reversing current");
        source.set_amplitude(-amplitude).await?;
        source.enable().await?;
        let negative = self.leg(voltmeter).await?;

        Ok(SampleStats {
            mean: (positive.mean - negative.mean) / 2.0,
            std: (positive.std + negative.std) / 2.0,
            count: positive.count,
        })
    }

    async fn leg(&self, voltmeter: &mut dyn Voltmeter) -> AppResult<SampleStats> {
        let mut readings = Vec::with_capacity(self.sampling.num_points);
        for i in 0..self.sampling.num_points {
            sleep(self.sampling.time_per_point).await;
            if i < self.sampling.skip_points {
                continue;
            }
            readings.push(voltmeter.fetch().await?);
        }
        let kept = trim_outliers(readings, self.sampling.drop_outliers);
        let (mean, std) = mean_std(&kept);
        Ok(SampleStats {
            mean,
            std,
            count: kept.len(),
        })
    }
}

/// Sort `readings` and drop `count` values from each end.
pub fn trim_outliers(mut readings: Vec<f64>, count: usize) -> Vec<f64> {
    readings.sort_by(f64::total_cmp);
    if readings.len() <= 2 * count {
        return Vec::new();
    }
    readings.truncate(readings.len() - count);
    readings.drain(..count);
    readings
}

/// Population mean and standard deviation. Both are NaN for an empty slice.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCurrentSource, MockVoltmeter, SampleModel, SimBench};

    fn quick(num_points: usize, skip_points: usize, drop_outliers: usize, bipolar: bool) -> SamplingOptions {
        SamplingOptions {
            num_points,
            time_per_point: Duration::from_millis(100),
            skip_points,
            drop_outliers,
            bipolar,
            wait_after_on: Duration::from_secs(3),
        }
    }

    #[test]
    fn test_trim_outliers() {
        let readings = vec![10.0, 1.0, 9.0, 2.0, 8.0, 3.0, 7.0, 4.0, 6.0, 5.0];
        assert_eq!(
            trim_outliers(readings, 2),
            vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0]
        );
    }

    #[test]
    fn test_mean_std_is_population() {
        let (mean, std) = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(mean, 5.0);
        assert_eq!(std, 2.0);
    }

    #[test]
    fn test_kept_count_guard() {
        assert_eq!(SamplingOptions::default().kept_count().unwrap(), 19);
        assert!(matches!(
            quick(10, 4, 3, true).kept_count(),
            Err(DaqError::InsufficientSamples {
                available: 6,
                dropped: 3
            })
        ));
        assert!(quick(3, 5, 0, true).kept_count().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_readings_trim_to_middle() {
        let sampler = Sampler::new(quick(10, 0, 2, false), SourceOptions::default());
        let mut vm = MockVoltmeter::scripted("Voltmeter", (1..=10).map(f64::from));
        let stats = sampler
            .sample(&mut vm, Drive::Continuous, 1e-4)
            .await
            .unwrap();
        assert_eq!(stats.count, 6);
        assert_eq!(stats.mean, 5.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_points_are_not_fetched() {
        let sampler = Sampler::new(quick(8, 3, 1, false), SourceOptions::default());
        let mut vm = MockVoltmeter::scripted("Voltmeter", [1.0, 2.0, 3.0, 4.0, 5.0]);
        let probe = vm.clone();
        let stats = sampler
            .sample(&mut vm, Drive::Continuous, 1e-4)
            .await
            .unwrap();
        assert_eq!(probe.fetch_count().await, 5);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.mean, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bipolar_is_antisymmetric() {
        let bench = SimBench::new(
            SampleModel {
                resistance: 250.0,
                offset: 3e-6,
                noise: 1e-7,
            },
            1,
        );
        let mut source = MockCurrentSource::new("CurrentSource", bench.clone());
        let mut vm = MockVoltmeter::new("Voltmeter", bench.clone());
        let sampler = Sampler::new(quick(12, 2, 2, true), SourceOptions::default());

        let up = sampler
            .sample(&mut vm, Drive::Sourced(&mut source), 1e-4)
            .await
            .unwrap();
        let down = sampler
            .sample(&mut vm, Drive::Sourced(&mut source), -1e-4)
            .await
            .unwrap();

        assert!((up.mean - 0.025).abs() < 1e-6);
        assert!((up.mean + down.mean).abs() < 1e-6);
        assert_eq!(bench.current().await, 0.0);

        let state = source.state().await;
        assert_eq!(state.limits, Some(SourceLimits::default()));
        assert_eq!(state.applied, vec![1e-4, -1e-4, -1e-4, 1e-4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unipolar_keeps_offset() {
        let bench = SimBench::new(
            SampleModel {
                resistance: 100.0,
                offset: 1e-3,
                noise: 0.0,
            },
            0,
        );
        let mut source = MockCurrentSource::new("CurrentSource", bench.clone());
        let mut vm = MockVoltmeter::new("Voltmeter", bench);
        let sampler = Sampler::new(quick(10, 2, 1, false), SourceOptions::default());
        let stats = sampler
            .sample(&mut vm, Drive::Sourced(&mut source), 1e-3)
            .await
            .unwrap();
        assert!((stats.mean - 0.101).abs() < 1e-12);
        assert!(stats.std < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_runs_before_hardware() {
        let bench = SimBench::default();
        let mut source = MockCurrentSource::new("CurrentSource", bench.clone());
        let mut vm = MockVoltmeter::new("Voltmeter", bench);
        let probe = vm.clone();
        let sampler = Sampler::new(quick(10, 4, 3, true), SourceOptions::default());

        let result = sampler
            .sample(&mut vm, Drive::Sourced(&mut source), 1e-4)
            .await;
        assert!(matches!(result, Err(DaqError::InsufficientSamples { .. })));
        assert_eq!(probe.fetch_count().await, 0);
        assert_eq!(source.state().await.limits, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_disabled_after_failed_reading() {
        let bench = SimBench::default();
        let mut source = MockCurrentSource::new("CurrentSource", bench.clone());
        let mut vm = MockVoltmeter::failing("Voltmeter", "GPIB timeout");
        let sampler = Sampler::new(quick(10, 0, 2, true), SourceOptions::default());

        let result = sampler
            .sample(&mut vm, Drive::Sourced(&mut source), 1e-4)
            .await;
        assert!(matches!(result, Err(DaqError::InstrumentIo { .. })));
        assert!(!source.state().await.enabled);
        assert_eq!(bench.current().await, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_drive_rejects_bipolar() {
        let mut vm = MockVoltmeter::scripted("Voltmeter", [1.0; 10]);
        let sampler = Sampler::new(quick(10, 0, 2, true), SourceOptions::default());
        assert!(matches!(
            sampler.sample(&mut vm, Drive::Continuous, 1e-4).await,
            Err(DaqError::Configuration(_))
        ));
    }
}
