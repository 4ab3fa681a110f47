//! Piecewise-linear setpoint lists.

use crate::error::{AppResult, DaqError};

const ROUND_DIGITS: i32 = 12;

/// Upper bound on the points a single segment may produce.
pub const MAX_SEGMENT_POINTS: usize = 1_000_000;

/// Build a setpoint list that walks through `nodes`, stepping by `steps[i]`
/// between `nodes[i]` and `nodes[i + 1]`.
///
/// Each segment is half-open like `arange`; the final node is appended so the
/// walk ends exactly on it. Values are rounded to 12 decimal places to remove
/// accumulated float error.
///
/// ```
/// use ppms_daq::setpoints::with_steps;
/// let angles = with_steps(&[0.0, 360.0, 0.0], &[90.0, -90.0]).unwrap();
/// assert_eq!(angles, vec![0.0, 90.0, 180.0, 270.0, 360.0, 270.0, 180.0, 90.0, 0.0]);
/// ```
pub fn with_steps(nodes: &[f64], steps: &[f64]) -> AppResult<Vec<f64>> {
    match nodes {
        [] => Err(DaqError::Configuration(
            "setpoint list needs at least one node".to_string(),
        )),
        [single] => Ok(vec![round(*single)]),
        _ => {
            if steps.len() + 1 != nodes.len() {
                return Err(DaqError::Configuration(format!(
                    "{} nodes need {} steps, got {}",
                    nodes.len(),
                    nodes.len() - 1,
                    steps.len()
                )));
            }
            let mut values = Vec::new();
            for (pair, &step) in nodes.windows(2).zip(steps) {
                values.extend(arange(pair[0], pair[1], step)?);
            }
            values.extend(nodes.last().copied());
            Ok(values.into_iter().map(round).collect())
        }
    }
}

fn arange(start: f64, stop: f64, step: f64) -> AppResult<Vec<f64>> {
    if step == 0.0 || !step.is_finite() {
        return Err(DaqError::Configuration(format!(
            "invalid step {} between {} and {}",
            step, start, stop
        )));
    }
    let span = stop - start;
    if span != 0.0 && span.signum() != step.signum() {
        return Err(DaqError::Configuration(format!(
            "step {} points away from {} (starting at {})",
            step, stop, start
        )));
    }
    let count = (span / step).ceil().max(0.0);
    if !count.is_finite() || count > MAX_SEGMENT_POINTS as f64 {
        return Err(DaqError::Configuration(format!(
            "step {} from {} to {} gives more than {} points",
            step, start, stop, MAX_SEGMENT_POINTS
        )));
    }
    let count = count as usize;
    Ok((0..count).map(|k| start + k as f64 * step).collect())
}

fn round(value: f64) -> f64 {
    let scale = 10f64.powi(ROUND_DIGITS);
    let rounded = (value * scale).round() / scale;
    // very large values overflow the scaling; leave them alone
    if rounded.is_finite() {
        rounded
    } else {
        value
    }
}
