//! Recorded data and its storage.

pub mod storage;

pub use storage::{read_table, CsvWriter, DataTable, StorageWriter};

/// One measurement at one setpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// DC current amplitude in amps.
    pub amplitude: f64,
    /// Mean voltage in volts.
    pub mean: f64,
    /// Voltage standard deviation in volts.
    pub std: f64,
}

/// One output row: the actual setpoint followed by every measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    /// Rotator position in degrees.
    pub angle: f64,
    /// Temperature in kelvin.
    pub temperature: f64,
    /// Field in oersted.
    pub field: f64,
    /// One reading per measurement, in plan order.
    pub readings: Vec<Reading>,
}

impl DataRow {
    /// Flatten into CSV cells.
    pub fn values(&self) -> Vec<f64> {
        let mut values = vec![self.angle, self.temperature, self.field];
        for r in &self.readings {
            values.extend([r.amplitude, r.mean, r.std]);
        }
        values
    }
}
