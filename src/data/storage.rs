//! Data storage writers.
//!
//! A data file starts with free-text settings blocks describing the rig and
//! the run, followed by a CSV table:
//!
//! ```text
//! Angle(deg),Temp(K),Field(Oe),Rxx_DC_Current(A),Rxx_Average_V,Rxx_Std_V
//! 0,300,1000,0.0001,0.0123,0.0000021
//! ```
//!
//! [`read_table`] skips the settings blocks and parses the table back.

use super::{DataRow, Reading};
use crate::error::{AppResult, DaqError};
use crate::metadata::Metadata;
use async_trait::async_trait;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Leading columns of every data table.
pub const SETPOINT_COLUMNS: [&str; 3] = ["Angle(deg)", "Temp(K)", "Field(Oe)"];

const CURRENT_SUFFIX: &str = "_DC_Current(A)";
const MEAN_SUFFIX: &str = "_Average_V";
const STD_SUFFIX: &str = "_Std_V";

/// A sink for sweep rows.
#[async_trait]
pub trait StorageWriter: Send {
    /// Choose the output location for a run.
    async fn init(&mut self, metadata: &Metadata) -> AppResult<()>;
    /// Write the settings text and the column header.
    async fn set_header(&mut self, settings: &str, columns: &[String]) -> AppResult<()>;
    /// Append rows. Rows are flushed as they are written.
    async fn write(&mut self, rows: &[DataRow]) -> AppResult<()>;
    /// Flush and close.
    async fn shutdown(&mut self) -> AppResult<()>;
}

// ============================================================================
// CSV Writer
// ============================================================================

/// Writes one CSV file per run under `{save_folder}/{sample_id}/`.
pub struct CsvWriter {
    save_folder: PathBuf,
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
}

impl CsvWriter {
    /// Writer rooted at `save_folder`.
    pub fn new(save_folder: impl Into<PathBuf>) -> Self {
        Self {
            save_folder: save_folder.into(),
            path: PathBuf::new(),
            writer: None,
        }
    }

    /// Path of the current output file. Empty before `init`.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StorageWriter for CsvWriter {
    async fn init(&mut self, metadata: &Metadata) -> AppResult<()> {
        metadata.validate().map_err(DaqError::Configuration)?;
        let folder = self.save_folder.join(&metadata.sample_id);
        if !folder.exists() {
            std::fs::create_dir_all(&folder)?;
        }
        self.path = folder.join(metadata.file_name());
        info!("CSV Writer initialized at '{}'.", self.path.display());
        Ok(())
    }

    async fn set_header(&mut self, settings: &str, columns: &[String]) -> AppResult<()> {
        if self.path.as_os_str().is_empty() {
            return Err(DaqError::Configuration(
                "CSV writer used before init".to_string(),
            ));
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(settings.as_bytes())?;

        let mut writer = csv::Writer::from_writer(file);
        let header = SETPOINT_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(columns.iter().cloned());
        writer.write_record(header)?;
        writer.flush()?;

        self.writer = Some(writer);
        Ok(())
    }

    async fn write(&mut self, rows: &[DataRow]) -> AppResult<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            DaqError::Configuration("CSV writer has no header yet".to_string())
        })?;
        for row in rows {
            writer.write_record(row.values().iter().map(|v| v.to_string()))?;
        }
        writer.flush()?;
        Ok(())
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        info!("CSV Writer shut down.");
        Ok(())
    }
}

// ============================================================================
// Reading
// ============================================================================

/// A data table read back from a file.
#[derive(Debug, Clone, PartialEq)]
pub struct DataTable {
    /// Column names, setpoints first.
    pub columns: Vec<String>,
    /// Parsed rows.
    pub rows: Vec<Vec<f64>>,
}

/// One point of a resistance curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResistancePoint {
    /// Rotator position in degrees.
    pub angle: f64,
    /// Temperature in kelvin.
    pub temperature: f64,
    /// Field in oersted.
    pub field: f64,
    /// Mean voltage over current, in ohms.
    pub resistance: f64,
}

impl DataTable {
    /// Measurement names in column order.
    pub fn measurement_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter_map(|c| c.strip_suffix(CURRENT_SUFFIX))
            .collect()
    }

    fn index(&self, column: &str) -> AppResult<usize> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| crate::error::LookupError::NotFound(column.to_string()).into())
    }

    /// The readings of measurement `name`, one per row.
    pub fn readings(&self, name: &str) -> AppResult<Vec<Reading>> {
        let current = self.index(&format!("{}{}", name, CURRENT_SUFFIX))?;
        let mean = self.index(&format!("{}{}", name, MEAN_SUFFIX))?;
        let std = self.index(&format!("{}{}", name, STD_SUFFIX))?;
        Ok(self
            .rows
            .iter()
            .map(|row| Reading {
                amplitude: row[current],
                mean: row[mean],
                std: row[std],
            })
            .collect())
    }

    /// Resistance `V / I` of measurement `name` against the setpoints.
    pub fn resistance(&self, name: &str) -> AppResult<Vec<ResistancePoint>> {
        let readings = self.readings(name)?;
        Ok(self
            .rows
            .iter()
            .zip(readings)
            .map(|(row, r)| ResistancePoint {
                angle: row[0],
                temperature: row[1],
                field: row[2],
                resistance: r.mean / r.amplitude,
            })
            .collect())
    }
}

/// Read a data file, skipping the settings blocks above the column header.
///
/// Data rows are numeric, so the last line starting with the first setpoint
/// column is the header even if a note repeats it.
pub fn read_table(path: impl AsRef<Path>) -> AppResult<DataTable> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let marker = format!("{},", SETPOINT_COLUMNS[0]);
    let start = text
        .match_indices(&marker)
        .map(|(i, _)| i)
        .filter(|&i| i == 0 || text[..i].ends_with('\n'))
        .last()
        .ok_or_else(|| invalid_data(format!("{}: no column header found", path.display())))?;

    let mut reader = csv::Reader::from_reader(text[start..].as_bytes());
    let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let row = record
            .iter()
            .map(|cell| cell.trim().parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|e| invalid_data(format!("{}: data row {}: {}", path.display(), line + 1, e)))?;
        if row.len() != columns.len() {
            return Err(invalid_data(format!(
                "{}: data row {} has {} values for {} columns",
                path.display(),
                line + 1,
                row.len(),
                columns.len()
            )));
        }
        rows.push(row);
    }
    Ok(DataTable { columns, rows })
}

fn invalid_data(message: String) -> DaqError {
    DaqError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, message))
}
