//! Identification of a measurement run.
//!
//! `Metadata` names the sample and the run and is used both to place the
//! output file (`{save_folder}/{sample_id}/{%m%d_%H%M}_{measurement_id}.csv`)
//! and in the settings header at the top of it. The software version is
//! captured automatically so that recorded datasets can be traced back to the
//! code that produced them.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Identifies one measurement run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    /// Short identifier of the run, used in the file name.
    pub measurement_id: String,
    /// Sample under test, used as the output sub-folder.
    pub sample_id: String,
    /// Free-text note.
    pub note: String,
    /// When the run was prepared.
    pub started: DateTime<Local>,
    /// Version of the data acquisition software.
    pub software_version: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            measurement_id: String::new(),
            sample_id: String::new(),
            note: String::new(),
            started: Local::now(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A builder for constructing `Metadata` instances.
#[derive(Default)]
pub struct MetadataBuilder {
    inner: Metadata,
}

impl MetadataBuilder {
    /// Start from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the measurement id.
    pub fn measurement_id(mut self, id: &str) -> Self {
        self.inner.measurement_id = id.to_string();
        self
    }

    /// Set the sample id.
    pub fn sample_id(mut self, id: &str) -> Self {
        self.inner.sample_id = id.to_string();
        self
    }

    /// Set the note.
    pub fn note(mut self, note: &str) -> Self {
        self.inner.note = note.to_string();
        self
    }

    /// Override the start time.
    pub fn started(mut self, started: DateTime<Local>) -> Self {
        self.inner.started = started;
        self
    }

    /// Finish.
    pub fn build(self) -> Metadata {
        self.inner
    }
}

impl Metadata {
    /// Validates the metadata.
    ///
    /// Both ids end up in a file path, so they must not contain separators.
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("measurement_id", &self.measurement_id),
            ("sample_id", &self.sample_id),
        ] {
            if value.contains(['/', '\\']) || value == ".." {
                return Err(format!("{} '{}' is not a valid path component", field, value));
            }
        }
        Ok(())
    }

    /// File name for a run started at `started`.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.csv",
            self.started.format("%m%d_%H%M"),
            self.measurement_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_builder_and_file_name() {
        let started = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 0).unwrap();
        let metadata = MetadataBuilder::new()
            .measurement_id("SMR_300K")
            .sample_id("Pt_YIG_01")
            .note("first cooldown")
            .started(started)
            .build();
        assert_eq!(metadata.file_name(), "0307_0905_SMR_300K.csv");
        assert_eq!(metadata.software_version, env!("CARGO_PKG_VERSION"));
        assert!(metadata.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_separators() {
        let metadata = MetadataBuilder::new().sample_id("../etc").build();
        assert!(metadata.validate().is_err());
    }
}
