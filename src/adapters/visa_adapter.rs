//! VISA Hardware Adapter for GPIB/USB/Ethernet instruments
//!
//! Provides an [`Adapter`] for instruments reached through the VISA library,
//! which on this rig means the Keithleys on the GPIB bus.

use super::Adapter;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use std::sync::{Arc, Mutex};
#[cfg(feature = "instrument_visa")]
use tracing::debug;

/// VISA adapter for instrument communication
///
/// VISA calls block, so every transfer runs on Tokio's blocking pool.
///
/// Supports resource strings like:
/// - "GPIB0::16::INSTR" (GPIB interface)
/// - "USB0::0x1234::0x5678::SERIAL::INSTR" (USB)
/// - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
pub struct VisaAdapter {
    /// VISA resource string (e.g., "GPIB0::16::INSTR")
    pub(crate) resource_string: String,

    /// Read/write timeout
    pub(crate) timeout: Duration,

    /// Line terminator for commands (typically "\n" for SCPI)
    pub(crate) line_terminator: String,

    #[cfg(feature = "instrument_visa")]
    instrument: Option<Arc<Mutex<visa_rs::Instrument>>>,
}

impl VisaAdapter {
    /// Create a new VISA adapter with default settings
    pub fn new(resource_string: String) -> Self {
        Self {
            resource_string,
            timeout: Duration::from_secs(5),
            line_terminator: "\n".to_string(),
            #[cfg(feature = "instrument_visa")]
            instrument: None,
        }
    }

    /// Adapter for a primary address on the first GPIB board.
    pub fn gpib(address: u8) -> Self {
        Self::new(format!("GPIB0::{}::INSTR", address))
    }

    /// Set read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: String) -> Self {
        self.line_terminator = terminator;
        self
    }

    /// Open the VISA session.
    #[cfg(feature = "instrument_visa")]
    pub async fn connect(&mut self) -> AppResult<()> {
        use std::ffi::CString;
        use visa_rs::prelude::*;

        let resource = self.resource_string.clone();
        let timeout = self.timeout;
        let instrument = tokio::task::spawn_blocking(move || {
            let rm = DefaultRM::new().map_err(|e| DaqError::io(&resource, e.to_string()))?;
            let c_string = CString::new(resource.as_str())
                .map_err(|e| DaqError::Configuration(format!("bad resource string: {}", e)))?;
            rm.open(&c_string.into(), AccessMode::NO_LOCK, timeout)
                .map_err(|e| DaqError::io(&resource, format!("failed to open: {}", e)))
        })
        .await
        .map_err(|e| DaqError::io(&self.resource_string, format!("VISA open task panicked: {}", e)))??;

        self.instrument = Some(Arc::new(Mutex::new(instrument)));
        debug!(
            "VISA resource '{}' opened with {}ms timeout",
            self.resource_string,
            self.timeout.as_millis()
        );
        Ok(())
    }

    /// Open the VISA session.
    #[cfg(not(feature = "instrument_visa"))]
    pub async fn connect(&mut self) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    #[cfg(feature = "instrument_visa")]
    async fn transfer(&self, command: &str, expect_reply: bool) -> AppResult<String> {
        use std::io::{BufRead, BufReader, Write};

        let instrument = self
            .instrument
            .as_ref()
            .ok_or_else(|| DaqError::io(&self.resource_string, "VISA instrument not connected"))?
            .clone();
        let resource = self.resource_string.clone();
        let line = format!("{}{}", command, self.line_terminator);
        let command = command.to_string();

        tokio::task::spawn_blocking(move || {
            let mut guard = instrument
                .lock()
                .map_err(|_| DaqError::io(&resource, "VISA session lock poisoned"))?;
            guard
                .write_all(line.as_bytes())
                .map_err(|e| DaqError::io(&resource, format!("write '{}' failed: {}", command, e)))?;
            if !expect_reply {
                debug!("VISA write sent: {}", command);
                return Ok(String::new());
            }
            let mut response = String::new();
            BufReader::new(&*guard)
                .read_line(&mut response)
                .map_err(|e| DaqError::io(&resource, format!("read after '{}' failed: {}", command, e)))?;
            let response = response.trim().to_string();
            debug!("VISA query '{}' -> '{}'", command, response);
            Ok(response)
        })
        .await
        .map_err(|e| DaqError::io(&self.resource_string, format!("VISA I/O task panicked: {}", e)))?
    }

    #[cfg(not(feature = "instrument_visa"))]
    async fn transfer(&self, _command: &str, _expect_reply: bool) -> AppResult<String> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    /// Human-readable description for logs.
    pub fn info(&self) -> String {
        format!(
            "VisaAdapter({} @ {}ms timeout)",
            self.resource_string,
            self.timeout.as_millis()
        )
    }
}

#[async_trait]
impl Adapter for VisaAdapter {
    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.transfer(command, false).await.map(|_| ())
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.transfer(command, true).await
    }
}
