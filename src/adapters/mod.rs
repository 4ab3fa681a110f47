//! Line-oriented command adapters for SCPI instruments.
//!
//! Instrument drivers in [`crate::instrument`] only format commands and parse
//! responses; the adapter owns the bus. [`VisaAdapter`] talks to GPIB
//! instruments through the system VISA library, [`MockAdapter`] records
//! traffic for tests.

pub mod mock;
pub mod visa_adapter;

pub use mock::MockAdapter;
pub use visa_adapter::VisaAdapter;

use crate::error::AppResult;
use async_trait::async_trait;

/// A bidirectional command channel to one instrument.
#[async_trait]
pub trait Adapter: Send {
    /// Send a command that produces no response. The terminator is appended
    /// by the adapter.
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Send a command and read one response line, trimmed.
    async fn query(&mut self, command: &str) -> AppResult<String>;
}
