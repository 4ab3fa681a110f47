//! Tracing subscriber setup.

use crate::config::{ApplicationSettings, LogFormat};
use crate::error::{AppResult, DaqError};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when it is set. Calling this a
/// second time is an error.
pub fn init(settings: &ApplicationSettings) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .map_err(|e| DaqError::Configuration(format!("bad log filter: {}", e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match settings.log_format {
        LogFormat::Pretty => builder.with_target(false).try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };
    installed.map_err(|e| DaqError::Configuration(format!("logging already initialised: {}", e)))
}
