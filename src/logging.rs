//! Log subscriber setup.
//!
//! Every line carries a UTC timestamp and the target module. `RUST_LOG` wins over the
//! configured level, so a single run can be made more verbose without editing the
//! settings file.

use crate::config::LoggingConfig;
use crate::error::{AppResult, DaqError};
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` if set, otherwise `level`.
///
/// # Errors
/// Returns [`DaqError::Configuration`] if neither source parses.
pub fn env_filter(level: &str) -> AppResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| DaqError::Configuration(format!("invalid log filter '{level}': {e}")))
}

/// Install the global subscriber.
///
/// Calling this twice is harmless; the second call leaves the first subscriber in
/// place.
///
/// # Errors
/// Returns [`DaqError::Configuration`] for an unparseable level.
pub fn init(config: &LoggingConfig) -> AppResult<()> {
    let filter = env_filter(&config.level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("log subscriber already installed");
    }
    Ok(())
}
