//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{InstrumentError, Result};

/// Filter from `RUST_LOG` when set, otherwise from the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(config.level.to_ascii_lowercase()).map_err(|e| {
            InstrumentError::Configuration(format!(
                "invalid log level '{}': {}",
                config.level, e
            ))
        }),
    }
}

/// Install the global subscriber. Calling it twice is an error.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| {
        InstrumentError::Configuration(format!("logging already initialised: {}", e))
    })
}
