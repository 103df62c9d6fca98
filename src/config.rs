//! Layered configuration using Figment.
//!
//! Sources, lowest to highest precedence:
//! 1. built-in defaults
//! 2. `$HOME/.labctl.toml`
//! 3. the file named by `LABCTL_CONFIG`
//! 4. `./labctl.toml`
//! 5. environment variables prefixed with `LABCTL_`, nested with `__`
//!
//! ```text
//! LABCTL_LOGGING__LEVEL=debug
//! LABCTL_BATCH__USE_THREADS=false
//! LABCTL_STATION__FILE=stations/fridge.yaml
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{InstrumentError, Result};

/// Name of the per-user and per-directory config file.
pub const CONFIG_FILE_NAME: &str = "labctl.toml";

/// Environment variable naming an extra config file.
pub const CONFIG_ENV_VAR: &str = "LABCTL_CONFIG";

const ENV_PREFIX: &str = "LABCTL_";

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 2] = ["plain", "json"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub logging: LoggingConfig,
    pub batch: BatchConfig,
    pub station: StationSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset (trace, debug, info, warn, error)
    pub level: String,
    /// `plain` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Run one worker per underlying instrument
    pub use_threads: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { use_threads: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationSettings {
    /// Default station file for CLI commands
    pub file: Option<PathBuf>,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "plain".to_string()
}

impl LabConfig {
    /// Load from all standard locations plus the environment.
    pub fn load() -> Result<Self> {
        let mut files = Vec::new();
        if let Some(home) = dirs::home_dir() {
            files.push(home.join(format!(".{}", CONFIG_FILE_NAME)));
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            files.push(PathBuf::from(path));
        }
        files.push(PathBuf::from(CONFIG_FILE_NAME));
        Self::load_from(&files)
    }

    /// Load from explicit files (later files win) plus the environment.
    /// Missing files are skipped.
    pub fn load_from<P: AsRef<Path>>(files: &[P]) -> Result<Self> {
        let config: Self = Self::figment(files).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment<P: AsRef<Path>>(files: &[P]) -> Figment {
        let figment = files
            .iter()
            .fold(Figment::from(Serialized::defaults(Self::default())), |f, path| {
                f.merge(Toml::file(path.as_ref()))
            });
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> Result<()> {
        let level = self.logging.level.to_ascii_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(InstrumentError::Configuration(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            )));
        }
        if !VALID_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(InstrumentError::Configuration(format!(
                "Invalid logging.format '{}'. Must be one of: {}",
                self.logging.format,
                VALID_FORMATS.join(", ")
            )));
        }
        Ok(())
    }

    /// Effective configuration rendered as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| InstrumentError::Configuration(format!("cannot render config: {}", e)))
    }
}
