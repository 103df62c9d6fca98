//! Declarative stations: instruments and groups loaded from YAML.
//!
//! ```yaml
//! instruments:
//!   dac:
//!     driver: mock_dac
//!     channels: 2
//!   lockin:
//!     driver: mock_lockin
//! groups:
//!   chip:
//!     submodules:
//!       device1:
//!         parameters:
//!           gate: dac.ch01.voltage
//! ```
//!
//! Instruments are built in declaration order, then groups. If anything
//! fails, every instrument already created is closed again.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{InstrumentError, Result};
use crate::group::{ChannelTypeRegistry, GroupSpec, InstrumentGroup};
use crate::instrument::{
    Instrument, InstrumentBuilder, InstrumentDriver, InstrumentRegistry, InstrumentSnapshot,
};
use crate::mock::{MockDac, MockDacOptions, MockLockin, MockLockinOptions};
use crate::parameter::NamedValue;

/// One instrument entry: driver name plus driver-specific options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub driver: String,
    #[serde(flatten)]
    pub options: IndexMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub instruments: IndexMap<String, InstrumentSpec>,
    pub groups: IndexMap<String, GroupSpec>,
}

impl StationConfig {
    /// Parse a station description.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }
}

type DriverFactory =
    Box<dyn Fn(serde_json::Value) -> Result<Box<dyn InstrumentDriver>> + Send + Sync>;

/// Driver factories keyed by driver name.
pub struct DriverRegistry {
    factories: IndexMap<String, DriverFactory>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn options<T: serde::de::DeserializeOwned>(driver: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        InstrumentError::Configuration(format!("invalid options for driver '{}': {}", driver, e))
    })
}

impl DriverRegistry {
    /// Registry with the built-in `mock_dac` and `mock_lockin` drivers.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: IndexMap::new(),
        };
        registry.register("mock_dac", |value| {
            let opts: MockDacOptions = options("mock_dac", value)?;
            Ok(Box::new(MockDac::new(opts)) as Box<dyn InstrumentDriver>)
        });
        registry.register("mock_lockin", |value| {
            let opts: MockLockinOptions = options("mock_lockin", value)?;
            Ok(Box::new(MockLockin::new(opts)) as Box<dyn InstrumentDriver>)
        });
        registry
    }

    /// Add or replace a driver factory.
    pub fn register<F>(&mut self, driver: impl Into<String>, factory: F)
    where
        F: Fn(serde_json::Value) -> Result<Box<dyn InstrumentDriver>> + Send + Sync + 'static,
    {
        self.factories.insert(driver.into(), Box::new(factory));
    }

    pub fn drivers(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Builder for instrument `name` with all of the driver's declarations applied.
    pub fn create(&self, name: &str, spec: &InstrumentSpec) -> Result<InstrumentBuilder> {
        let factory = self.factories.get(&spec.driver).ok_or_else(|| {
            InstrumentError::Configuration(format!(
                "unknown driver '{}' for instrument '{}'",
                spec.driver, name
            ))
        })?;
        let options: serde_json::Map<String, serde_json::Value> = spec
            .options
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let driver = factory(serde_json::Value::Object(options))?;
        let mut builder = InstrumentBuilder::new(name);
        builder.apply(driver.as_ref())?;
        Ok(builder)
    }
}

/// Serializable state of a whole station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationSnapshot {
    pub instruments: IndexMap<String, InstrumentSnapshot>,
}

/// A set of live instruments and groups sharing one registry.
#[derive(Debug)]
pub struct Station {
    registry: InstrumentRegistry,
}

impl Station {
    /// Build every instrument, then every group, into a fresh registry.
    pub fn load(
        config: &StationConfig,
        drivers: &DriverRegistry,
        channel_types: &ChannelTypeRegistry,
    ) -> Result<Self> {
        Self::load_into(InstrumentRegistry::new(), config, drivers, channel_types)
    }

    /// Build into an existing registry. On failure the instruments and
    /// groups created by this load are closed again; anything registered
    /// beforehand is left alone.
    pub fn load_into(
        registry: InstrumentRegistry,
        config: &StationConfig,
        drivers: &DriverRegistry,
        channel_types: &ChannelTypeRegistry,
    ) -> Result<Self> {
        let mut created = Vec::new();
        match Self::populate(&registry, config, drivers, channel_types, &mut created) {
            Ok(()) => {
                info!(instruments = registry.len(), "station loaded");
                Ok(Self { registry })
            }
            Err(e) => {
                warn!(error = %e, created = created.len(), "station load failed; closing instruments");
                for instrument in created.iter().rev() {
                    instrument.close();
                }
                Err(e)
            }
        }
    }

    /// Load a station YAML file with the built-in drivers and channel types.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = StationConfig::from_file(path)?;
        Self::load(&config, &DriverRegistry::new(), &ChannelTypeRegistry::new())
    }

    fn populate(
        registry: &InstrumentRegistry,
        config: &StationConfig,
        drivers: &DriverRegistry,
        channel_types: &ChannelTypeRegistry,
        created: &mut Vec<Arc<Instrument>>,
    ) -> Result<()> {
        for (name, spec) in &config.instruments {
            created.push(drivers.create(name, spec)?.build(registry)?);
        }
        for (name, spec) in &config.groups {
            created.push(InstrumentGroup::new(name, spec.clone()).build(registry, channel_types)?);
        }
        Ok(())
    }

    pub fn registry(&self) -> &InstrumentRegistry {
        &self.registry
    }

    pub fn instrument(&self, name: &str) -> Option<Arc<Instrument>> {
        self.registry.find(name)
    }

    /// Resolve `instrument.sub.parameter`.
    pub fn parameter(&self, path: &str) -> Result<Arc<dyn NamedValue>> {
        self.registry.resolve_parameter(path)
    }

    /// Snapshot of every registered instrument and group.
    pub fn snapshot(&self, update: bool) -> StationSnapshot {
        let instruments = self
            .registry
            .names()
            .into_iter()
            .filter_map(|name| {
                let instrument = self.registry.find(&name)?;
                Some((name, instrument.snapshot(update)))
            })
            .collect();
        StationSnapshot { instruments }
    }

    /// Close every instrument in the registry.
    pub fn close_all(&self) {
        self.registry.close_all();
    }
}
