//! Core library for the `labctl` instrument-control toolkit.
//!
//! This library contains the parameter model (validated, unit-tagged named
//! values with caching and ramping), instruments and their registry,
//! delegate parameters, declarative instrument groups and the
//! thread-affinity batched caller. It is used by the `labctl` binary and by
//! station files describing a lab setup.

/// Thread-affinity batched get/set.
pub mod batch;
/// Layered configuration.
pub mod config;
/// Error type shared by the crate.
pub mod error;
/// Declarative instrument groups.
pub mod group;
/// Instruments, builders and the registry.
pub mod instrument;
/// Tracing setup.
pub mod logging;
/// Simulated instruments.
pub mod mock;
/// Named values.
pub mod parameter;
/// Stations loaded from YAML.
pub mod station;
/// Value validators.
pub mod validators;
/// Dynamic parameter values.
pub mod value;

pub use batch::{BatchOperation, BatchedCaller};
pub use error::{InstrumentError, Result};
pub use group::{ChannelTypeRegistry, GroupSpec, GroupedParameter, InstrumentGroup};
pub use instrument::{Instrument, InstrumentBuilder, InstrumentDriver, InstrumentRegistry};
pub use parameter::{DelegateParameter, NamedValue, Parameter, ParameterBuilder};
pub use station::{DriverRegistry, Station, StationConfig};
pub use value::ParameterValue;
