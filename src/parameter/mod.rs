//! Named values (parameters).
//!
//! A named value is a uniquely named, unit-tagged, validated quantity that
//! can be read (`get`) and/or written (`set`). Every named value belongs to
//! at most one [`Instrument`], bound once when the instrument is built.
//!
//! # Architecture
//!
//! ```text
//! NamedValue (trait, object safe)
//!   ├─ Parameter          raw getter/setter + validator + ramp + cache
//!   ├─ ArrayParameter     read-only shaped array with setpoints
//!   ├─ MultiParameter     read-only record of named items
//!   ├─ DelegateParameter  forwards to a source value elsewhere in the graph
//!   └─ GroupedParameter   fans out over several sources (see `group`)
//! ```
//!
//! The trait is what instruments, groups and the batched caller work with,
//! so any of the above can be stored as `Arc<dyn NamedValue>`.

pub mod array;
mod base;
pub mod delegate;
mod ramp;

pub use array::{ArrayParameter, MultiItem, MultiParameter, Setpoints};
pub use base::{Parameter, ParameterBuilder, RawGetter, RawSetter};
pub use delegate::{DelegateParameter, DelegateParameterBuilder};
pub use ramp::{RampPolicy, MAX_RAMP_STEPS, RAMP_ATTRIBUTES};

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::{Arc, Weak};

use crate::error::{InstrumentError, Result};
use crate::instrument::Instrument;
use crate::value::ParameterValue;

/// Descriptive metadata shared by all parameter kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterMetadata {
    /// Local name, unique within the owning instrument
    pub name: String,
    /// Human-readable label, defaults to the name
    pub label: String,
    /// Physical unit (e.g. "V", "Hz"); empty for dimensionless values
    pub unit: String,
    /// Optional longer description
    pub docstring: Option<String>,
}

impl ParameterMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            unit: String::new(),
            docstring: None,
        }
    }
}

/// Last value seen by a parameter and when it was seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedValue {
    pub value: ParameterValue,
    pub timestamp: DateTime<Utc>,
}

impl CachedValue {
    pub fn now(value: ParameterValue) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
        }
    }
}

/// Serializable state of a parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    pub name: String,
    pub full_name: String,
    pub label: String,
    pub unit: String,
    pub gettable: bool,
    pub settable: bool,
    pub value: Option<ParameterValue>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Slot holding the weak link from a named value to its owning instrument.
///
/// The link is set exactly once, when the owning instrument is built.
#[derive(Debug, Default)]
pub struct OwnerSlot {
    owner: OnceCell<Weak<Instrument>>,
}

impl OwnerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the owner. Fails if the value already belongs to an instrument.
    pub fn bind(&self, owner: Weak<Instrument>, name: &str) -> Result<()> {
        self.owner.set(owner).map_err(|_| {
            InstrumentError::NameCollision(format!(
                "parameter '{}' already belongs to an instrument",
                name
            ))
        })
    }

    pub fn is_bound(&self) -> bool {
        self.owner.get().is_some()
    }

    pub fn get(&self) -> Option<Arc<Instrument>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    /// Unbound values are always usable; bound ones need an open owner.
    pub fn ensure_open(&self) -> Result<()> {
        match self.owner.get() {
            None => Ok(()),
            Some(weak) => match weak.upgrade() {
                Some(owner) if !owner.is_closed() => Ok(()),
                Some(owner) => Err(InstrumentError::InstrumentClosed(owner.full_name())),
                None => Err(InstrumentError::InstrumentClosed("<dropped>".to_string())),
            },
        }
    }

    /// Owner's full name, or `"<unbound>"`.
    pub fn owner_name(&self) -> String {
        self.get()
            .map(|owner| owner.full_name())
            .unwrap_or_else(|| "<unbound>".to_string())
    }
}

/// Uniform get/set protocol plus introspection for every parameter kind.
pub trait NamedValue: Send + Sync + Debug {
    /// Local name within the owning instrument.
    fn name(&self) -> &str;

    fn label(&self) -> String;

    fn unit(&self) -> String;

    fn docstring(&self) -> Option<String> {
        None
    }

    fn gettable(&self) -> bool;

    fn settable(&self) -> bool;

    /// True for declared-but-unimplemented parameters.
    fn is_abstract(&self) -> bool {
        false
    }

    /// Read the value (from hardware when backed by it) and update the cache.
    fn get(&self) -> Result<ParameterValue>;

    /// Validate and write a value.
    fn set(&self, value: ParameterValue) -> Result<()>;

    /// Check a value against this value's domain without writing anything.
    fn validate(&self, _value: &ParameterValue) -> Result<()> {
        Ok(())
    }

    /// Last cached value, without touching hardware.
    fn cached(&self) -> Option<CachedValue>;

    fn owner_slot(&self) -> &OwnerSlot;

    /// Cached value if present and fresh, otherwise a fresh `get`.
    fn get_latest(&self) -> Result<ParameterValue> {
        match self.cached() {
            Some(cached) => Ok(cached.value),
            None => self.get(),
        }
    }

    /// Adjust a runtime attribute such as `step` or `inter_delay`.
    fn set_attribute(&self, attribute: &str, _value: &ParameterValue) -> Result<()> {
        Err(InstrumentError::InvalidAttribute {
            parameter: self.full_name(),
            attribute: attribute.to_string(),
            message: "not supported by this parameter kind".to_string(),
        })
    }

    /// Root instrument whose hardware this value touches.
    ///
    /// Delegates report their source's instrument here, not their own owner.
    fn underlying_instrument(&self) -> Option<Arc<Instrument>> {
        self.root_instrument()
    }

    /// Every root instrument this value touches.
    fn underlying_instruments(&self) -> Vec<Arc<Instrument>> {
        self.underlying_instrument().into_iter().collect()
    }

    /// Values this one forwards to. Empty for values that talk to hardware
    /// themselves.
    fn sources(&self) -> Vec<Arc<dyn NamedValue>> {
        Vec::new()
    }

    /// Dotted path of the value this one forwards to, if any.
    fn source_path(&self) -> Option<String> {
        None
    }

    fn owner(&self) -> Option<Arc<Instrument>> {
        self.owner_slot().get()
    }

    fn root_instrument(&self) -> Option<Arc<Instrument>> {
        self.owner().map(|owner| owner.root_instrument())
    }

    fn bind_owner(&self, owner: Weak<Instrument>) -> Result<()> {
        self.owner_slot().bind(owner, self.name())
    }

    /// Owner path and name joined with `_`, e.g. `dac_ch01_voltage`.
    fn full_name(&self) -> String {
        match self.owner() {
            Some(owner) => format!("{}_{}", owner.full_name(), self.name()),
            None => self.name().to_string(),
        }
    }

    /// Owner path and name joined with `.`, e.g. `dac.ch01.voltage`.
    fn path(&self) -> String {
        match self.owner() {
            Some(owner) => format!("{}.{}", owner.path(), self.name()),
            None => self.name().to_string(),
        }
    }

    /// Call-style access: `None` gets, `Some(value)` sets.
    fn call(&self, value: Option<ParameterValue>) -> Result<Option<ParameterValue>> {
        match value {
            None => self.get().map(Some),
            Some(value) => self.set(value).map(|_| None),
        }
    }

    fn snapshot(&self) -> ParameterSnapshot {
        let cached = self.cached();
        ParameterSnapshot {
            name: self.name().to_string(),
            full_name: self.full_name(),
            label: self.label(),
            unit: self.unit(),
            gettable: self.gettable(),
            settable: self.settable(),
            value: cached.as_ref().map(|c| c.value.clone()),
            timestamp: cached.map(|c| c.timestamp),
            source: self.source_path(),
        }
    }
}
