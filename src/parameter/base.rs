//! `Parameter` - the concrete, hardware-backed named value.
//!
//! A parameter wraps a raw getter and/or raw setter supplied by its owner
//! (driver code talking to hardware) with:
//! - validation of user values before anything is written
//! - value mapping and scale/offset between user values and raw values
//! - a step/delay ramp for writes
//! - a timestamped cache of the last value read or written
//!
//! # Example
//!
//! ```rust
//! use rust_labctl::parameter::{NamedValue, ParameterBuilder};
//! use rust_labctl::validators::Numbers;
//!
//! let voltage = ParameterBuilder::new("voltage")
//!     .unit("V")
//!     .validator(Numbers::new(-10.0, 10.0))
//!     .manual(0.0)
//!     .step(0.5)
//!     .build()
//!     .unwrap();
//!
//! voltage.set(2.0.into()).unwrap();
//! assert_eq!(voltage.get().unwrap().as_f64(), Some(2.0));
//! assert!(voltage.set(20.0.into()).is_err());
//! ```

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{CachedValue, NamedValue, OwnerSlot, ParameterMetadata, RampPolicy};
use crate::error::{InstrumentError, Result};
use crate::validators::{Enum, Validator};
use crate::value::ParameterValue;

/// Raw read function supplied by the owning driver.
pub type RawGetter = Arc<dyn Fn() -> Result<ParameterValue> + Send + Sync>;

/// Raw write function supplied by the owning driver.
pub type RawSetter = Arc<dyn Fn(ParameterValue) -> Result<()> + Send + Sync>;

/// Concrete named value backed by raw get/set functions.
pub struct Parameter {
    metadata: ParameterMetadata,
    validator: Option<Arc<dyn Validator>>,
    getter: Option<RawGetter>,
    setter: Option<RawSetter>,
    ramp: RwLock<RampPolicy>,
    scale: Option<f64>,
    offset: Option<f64>,
    /// (user value, raw value) pairs
    val_mapping: Option<Vec<(ParameterValue, ParameterValue)>>,
    max_val_age: Option<Duration>,
    cache: Mutex<Option<CachedValue>>,
    is_abstract: bool,
    owner: OwnerSlot,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("metadata", &self.metadata)
            .field("validator", &self.validator)
            .field("has_getter", &self.getter.is_some())
            .field("has_setter", &self.setter.is_some())
            .field("ramp", &*self.ramp.read())
            .field("is_abstract", &self.is_abstract)
            .finish()
    }
}

impl Parameter {
    /// Start building a parameter.
    pub fn builder(name: impl Into<String>) -> ParameterBuilder {
        ParameterBuilder::new(name)
    }

    /// Name, label, unit and docstring.
    pub fn metadata(&self) -> &ParameterMetadata {
        &self.metadata
    }

    /// Validator applied to every write, if any.
    pub fn validator(&self) -> Option<&Arc<dyn Validator>> {
        self.validator.as_ref()
    }

    /// Snapshot of the current ramp policy.
    pub fn ramp(&self) -> RampPolicy {
        self.ramp.read().clone()
    }


    fn integer_only(&self) -> bool {
        self.validator.as_ref().is_some_and(|v| v.is_integer())
    }

    fn check_implemented(&self) -> Result<()> {
        if self.is_abstract {
            Err(InstrumentError::AbstractParameter {
                owner: self.owner.owner_name(),
                name: self.metadata.name.clone(),
            })
        } else {
            Ok(())
        }
    }

    fn to_raw(&self, value: &ParameterValue) -> Result<ParameterValue> {
        let mut raw = value.clone();
        if let Some(mapping) = &self.val_mapping {
            raw = mapping
                .iter()
                .find(|(user, _)| user == value)
                .map(|(_, raw)| raw.clone())
                .ok_or_else(|| {
                    InstrumentError::validation(self.full_name(), format!("{} has no mapping", value))
                })?;
        }
        if self.scale.is_some() || self.offset.is_some() {
            if let Some(v) = raw.as_f64() {
                raw = ParameterValue::Float(v * self.scale.unwrap_or(1.0) + self.offset.unwrap_or(0.0));
            }
        }
        Ok(raw)
    }

    fn from_raw(&self, raw: ParameterValue) -> Result<ParameterValue> {
        let mut value = raw;
        if self.scale.is_some() || self.offset.is_some() {
            if let Some(v) = value.as_f64() {
                value = ParameterValue::Float((v - self.offset.unwrap_or(0.0)) / self.scale.unwrap_or(1.0));
            }
        }
        if let Some(mapping) = &self.val_mapping {
            value = mapping
                .iter()
                .find(|(_, raw)| *raw == value)
                .map(|(user, _)| user.clone())
                .ok_or_else(|| {
                    InstrumentError::Hardware(format!(
                        "'{}' returned unmapped raw value {}",
                        self.full_name(),
                        value
                    ))
                })?;
        }
        Ok(value)
    }

    fn update_cache(&self, value: ParameterValue) {
        *self.cache.lock() = Some(CachedValue::now(value));
    }

    /// Numeric value the ramp starts from: the cache, else a fresh read.
    fn ramp_start(&self) -> Result<Option<ParameterValue>> {
        if let Some(cached) = self.cached() {
            if cached.value.is_numeric() {
                return Ok(Some(cached.value));
            }
        }
        if self.getter.is_some() {
            return self.get().map(Some);
        }
        Ok(None)
    }
}

impl NamedValue for Parameter {
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn label(&self) -> String {
        self.metadata.label.clone()
    }

    fn unit(&self) -> String {
        self.metadata.unit.clone()
    }

    fn docstring(&self) -> Option<String> {
        self.metadata.docstring.clone()
    }

    fn gettable(&self) -> bool {
        !self.is_abstract && self.getter.is_some()
    }

    fn settable(&self) -> bool {
        !self.is_abstract && self.setter.is_some()
    }

    fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    fn get(&self) -> Result<ParameterValue> {
        self.check_implemented()?;
        self.owner.ensure_open()?;
        let getter = self
            .getter
            .as_ref()
            .ok_or_else(|| InstrumentError::NotGettable(self.full_name()))?;
        let value = self.from_raw(getter()?)?;
        self.update_cache(value.clone());
        Ok(value)
    }

    fn set(&self, value: ParameterValue) -> Result<()> {
        self.check_implemented()?;
        self.owner.ensure_open()?;
        self.validate(&value)?;
        let setter = self
            .setter
            .clone()
            .ok_or_else(|| InstrumentError::NotSettable(self.full_name()))?;

        let ramp = self.ramp();
        let plan = if ramp.step().is_some() && value.is_numeric() {
            let start = self.ramp_start()?;
            ramp.plan(&self.full_name(), start.as_ref(), &value)?
        } else {
            vec![value]
        };
        if plan.len() > 1 {
            debug!(parameter = %self.full_name(), steps = plan.len(), "ramping");
        }

        ramp.execute(&plan, |step| {
            self.validate(step)?;
            setter(self.to_raw(step)?)?;
            self.update_cache(step.clone());
            Ok(())
        })
    }

    fn validate(&self, value: &ParameterValue) -> Result<()> {
        match &self.validator {
            Some(validator) => validator.validate(value, &self.full_name()),
            None => Ok(()),
        }
    }

    fn cached(&self) -> Option<CachedValue> {
        self.cache.lock().clone()
    }

    fn get_latest(&self) -> Result<ParameterValue> {
        if let Some(cached) = self.cached() {
            let fresh = match self.max_val_age {
                None => true,
                Some(max_age) => chrono::Utc::now()
                    .signed_duration_since(cached.timestamp)
                    .to_std()
                    .map(|age| age <= max_age)
                    .unwrap_or(true),
            };
            if fresh || !self.gettable() {
                return Ok(cached.value);
            }
        }
        self.get()
    }

    fn set_attribute(&self, attribute: &str, value: &ParameterValue) -> Result<()> {
        let integer_only = self.integer_only();
        self.ramp
            .write()
            .set_attribute(&self.full_name(), attribute, value, integer_only)
    }

    fn owner_slot(&self) -> &OwnerSlot {
        &self.owner
    }
}

/// Builder for creating parameters with a fluent API.
///
/// # Example
///
/// ```rust
/// use rust_labctl::parameter::ParameterBuilder;
/// use rust_labctl::validators::Numbers;
///
/// let frequency = ParameterBuilder::new("frequency")
///     .label("Reference frequency")
///     .unit("Hz")
///     .validator(Numbers::new(1e-3, 102e3))
///     .manual(1000.0)
///     .build()
///     .unwrap();
/// ```
pub struct ParameterBuilder {
    metadata: ParameterMetadata,
    validator: Option<Arc<dyn Validator>>,
    getter: Option<RawGetter>,
    setter: Option<RawSetter>,
    initial_value: Option<ParameterValue>,
    ramp: RampPolicy,
    scale: Option<f64>,
    offset: Option<f64>,
    val_mapping: Option<Vec<(ParameterValue, ParameterValue)>>,
    max_val_age: Option<Duration>,
    is_abstract: bool,
}

impl ParameterBuilder {
    /// Create a new parameter builder.
    ///
    /// # Arguments
    ///
    /// * `name` - Parameter identifier, unique within its instrument (e.g., "voltage")
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ParameterMetadata::new(name),
            validator: None,
            getter: None,
            setter: None,
            initial_value: None,
            ramp: RampPolicy::new(),
            scale: None,
            offset: None,
            val_mapping: None,
            max_val_age: None,
            is_abstract: false,
        }
    }

    /// Human-readable label (defaults to the name).
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.metadata.label = label.into();
        self
    }

    /// Set parameter unit of measurement. Fixed for the parameter's lifetime.
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.metadata.unit = unit.into();
        self
    }

    /// Longer description shown in snapshots.
    pub fn docstring(mut self, docstring: impl Into<String>) -> Self {
        self.metadata.docstring = Some(docstring.into());
        self
    }

    /// Reject writes outside this validator's domain.
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Same as `validator`, for a validator already behind an `Arc`.
    pub fn shared_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Connect the raw read function.
    pub fn getter(
        mut self,
        getter: impl Fn() -> Result<ParameterValue> + Send + Sync + 'static,
    ) -> Self {
        self.getter = Some(Arc::new(getter));
        self
    }

    /// Connect the raw write function.
    pub fn setter(
        mut self,
        setter: impl Fn(ParameterValue) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.setter = Some(Arc::new(setter));
        self
    }

    /// Back the parameter by an in-memory value instead of hardware.
    pub fn manual(mut self, initial: impl Into<ParameterValue>) -> Self {
        let initial = initial.into();
        let store = Arc::new(Mutex::new(initial.clone()));
        let read = store.clone();
        self.getter = Some(Arc::new(move || Ok(read.lock().clone())));
        self.setter = Some(Arc::new(move |value| {
            *store.lock() = value;
            Ok(())
        }));
        self.initial_value = Some(initial);
        self
    }

    /// Seed the cache without touching hardware.
    pub fn initial_value(mut self, value: impl Into<ParameterValue>) -> Self {
        self.initial_value = Some(value.into());
        self
    }

    /// Maximum size of a single write; larger moves are ramped.
    pub fn step(mut self, step: f64) -> Self {
        self.ramp = self.ramp.with_step(step);
        self
    }

    /// Pause between ramp steps.
    pub fn inter_delay(mut self, delay: Duration) -> Self {
        self.ramp = self.ramp.with_inter_delay(delay);
        self
    }

    /// Pause after the final write of every set.
    pub fn post_delay(mut self, delay: Duration) -> Self {
        self.ramp = self.ramp.with_post_delay(delay);
        self
    }

    /// raw = value * scale + offset
    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Added after scaling on write.
    pub fn offset(mut self, offset: f64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Translate user values to raw values (and back on read).
    pub fn val_mapping<I, U, R>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (U, R)>,
        U: Into<ParameterValue>,
        R: Into<ParameterValue>,
    {
        self.val_mapping = Some(
            pairs
                .into_iter()
                .map(|(user, raw)| (user.into(), raw.into()))
                .collect(),
        );
        self
    }

    /// Cached values older than this are refreshed by `get_latest`.
    pub fn max_val_age(mut self, age: Duration) -> Self {
        self.max_val_age = Some(age);
        self
    }

    /// Declare the parameter without implementing it.
    ///
    /// An instrument holding an abstract parameter cannot be built until a
    /// concrete parameter with the same name and unit replaces it.
    pub fn abstract_(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Build the parameter, checking scale, step and initial value.
    pub fn build(self) -> Result<Parameter> {
        let name = self.metadata.name.clone();
        if name.is_empty() || name.contains('.') {
            return Err(InstrumentError::validation(
                name,
                "parameter names must be non-empty and contain no '.'",
            ));
        }
        if self.scale == Some(0.0) {
            return Err(InstrumentError::InvalidAttribute {
                parameter: name,
                attribute: "scale".to_string(),
                message: "must be non-zero".to_string(),
            });
        }

        let validator = match (self.validator, &self.val_mapping) {
            (None, Some(mapping)) => Some(Arc::new(Enum::new(
                mapping.iter().map(|(user, _)| user.clone()),
            )) as Arc<dyn Validator>),
            (validator, _) => validator,
        };
        let integer_only = validator.as_ref().is_some_and(|v| v.is_integer());
        self.ramp.check(&name, integer_only)?;

        if let (Some(initial), Some(validator)) = (&self.initial_value, &validator) {
            validator.validate(initial, &name)?;
        }

        let (getter, setter) = if self.is_abstract {
            (None, None)
        } else {
            (self.getter, self.setter)
        };

        Ok(Parameter {
            metadata: self.metadata,
            validator,
            getter,
            setter,
            ramp: RwLock::new(self.ramp),
            scale: self.scale,
            offset: self.offset,
            val_mapping: self.val_mapping,
            max_val_age: self.max_val_age,
            cache: Mutex::new(self.initial_value.map(CachedValue::now)),
            is_abstract: self.is_abstract,
            owner: OwnerSlot::new(),
        })
    }
}
