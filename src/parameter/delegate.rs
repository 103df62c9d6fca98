//! Delegate parameters.
//!
//! A delegate exposes a named value that lives elsewhere in the instrument
//! graph under a new name (e.g. `chip.device1.gate` → `dac.ch01.voltage`).
//! Reads and writes are forwarded to the source, whose validator and ramp
//! still apply. For scheduling, a delegate reports its source's root
//! instrument as its underlying instrument, so concurrent batches never hit
//! the same physical instrument from two workers.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

use super::{CachedValue, NamedValue, OwnerSlot, RampPolicy};
use crate::error::{InstrumentError, Result};
use crate::instrument::{Instrument, InstrumentRegistry};
use crate::validators::Validator;
use crate::value::ParameterValue;

/// Named value forwarding to a source named value.
///
/// The delegate shares the source but does not own its instrument: closing
/// the source's instrument makes the delegate fail with `InstrumentClosed`.
pub struct DelegateParameter {
    name: String,
    label: Option<String>,
    unit: Option<String>,
    docstring: Option<String>,
    source: RwLock<Option<Arc<dyn NamedValue>>>,
    validator: Option<Arc<dyn Validator>>,
    ramp: RwLock<RampPolicy>,
    owner: OwnerSlot,
}

impl fmt::Debug for DelegateParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateParameter")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("source", &self.source_path())
            .finish()
    }
}

impl DelegateParameter {
    /// Builder for a delegate with optional overrides.
    pub fn builder(name: impl Into<String>) -> DelegateParameterBuilder {
        DelegateParameterBuilder::new(name)
    }

    /// Delegate inheriting label and unit from `source`.
    pub fn new(name: impl Into<String>, source: Arc<dyn NamedValue>) -> Result<Self> {
        Self::builder(name).source(source).build()
    }

    /// Delegate whose source is looked up by dotted path, e.g. `dac.ch01.voltage`.
    pub fn from_path(
        name: impl Into<String>,
        path: &str,
        registry: &InstrumentRegistry,
    ) -> Result<Self> {
        let source = registry.resolve_parameter(path)?;
        Self::new(name, source)
    }

    /// Delegate with no source yet; get/set fail until `set_source` is called.
    pub fn detached(name: impl Into<String>) -> Result<Self> {
        Self::builder(name).build()
    }

    /// Current source, if one is set.
    pub fn source(&self) -> Option<Arc<dyn NamedValue>> {
        self.source.read().clone()
    }

    /// Replace the source. An explicit unit on the delegate must match.
    pub fn set_source(&self, source: Option<Arc<dyn NamedValue>>) -> Result<()> {
        if let Some(source) = &source {
            check_unit(&self.name, self.unit.as_deref(), source.as_ref())?;
        }
        *self.source.write() = source;
        Ok(())
    }

    fn resolved_source(&self) -> Result<Arc<dyn NamedValue>> {
        self.source().ok_or_else(|| {
            InstrumentError::UnresolvedReference(format!(
                "delegate parameter '{}' has no source",
                self.full_name()
            ))
        })
    }
}

fn check_unit(name: &str, unit: Option<&str>, source: &dyn NamedValue) -> Result<()> {
    match unit {
        Some(unit) if unit != source.unit() => Err(InstrumentError::UnitMismatch {
            name: name.to_string(),
            expected: source.unit(),
            actual: unit.to_string(),
        }),
        _ => Ok(()),
    }
}

impl NamedValue for DelegateParameter {
    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> String {
        match (&self.label, self.source()) {
            (Some(label), _) => label.clone(),
            (None, Some(source)) => source.label(),
            (None, None) => self.name.clone(),
        }
    }

    fn unit(&self) -> String {
        match (&self.unit, self.source()) {
            (Some(unit), _) => unit.clone(),
            (None, Some(source)) => source.unit(),
            (None, None) => String::new(),
        }
    }

    fn docstring(&self) -> Option<String> {
        self.docstring
            .clone()
            .or_else(|| self.source().and_then(|s| s.docstring()))
    }

    fn gettable(&self) -> bool {
        self.source().is_some_and(|s| s.gettable())
    }

    fn settable(&self) -> bool {
        self.source().is_some_and(|s| s.settable())
    }

    fn get(&self) -> Result<ParameterValue> {
        self.owner.ensure_open()?;
        self.resolved_source()?.get()
    }

    fn set(&self, value: ParameterValue) -> Result<()> {
        self.owner.ensure_open()?;
        let source = self.resolved_source()?;
        self.validate(&value)?;
        if !source.settable() {
            return Err(InstrumentError::NotSettable(self.full_name()));
        }

        let ramp = self.ramp.read().clone();
        if ramp.step().is_none() {
            return source.set(value);
        }
        let start = match source.cached() {
            Some(cached) if cached.value.is_numeric() => Some(cached.value),
            _ if source.gettable() => Some(source.get()?),
            _ => None,
        };
        let plan = ramp.plan(&self.full_name(), start.as_ref(), &value)?;
        ramp.execute(&plan, |step| source.set(step.clone()))
    }

    /// Local validator first, then the source's domain.
    fn validate(&self, value: &ParameterValue) -> Result<()> {
        if let Some(validator) = &self.validator {
            validator.validate(value, &self.full_name())?;
        }
        self.resolved_source()?.validate(value)
    }

    fn cached(&self) -> Option<CachedValue> {
        self.source().and_then(|s| s.cached())
    }

    fn get_latest(&self) -> Result<ParameterValue> {
        self.owner.ensure_open()?;
        self.resolved_source()?.get_latest()
    }

    fn set_attribute(&self, attribute: &str, value: &ParameterValue) -> Result<()> {
        let integer_only = self.validator.as_ref().is_some_and(|v| v.is_integer());
        self.ramp
            .write()
            .set_attribute(&self.full_name(), attribute, value, integer_only)
    }

    fn underlying_instrument(&self) -> Option<Arc<Instrument>> {
        self.source().and_then(|s| s.underlying_instrument())
    }

    fn underlying_instruments(&self) -> Vec<Arc<Instrument>> {
        self.source()
            .map(|s| s.underlying_instruments())
            .unwrap_or_default()
    }

    fn sources(&self) -> Vec<Arc<dyn NamedValue>> {
        self.source().into_iter().collect()
    }

    fn source_path(&self) -> Option<String> {
        self.source().map(|s| s.path())
    }

    fn owner_slot(&self) -> &OwnerSlot {
        &self.owner
    }
}

/// Builder for [`DelegateParameter`].
pub struct DelegateParameterBuilder {
    name: String,
    label: Option<String>,
    unit: Option<String>,
    docstring: Option<String>,
    source: Option<Arc<dyn NamedValue>>,
    validator: Option<Arc<dyn Validator>>,
    ramp: RampPolicy,
}

impl DelegateParameterBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            unit: None,
            docstring: None,
            source: None,
            validator: None,
            ramp: RampPolicy::new(),
        }
    }

    /// Value to forward to.
    pub fn source(mut self, source: Arc<dyn NamedValue>) -> Self {
        self.source = Some(source);
        self
    }

    /// Override the source's label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Override the unit; must equal the source's unit exactly.
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Override the source's docstring.
    pub fn docstring(mut self, docstring: impl Into<String>) -> Self {
        self.docstring = Some(docstring.into());
        self
    }

    /// Additional constraint checked before forwarding to the source.
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Ramp applied by the delegate itself; each step is forwarded.
    pub fn ramp(mut self, ramp: RampPolicy) -> Self {
        self.ramp = ramp;
        self
    }

    pub fn build(self) -> Result<DelegateParameter> {
        if self.name.is_empty() || self.name.contains('.') {
            return Err(InstrumentError::validation(
                self.name,
                "parameter names must be non-empty and contain no '.'",
            ));
        }
        if let Some(source) = &self.source {
            check_unit(&self.name, self.unit.as_deref(), source.as_ref())?;
        }
        let integer_only = self.validator.as_ref().is_some_and(|v| v.is_integer());
        self.ramp.check(&self.name, integer_only)?;

        Ok(DelegateParameter {
            name: self.name,
            label: self.label,
            unit: self.unit,
            docstring: self.docstring,
            source: RwLock::new(self.source),
            validator: self.validator,
            ramp: RwLock::new(self.ramp),
            owner: OwnerSlot::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::ParameterBuilder;
    use crate::validators::Numbers;
    use parking_lot::Mutex;

    fn voltage() -> Arc<dyn NamedValue> {
        Arc::new(
            ParameterBuilder::new("voltage")
                .label("Voltage")
                .unit("V")
                .validator(Numbers::new(-1.0, 1.0))
                .manual(0.0)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_delegate_forwards_get_and_set() {
        let source = voltage();
        let gate = DelegateParameter::new("gate", source.clone()).unwrap();
        gate.set(0.5.into()).unwrap();
        assert_eq!(source.get().unwrap(), ParameterValue::Float(0.5));
        assert_eq!(gate.get().unwrap(), ParameterValue::Float(0.5));
        assert_eq!(gate.cached().unwrap().value, ParameterValue::Float(0.5));
    }

    #[test]
    fn test_delegate_inherits_unit_and_label() {
        let gate = DelegateParameter::new("gate", voltage()).unwrap();
        assert_eq!(gate.unit(), "V");
        assert_eq!(gate.label(), "Voltage");
    }

    #[test]
    fn test_delegate_unit_mismatch() {
        let err = DelegateParameter::builder("gate")
            .source(voltage())
            .unit("mV")
            .build()
            .unwrap_err();
        assert!(matches!(err, InstrumentError::UnitMismatch { .. }));
        assert!(err.to_string().contains("gate"));

        assert!(DelegateParameter::builder("gate")
            .source(voltage())
            .unit("V")
            .build()
            .is_ok());
    }

    #[test]
    fn test_source_validator_applies() {
        let gate = DelegateParameter::new("gate", voltage()).unwrap();
        assert!(matches!(
            gate.set(2.0.into()),
            Err(InstrumentError::Validation { .. })
        ));
    }

    #[test]
    fn test_local_validator_narrows_domain() {
        let gate = DelegateParameter::builder("gate")
            .source(voltage())
            .validator(Arc::new(Numbers::new(-0.5, 0.0)))
            .build()
            .unwrap();
        assert!(gate.set((-0.25).into()).is_ok());
        assert!(gate.set(0.75.into()).is_err());
    }

    #[test]
    fn test_detached_delegate() {
        let gate = DelegateParameter::detached("gate").unwrap();
        assert!(!gate.gettable());
        assert!(matches!(
            gate.get(),
            Err(InstrumentError::UnresolvedReference(_))
        ));
        gate.set_source(Some(voltage())).unwrap();
        assert_eq!(gate.get().unwrap(), ParameterValue::Float(0.0));
    }

    #[test]
    fn test_set_source_checks_explicit_unit() {
        let gate = DelegateParameter::builder("gate").unit("mV").build().unwrap();
        assert!(matches!(
            gate.set_source(Some(voltage())),
            Err(InstrumentError::UnitMismatch { .. })
        ));
    }

    #[test]
    fn test_delegate_ramp_forwards_each_step() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let log = writes.clone();
        let source: Arc<dyn NamedValue> = Arc::new(
            ParameterBuilder::new("current")
                .unit("A")
                .initial_value(0.0)
                .setter(move |v| {
                    log.lock().push(v);
                    Ok(())
                })
                .build()
                .unwrap(),
        );
        let magnet = DelegateParameter::new("field_current", source).unwrap();
        magnet.set_attribute("step", &0.1.into()).unwrap();
        magnet.set(0.3.into()).unwrap();
        assert_eq!(writes.lock().len(), 3);
        assert_eq!(*writes.lock().last().unwrap(), ParameterValue::Float(0.3));
    }

    #[test]
    fn test_out_of_domain_target_fails_before_ramping() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let log = writes.clone();
        let source: Arc<dyn NamedValue> = Arc::new(
            ParameterBuilder::new("voltage")
                .unit("V")
                .validator(Numbers::new(-1.0, 1.0))
                .initial_value(0.0)
                .setter(move |v| {
                    log.lock().push(v);
                    Ok(())
                })
                .build()
                .unwrap(),
        );
        let gate = DelegateParameter::builder("gate")
            .source(source)
            .ramp(RampPolicy::new().with_step(0.25))
            .build()
            .unwrap();

        assert!(matches!(
            gate.set(5.0.into()),
            Err(InstrumentError::Validation { .. })
        ));
        assert!(writes.lock().is_empty());
    }

    #[test]
    fn test_infinite_target_on_ramped_delegate() {
        let source: Arc<dyn NamedValue> = Arc::new(
            ParameterBuilder::new("voltage")
                .unit("V")
                .validator(Numbers::default())
                .manual(0.0)
                .build()
                .unwrap(),
        );
        let gate = DelegateParameter::new("gate", source.clone()).unwrap();
        gate.set_attribute("step", &1.0.into()).unwrap();
        assert!(gate.set(f64::INFINITY.into()).is_err());
        assert_eq!(source.get().unwrap(), ParameterValue::Float(0.0));
    }
}
