//! Instrument groups: virtual instruments composed from existing ones.
//!
//! A group re-exposes named values of registered instruments under new
//! names, organised into submodules. For example a chip with two devices,
//! each with a gate driven by a DAC channel:
//!
//! ```yaml
//! submodules:
//!   device1:
//!     parameters:
//!       gate: dac.ch01.voltage
//!       both_gates: [dac.ch01.voltage, dac.ch02.voltage]
//!     channels:
//!       readout: lockin
//!       gate_channel:
//!         channel: dac.ch01
//!         type: delegate
//!         ranges:
//!           voltage: [-0.5, 0.5]
//! set_initial_values_on_load: true
//! initial_values:
//!   device1.gate.step: 0.01
//!   device1.gate: 0.1
//! ```
//!
//! Building happens in declaration order. One target becomes a
//! [`DelegateParameter`], several become a [`GroupedParameter`]. The group
//! is registered only after every step, initial values included, succeeded.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{InstrumentError, Result};
use crate::instrument::{Instrument, InstrumentBuilder, InstrumentRegistry};
use crate::parameter::{CachedValue, DelegateParameter, NamedValue, OwnerSlot, RAMP_ATTRIBUTES};
use crate::validators::Numbers;
use crate::value::ParameterValue;

/// One dotted target path or an ordered list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Targets {
    One(String),
    Many(Vec<String>),
}

impl Targets {
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Targets::One(path) => vec![path.as_str()],
            Targets::Many(paths) => paths.iter().map(String::as_str).collect(),
        }
    }
}

/// A channel attached to a group submodule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelSpec {
    /// Dotted path of an existing instrument or submodule, attached as is.
    Path(String),
    /// Channel wrapped by a factory from the [`ChannelTypeRegistry`].
    Typed {
        channel: String,
        #[serde(rename = "type")]
        kind: String,
        #[serde(flatten)]
        extra: IndexMap<String, serde_json::Value>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmoduleSpec {
    /// Exposed name → target path(s)
    pub parameters: IndexMap<String, Targets>,
    /// Local name → channel
    pub channels: IndexMap<String, ChannelSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSpec {
    pub submodules: IndexMap<String, SubmoduleSpec>,
    pub set_initial_values_on_load: bool,
    /// Dotted path (relative to the group) → value, applied in order.
    pub initial_values: IndexMap<String, ParameterValue>,
}

/// Named value aggregating several targets under one name.
///
/// `get` returns an `Array` of the targets' values in target order. `set`
/// writes element-wise when given an array of matching length and
/// broadcasts anything else.
pub struct GroupedParameter {
    name: String,
    targets: Vec<Arc<dyn NamedValue>>,
    owner: OwnerSlot,
}

impl fmt::Debug for GroupedParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupedParameter")
            .field("name", &self.name)
            .field(
                "targets",
                &self.targets.iter().map(|t| t.path()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl GroupedParameter {
    /// Grouped value over `targets`, in order.
    pub fn new(name: impl Into<String>, targets: Vec<Arc<dyn NamedValue>>) -> Result<Self> {
        let name = name.into();
        if targets.is_empty() {
            return Err(InstrumentError::ShapeMismatch {
                name,
                message: "a grouped parameter needs at least one target".to_string(),
            });
        }
        Ok(Self {
            name,
            targets,
            owner: OwnerSlot::new(),
        })
    }

    pub fn targets(&self) -> &[Arc<dyn NamedValue>] {
        &self.targets
    }

    fn split(&self, value: ParameterValue) -> Result<Vec<ParameterValue>> {
        let n = self.targets.len();
        let values = match value {
            ParameterValue::Array(values) => values,
            ParameterValue::FloatArray(values) => values.into_iter().map(Into::into).collect(),
            ParameterValue::IntArray(values) => values.into_iter().map(Into::into).collect(),
            scalar => return Ok(vec![scalar; n]),
        };
        if values.len() != n {
            return Err(InstrumentError::ShapeMismatch {
                name: self.full_name(),
                message: format!("expected {} values, got {}", n, values.len()),
            });
        }
        Ok(values)
    }

    /// Validate each element against its target before any write happens.
    fn check_elements(&self, values: &[ParameterValue]) -> Result<()> {
        self.targets
            .iter()
            .zip(values)
            .try_for_each(|(target, value)| target.validate(value))
    }
}

impl NamedValue for GroupedParameter {
    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> String {
        self.name.clone()
    }

    /// Shared unit of the targets, or their units joined with ", ".
    fn unit(&self) -> String {
        let units: Vec<String> = self.targets.iter().map(|t| t.unit()).collect();
        if units.windows(2).all(|w| w[0] == w[1]) {
            units.into_iter().next().unwrap_or_default()
        } else {
            units.join(", ")
        }
    }

    fn gettable(&self) -> bool {
        self.targets.iter().all(|t| t.gettable())
    }

    fn settable(&self) -> bool {
        self.targets.iter().all(|t| t.settable())
    }

    fn get(&self) -> Result<ParameterValue> {
        self.owner.ensure_open()?;
        let values = self
            .targets
            .iter()
            .map(|t| t.get())
            .collect::<Result<Vec<_>>>()?;
        Ok(ParameterValue::Array(values))
    }

    fn set(&self, value: ParameterValue) -> Result<()> {
        self.owner.ensure_open()?;
        if !self.settable() {
            return Err(InstrumentError::NotSettable(self.full_name()));
        }
        let values = self.split(value)?;
        self.check_elements(&values)?;
        for (target, value) in self.targets.iter().zip(values) {
            target.set(value)?;
        }
        Ok(())
    }

    /// Every element must be valid for its target.
    fn validate(&self, value: &ParameterValue) -> Result<()> {
        self.check_elements(&self.split(value.clone())?)
    }

    /// Present only when every target has a cached value.
    fn cached(&self) -> Option<CachedValue> {
        let cached = self
            .targets
            .iter()
            .map(|t| t.cached())
            .collect::<Option<Vec<_>>>()?;
        let timestamp = cached.iter().map(|c| c.timestamp).max()?;
        Some(CachedValue {
            value: ParameterValue::Array(cached.into_iter().map(|c| c.value).collect()),
            timestamp,
        })
    }

    fn underlying_instrument(&self) -> Option<Arc<Instrument>> {
        self.underlying_instruments().into_iter().next()
    }

    fn underlying_instruments(&self) -> Vec<Arc<Instrument>> {
        let mut seen = HashSet::new();
        self.targets
            .iter()
            .flat_map(|t| t.underlying_instruments())
            .filter(|i| seen.insert(i.id()))
            .collect()
    }

    fn sources(&self) -> Vec<Arc<dyn NamedValue>> {
        self.targets.clone()
    }

    fn source_path(&self) -> Option<String> {
        Some(
            self.targets
                .iter()
                .map(|t| t.path())
                .collect::<Vec<_>>()
                .join(", "),
        )
    }

    fn owner_slot(&self) -> &OwnerSlot {
        &self.owner
    }
}

/// Builds a wrapper submodule around an existing channel.
pub type ChannelFactory = Arc<
    dyn Fn(&Arc<Instrument>, &IndexMap<String, serde_json::Value>) -> Result<InstrumentBuilder>
        + Send
        + Sync,
>;

/// Channel wrapper factories keyed by type name.
#[derive(Clone)]
pub struct ChannelTypeRegistry {
    factories: IndexMap<String, ChannelFactory>,
}

impl fmt::Debug for ChannelTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTypeRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ChannelTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTypeRegistry {
    /// Registry with the built-in `delegate` wrapper.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: IndexMap::new(),
        };
        registry.register("delegate", delegate_channel);
        registry
    }

    /// Add or replace a channel wrapper factory.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&Arc<Instrument>, &IndexMap<String, serde_json::Value>) -> Result<InstrumentBuilder>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn create(
        &self,
        kind: &str,
        channel: &Arc<Instrument>,
        extra: &IndexMap<String, serde_json::Value>,
    ) -> Result<InstrumentBuilder> {
        let factory = self.factories.get(kind).ok_or_else(|| {
            InstrumentError::Configuration(format!("unknown channel type '{}'", kind))
        })?;
        factory(channel, extra)
    }
}

/// Wrap every named value of `channel` in a delegate. An optional
/// `ranges: {name: [min, max]}` narrows individual values.
fn delegate_channel(
    channel: &Arc<Instrument>,
    extra: &IndexMap<String, serde_json::Value>,
) -> Result<InstrumentBuilder> {
    let mut ranges: IndexMap<String, (f64, f64)> = match extra.get("ranges") {
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            InstrumentError::Configuration(format!(
                "invalid ranges for channel '{}': {}",
                channel.path(),
                e
            ))
        })?,
        None => IndexMap::new(),
    };
    for key in extra.keys().filter(|k| k.as_str() != "ranges") {
        warn!(channel = %channel.path(), option = %key, "ignoring unknown channel option");
    }

    let mut builder = InstrumentBuilder::new(channel.name());
    for (name, source) in channel.parameters() {
        let mut delegate = DelegateParameter::builder(name).source(source.clone());
        if let Some((min, max)) = ranges.shift_remove(name) {
            delegate = delegate.validator(Arc::new(Numbers::new(min, max)));
        }
        builder.add_parameter(delegate.build()?)?;
    }
    if let Some(name) = ranges.keys().next() {
        return Err(InstrumentError::UnresolvedReference(format!(
            "{}.{}",
            channel.path(),
            name
        )));
    }
    Ok(builder)
}

/// A declarative group, built against a registry of existing instruments.
#[derive(Debug, Clone)]
pub struct InstrumentGroup {
    name: String,
    spec: GroupSpec,
}

impl InstrumentGroup {
    pub fn new(name: impl Into<String>, spec: GroupSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &GroupSpec {
        &self.spec
    }

    /// Build the group and register it under its name.
    pub fn build(
        &self,
        registry: &InstrumentRegistry,
        channel_types: &ChannelTypeRegistry,
    ) -> Result<Arc<Instrument>> {
        if registry.contains(&self.name) {
            return Err(InstrumentError::NameCollision(format!(
                "instrument '{}' is already registered",
                self.name
            )));
        }

        let mut builder = InstrumentBuilder::new(&self.name);
        for (sub_name, sub_spec) in &self.spec.submodules {
            let child = self.build_submodule(sub_name, sub_spec, registry, channel_types)?;
            builder.add_submodule(sub_name, child)?;
        }
        let group = builder.build_detached()?;

        if self.spec.set_initial_values_on_load {
            for (path, value) in &self.spec.initial_values {
                apply_initial_value(&group, path, value).inspect_err(|e| {
                    warn!(group = %self.name, path = %path, error = %e, "initial value failed");
                })?;
            }
        }

        registry.register(group.clone())?;
        info!(group = %self.name, submodules = self.spec.submodules.len(), "group created");
        Ok(group)
    }

    fn build_submodule(
        &self,
        name: &str,
        spec: &SubmoduleSpec,
        registry: &InstrumentRegistry,
        channel_types: &ChannelTypeRegistry,
    ) -> Result<InstrumentBuilder> {
        let mut child = InstrumentBuilder::new(name);

        for (exposed, targets) in &spec.parameters {
            let sources = targets
                .paths()
                .into_iter()
                .map(|path| registry.resolve_parameter(path))
                .collect::<Result<Vec<_>>>()?;
            debug!(
                parameter = %format!("{}.{}.{}", self.name, name, exposed),
                targets = ?targets.paths(),
                "exposing"
            );
            match <[_; 1]>::try_from(sources) {
                Ok([source]) => {
                    child.add_parameter(DelegateParameter::new(exposed, source)?)?;
                }
                Err(sources) => {
                    child.add_parameter(GroupedParameter::new(exposed, sources)?)?;
                }
            }
        }

        for (local, channel) in &spec.channels {
            match channel {
                ChannelSpec::Path(path) => {
                    child.attach_submodule(local, registry.resolve_instrument(path)?)?;
                }
                ChannelSpec::Typed {
                    channel,
                    kind,
                    extra,
                } => {
                    let target = registry.resolve_instrument(channel)?;
                    let wrapper = channel_types.create(kind, &target, extra)?;
                    child.add_submodule(local, wrapper)?;
                }
            }
        }
        Ok(child)
    }
}

/// Apply one initial value. A path whose last segment is a ramp attribute
/// (`step`, `inter_delay`, `post_delay`) adjusts that attribute instead.
fn apply_initial_value(group: &Instrument, path: &str, value: &ParameterValue) -> Result<()> {
    match group.resolve_parameter(path) {
        Ok(parameter) => parameter.set(value.clone()),
        Err(err) => match path.rsplit_once('.') {
            Some((target, attribute)) if RAMP_ATTRIBUTES.contains(&attribute) => {
                group.resolve_parameter(target)?.set_attribute(attribute, value)
            }
            _ => Err(err),
        },
    }
}
