//! Instruments: owners of named values and submodules.
//!
//! An [`Instrument`] is built once from an [`InstrumentBuilder`] and is
//! immutable afterwards apart from its closed flag. Drivers describe their
//! parameters through [`InstrumentDriver::declare`]; a derived driver calls
//! its base driver's `declare` first and then adds concrete parameters that
//! replace the base's abstract declarations.
//!
//! ```text
//! InstrumentRegistry ─┬─ "dac"  Instrument
//!                     │           ├─ ch01  Instrument (submodule)
//!                     │           │          └─ voltage  Parameter
//!                     │           └─ ch02  ...
//!                     └─ "chip" Instrument (group)
//!                                 └─ device1 ─ gate  DelegateParameter → dac.ch01.voltage
//! ```

mod registry;

pub use registry::InstrumentRegistry;
pub(crate) use registry::RegistryInner;

use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{InstrumentError, Result};
use crate::parameter::{NamedValue, ParameterSnapshot};
use crate::value::ParameterValue;

/// Process-unique identity of an instrument instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentId(Uuid);

impl InstrumentId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serializable state of an instrument tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSnapshot {
    pub name: String,
    pub full_name: String,
    pub parameters: IndexMap<String, ParameterSnapshot>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub submodules: IndexMap<String, InstrumentSnapshot>,
}

/// A named collection of named values and submodules.
pub struct Instrument {
    id: InstrumentId,
    name: String,
    parent: OnceCell<Weak<Instrument>>,
    parameters: IndexMap<String, Arc<dyn NamedValue>>,
    submodules: IndexMap<String, Arc<Instrument>>,
    closed: AtomicBool,
    registry: OnceCell<Weak<RegistryInner>>,
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parameters", &self.parameters.keys().collect::<Vec<_>>())
            .field("submodules", &self.submodules.keys().collect::<Vec<_>>())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Instrument {
    pub fn id(&self) -> InstrumentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The instrument this one was built inside, if any.
    pub fn parent(&self) -> Option<Arc<Instrument>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    /// Top-level instrument of the tree this instrument belongs to.
    pub fn root_instrument(self: &Arc<Self>) -> Arc<Instrument> {
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Ancestor names and own name joined with `_`, e.g. `dac_ch01`.
    pub fn full_name(&self) -> String {
        match self.parent() {
            Some(parent) => format!("{}_{}", parent.full_name(), self.name),
            None => self.name.clone(),
        }
    }

    /// Ancestor names and own name joined with `.`, e.g. `dac.ch01`.
    pub fn path(&self) -> String {
        match self.parent() {
            Some(parent) => format!("{}.{}", parent.path(), self.name),
            None => self.name.clone(),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<Arc<dyn NamedValue>> {
        self.parameters.get(name).cloned()
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&str, &Arc<dyn NamedValue>)> {
        self.parameters.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn submodule(&self, name: &str) -> Option<Arc<Instrument>> {
        self.submodules.get(name).cloned()
    }

    pub fn submodules(&self) -> impl Iterator<Item = (&str, &Arc<Instrument>)> {
        self.submodules.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Look up a submodule by dotted path relative to this instrument.
    pub fn resolve_submodule(&self, path: &str) -> Result<Arc<Instrument>> {
        let mut parts = path.split('.');
        let first = parts.next().unwrap_or_default();
        let mut current = self
            .submodule(first)
            .ok_or_else(|| self.unresolved(path))?;
        for part in parts {
            current = current
                .submodule(part)
                .ok_or_else(|| self.unresolved(path))?;
        }
        Ok(current)
    }

    /// Look up a named value by dotted path, e.g. `ch01.voltage`.
    pub fn resolve_parameter(&self, path: &str) -> Result<Arc<dyn NamedValue>> {
        match path.rsplit_once('.') {
            None => self.parameter(path).ok_or_else(|| self.unresolved(path)),
            Some((modules, name)) => self
                .resolve_submodule(modules)?
                .parameter(name)
                .ok_or_else(|| self.unresolved(path)),
        }
    }

    fn unresolved(&self, path: &str) -> InstrumentError {
        InstrumentError::UnresolvedReference(format!("{}.{}", self.path(), path))
    }

    /// Read a named value by dotted path.
    pub fn get(&self, path: &str) -> Result<ParameterValue> {
        self.resolve_parameter(path)?.get()
    }

    /// Write a named value by dotted path.
    pub fn set(&self, path: &str, value: impl Into<ParameterValue>) -> Result<()> {
        self.resolve_parameter(path)?.set(value.into())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn owns(&self, child: &Instrument) -> bool {
        child
            .parent
            .get()
            .is_some_and(|parent| std::ptr::eq(parent.as_ptr(), self))
    }

    /// Close the instrument and every submodule it owns, and remove it
    /// from its registry. Submodules attached from elsewhere stay open.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for child in self.submodules.values() {
            if self.owns(child) {
                child.close();
            }
        }
        if let Some(registry) = self.registry.get().and_then(Weak::upgrade) {
            registry.remove(&self.name, self.id);
        }
        info!(instrument = %self.full_name(), "instrument closed");
    }

    /// Capture the tree. With `update`, gettable values are read first.
    pub fn snapshot(&self, update: bool) -> InstrumentSnapshot {
        let parameters = self
            .parameters
            .iter()
            .map(|(name, param)| {
                if update && param.gettable() {
                    if let Err(e) = param.get() {
                        warn!(parameter = %param.full_name(), error = %e, "snapshot read failed");
                    }
                }
                (name.clone(), param.snapshot())
            })
            .collect();
        let submodules = self
            .submodules
            .iter()
            .map(|(name, child)| (name.clone(), child.snapshot(update)))
            .collect();
        InstrumentSnapshot {
            name: self.name.clone(),
            full_name: self.full_name(),
            parameters,
            submodules,
        }
    }

    pub(crate) fn attach_registry(&self, registry: Weak<RegistryInner>) {
        let _ = self.registry.set(registry);
    }
}

/// Declares the named values a kind of instrument provides.
///
/// Implementations for derived instruments call their base driver first,
/// then add concrete parameters that resolve the base's abstract ones.
pub trait InstrumentDriver: Send + Sync {
    fn declare(&self, builder: &mut InstrumentBuilder) -> Result<()>;

    /// Declare into a fresh builder and register the result.
    fn build(&self, name: &str, registry: &InstrumentRegistry) -> Result<Arc<Instrument>>
    where
        Self: Sized,
    {
        let mut builder = InstrumentBuilder::new(name);
        builder.apply(self)?;
        builder.build(registry)
    }
}

enum SubmoduleDecl {
    Owned(InstrumentBuilder),
    Attached(Arc<Instrument>),
}

/// Collects declarations and builds an [`Instrument`].
///
/// All construction checks run in `build`: unresolved abstract parameters
/// (including those of owned submodules) fail with `UnresolvedAbstract`
/// before anything is registered.
pub struct InstrumentBuilder {
    name: String,
    parameters: IndexMap<String, Arc<dyn NamedValue>>,
    submodules: IndexMap<String, SubmoduleDecl>,
}

impl InstrumentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: IndexMap::new(),
            submodules: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn qualified(&self, name: &str) -> String {
        format!("{}.{}", self.name, name)
    }

    /// Add a named value and return a typed handle to it.
    pub fn add_parameter<P: NamedValue + 'static>(&mut self, parameter: P) -> Result<Arc<P>> {
        let parameter = Arc::new(parameter);
        self.add_shared_parameter(parameter.clone())?;
        Ok(parameter)
    }

    /// Add a named value already held elsewhere.
    ///
    /// A concrete value may replace an abstract one of the same name when
    /// the units match exactly.
    pub fn add_shared_parameter(&mut self, parameter: Arc<dyn NamedValue>) -> Result<()> {
        let name = parameter.name().to_string();
        if self.submodules.contains_key(&name) {
            return Err(InstrumentError::NameCollision(format!(
                "'{}' is already a submodule",
                self.qualified(&name)
            )));
        }
        if let Some(existing) = self.parameters.get(&name) {
            if !existing.is_abstract() && !parameter.is_abstract() {
                return Err(InstrumentError::NameCollision(format!(
                    "parameter '{}' is already declared",
                    self.qualified(&name)
                )));
            }
            if existing.unit() != parameter.unit() {
                return Err(InstrumentError::UnitMismatch {
                    name: self.qualified(&name),
                    expected: existing.unit(),
                    actual: parameter.unit(),
                });
            }
            if parameter.is_abstract() {
                // concrete implementation already present
                return Ok(());
            }
            debug!(parameter = %self.qualified(&name), "abstract parameter implemented");
        }
        self.parameters.insert(name, parameter);
        Ok(())
    }

    pub fn parameter(&self, name: &str) -> Option<&Arc<dyn NamedValue>> {
        self.parameters.get(name)
    }

    fn check_free(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains('.') {
            return Err(InstrumentError::Configuration(format!(
                "invalid submodule name '{}'",
                name
            )));
        }
        if self.parameters.contains_key(name) || self.submodules.contains_key(name) {
            return Err(InstrumentError::NameCollision(format!(
                "'{}' is already declared",
                self.qualified(name)
            )));
        }
        Ok(())
    }

    /// Add a submodule built together with this instrument.
    pub fn add_submodule(
        &mut self,
        name: impl Into<String>,
        mut submodule: InstrumentBuilder,
    ) -> Result<&mut InstrumentBuilder> {
        let name = name.into();
        self.check_free(&name)?;
        submodule.name = name.clone();
        self.submodules
            .insert(name.clone(), SubmoduleDecl::Owned(submodule));
        let missing = InstrumentError::UnresolvedReference(self.qualified(&name));
        self.submodule_mut(&name).ok_or(missing)
    }

    pub fn submodule_mut(&mut self, name: &str) -> Option<&mut InstrumentBuilder> {
        match self.submodules.get_mut(name) {
            Some(SubmoduleDecl::Owned(builder)) => Some(builder),
            _ => None,
        }
    }

    /// Expose an instrument owned elsewhere as a submodule.
    ///
    /// The attached instrument keeps its own parent and is not closed
    /// together with this one.
    pub fn attach_submodule(
        &mut self,
        name: impl Into<String>,
        instrument: Arc<Instrument>,
    ) -> Result<()> {
        let name = name.into();
        self.check_free(&name)?;
        self.submodules
            .insert(name, SubmoduleDecl::Attached(instrument));
        Ok(())
    }

    /// Run a driver's declarations against this builder.
    pub fn apply(&mut self, driver: &dyn InstrumentDriver) -> Result<&mut Self> {
        driver.declare(self)?;
        Ok(self)
    }

    /// Dotted names of abstract values still unresolved, submodules included.
    pub fn unresolved_abstract(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .parameters
            .values()
            .filter(|p| p.is_abstract())
            .map(|p| p.name().to_string())
            .collect();
        for (name, decl) in &self.submodules {
            if let SubmoduleDecl::Owned(child) = decl {
                names.extend(
                    child
                        .unresolved_abstract()
                        .into_iter()
                        .map(|n| format!("{}.{}", name, n)),
                );
            }
        }
        names
    }

    fn check_unbound(&self) -> Result<()> {
        for parameter in self.parameters.values() {
            if parameter.owner_slot().is_bound() {
                return Err(InstrumentError::NameCollision(format!(
                    "parameter '{}' already belongs to '{}'",
                    self.qualified(parameter.name()),
                    parameter.owner_slot().owner_name()
                )));
            }
        }
        for decl in self.submodules.values() {
            if let SubmoduleDecl::Owned(child) = decl {
                child.check_unbound()?;
            }
        }
        Ok(())
    }

    /// Build without registering.
    pub fn build_detached(self) -> Result<Arc<Instrument>> {
        if self.name.is_empty() || self.name.contains('.') {
            return Err(InstrumentError::Configuration(format!(
                "invalid instrument name '{}'",
                self.name
            )));
        }
        let unresolved = self.unresolved_abstract();
        if !unresolved.is_empty() {
            warn!(instrument = %self.name, ?unresolved, "unresolved abstract parameters");
            return Err(InstrumentError::UnresolvedAbstract {
                instrument: self.name,
                names: unresolved,
            });
        }
        self.check_unbound()?;
        self.assemble()
    }

    fn assemble(self) -> Result<Arc<Instrument>> {
        let mut submodules = IndexMap::with_capacity(self.submodules.len());
        let mut owned = Vec::new();
        for (name, decl) in self.submodules {
            let child = match decl {
                SubmoduleDecl::Owned(builder) => {
                    let child = builder.assemble()?;
                    owned.push(child.clone());
                    child
                }
                SubmoduleDecl::Attached(instrument) => instrument,
            };
            submodules.insert(name, child);
        }

        let instrument = Arc::new(Instrument {
            id: InstrumentId::new(),
            name: self.name,
            parent: OnceCell::new(),
            parameters: self.parameters,
            submodules,
            closed: AtomicBool::new(false),
            registry: OnceCell::new(),
        });
        for child in owned {
            let _ = child.parent.set(Arc::downgrade(&instrument));
        }
        for parameter in instrument.parameters.values() {
            parameter.bind_owner(Arc::downgrade(&instrument))?;
        }
        Ok(instrument)
    }

    /// Build and register under this builder's name.
    pub fn build(self, registry: &InstrumentRegistry) -> Result<Arc<Instrument>> {
        if registry.contains(&self.name) {
            return Err(InstrumentError::NameCollision(format!(
                "instrument '{}' is already registered",
                self.name
            )));
        }
        let instrument = self.build_detached()?;
        registry.register(instrument.clone())?;
        info!(
            instrument = %instrument.name(),
            parameters = instrument.parameters.len(),
            submodules = instrument.submodules.len(),
            "instrument created"
        );
        Ok(instrument)
    }
}
