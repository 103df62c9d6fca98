//! Name → instrument registry.
//!
//! The registry is an explicit value passed to whatever needs to look up
//! instruments by name; cloning it shares the same underlying map. Only
//! top-level instruments are registered, submodules are reached through
//! dotted paths.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Instrument, InstrumentId};
use crate::error::{InstrumentError, Result};
use crate::parameter::NamedValue;

#[derive(Debug, Default)]
pub(crate) struct RegistryInner {
    instruments: Mutex<IndexMap<String, Arc<Instrument>>>,
}

impl RegistryInner {
    /// Remove `name` only if it still refers to the instrument `id`.
    pub(crate) fn remove(&self, name: &str, id: InstrumentId) {
        let mut instruments = self.instruments.lock();
        if instruments.get(name).is_some_and(|i| i.id() == id) {
            instruments.shift_remove(name);
            debug!(instrument = name, "unregistered");
        }
    }
}

/// Shared registry of live top-level instruments.
#[derive(Debug, Clone, Default)]
pub struct InstrumentRegistry {
    inner: Arc<RegistryInner>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a top-level instrument. Fails if the name is taken.
    pub fn register(&self, instrument: Arc<Instrument>) -> Result<()> {
        if instrument.parent().is_some() {
            return Err(InstrumentError::Configuration(format!(
                "'{}' is a submodule; only top-level instruments are registered",
                instrument.full_name()
            )));
        }
        let mut instruments = self.inner.instruments.lock();
        if instruments.contains_key(instrument.name()) {
            return Err(InstrumentError::NameCollision(format!(
                "instrument '{}' is already registered",
                instrument.name()
            )));
        }
        instrument.attach_registry(Arc::downgrade(&self.inner));
        debug!(instrument = instrument.name(), id = %instrument.id(), "registered");
        instruments.insert(instrument.name().to_string(), instrument);
        Ok(())
    }

    /// Top-level instrument registered under `name`.
    pub fn find(&self, name: &str) -> Option<Arc<Instrument>> {
        self.inner.instruments.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.instruments.lock().contains_key(name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.inner.instruments.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.instruments.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.instruments.lock().is_empty()
    }

    /// Resolve `dac` or `dac.ch01` to an instrument.
    pub fn resolve_instrument(&self, path: &str) -> Result<Arc<Instrument>> {
        let (root, rest) = match path.split_once('.') {
            Some((root, rest)) => (root, Some(rest)),
            None => (path, None),
        };
        let instrument = self
            .find(root)
            .ok_or_else(|| InstrumentError::UnresolvedReference(path.to_string()))?;
        match rest {
            None => Ok(instrument),
            Some(rest) => instrument.resolve_submodule(rest),
        }
    }

    /// Resolve `dac.ch01.voltage` to a named value.
    pub fn resolve_parameter(&self, path: &str) -> Result<Arc<dyn NamedValue>> {
        let (root, rest) = path
            .split_once('.')
            .ok_or_else(|| InstrumentError::UnresolvedReference(path.to_string()))?;
        self.find(root)
            .ok_or_else(|| InstrumentError::UnresolvedReference(path.to_string()))?
            .resolve_parameter(rest)
    }

    /// Close every registered instrument, most recently registered first.
    pub fn close_all(&self) {
        let instruments: Vec<Arc<Instrument>> =
            self.inner.instruments.lock().values().cloned().collect();
        for instrument in instruments.into_iter().rev() {
            instrument.close();
        }
        info!("all instruments closed");
    }
}
