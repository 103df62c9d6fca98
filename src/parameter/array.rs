//! Read-only structured parameters: shaped arrays and multi-item records.
//!
//! Both kinds describe their result up front: the shape of every item and,
//! optionally, one setpoint array per dimension giving the coordinates each
//! element was measured at (e.g. the frequency axis of a spectrum). Shape and
//! setpoint consistency is checked once, when the parameter is constructed.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use super::{CachedValue, NamedValue, OwnerSlot, ParameterMetadata};
use crate::error::{InstrumentError, Result};
use crate::value::{ArrayValue, ParameterValue};

/// Coordinates along one dimension of a shaped result.
#[derive(Debug, Clone, Serialize)]
pub struct Setpoints {
    pub name: String,
    pub label: String,
    pub unit: String,
    pub values: ArrayValue,
}

impl Setpoints {
    pub fn new(name: impl Into<String>, values: ArrayValue) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            unit: String::new(),
            values,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Setpoint `k` of an n-dimensional value must have shape `shape[..=k]`.
fn check_setpoints(name: &str, shape: &[usize], setpoints: &[Setpoints]) -> Result<()> {
    if setpoints.len() != shape.len() {
        return Err(InstrumentError::ShapeMismatch {
            name: name.to_string(),
            message: format!(
                "{} setpoint arrays given for a {}-dimensional value",
                setpoints.len(),
                shape.len()
            ),
        });
    }
    for (k, setpoint) in setpoints.iter().enumerate() {
        let expected = &shape[..=k];
        if setpoint.values.shape() != expected {
            return Err(InstrumentError::ShapeMismatch {
                name: name.to_string(),
                message: format!(
                    "setpoints '{}' have shape {:?}, expected {:?}",
                    setpoint.name,
                    setpoint.values.shape(),
                    expected
                ),
            });
        }
    }
    Ok(())
}

fn read_only(full_name: String) -> InstrumentError {
    InstrumentError::NotSettable(full_name)
}

/// Raw read function for an array parameter: the flattened, row-major data.
pub type ArrayGetter = Arc<dyn Fn() -> Result<Vec<f64>> + Send + Sync>;

/// A gettable, shaped array (e.g. a trace or spectrum).
pub struct ArrayParameter {
    metadata: ParameterMetadata,
    shape: Vec<usize>,
    setpoints: Option<Vec<Setpoints>>,
    getter: ArrayGetter,
    cache: Mutex<Option<CachedValue>>,
    owner: OwnerSlot,
}

impl fmt::Debug for ArrayParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayParameter")
            .field("metadata", &self.metadata)
            .field("shape", &self.shape)
            .field("setpoints", &self.setpoints)
            .finish()
    }
}

impl ArrayParameter {
    /// Create an array parameter. The shape needs at least one dimension.
    pub fn new(
        name: impl Into<String>,
        shape: Vec<usize>,
        getter: impl Fn() -> Result<Vec<f64>> + Send + Sync + 'static,
    ) -> Result<Self> {
        let name = name.into();
        if shape.is_empty() {
            return Err(InstrumentError::ShapeMismatch {
                name,
                message: "array parameters need at least one dimension".to_string(),
            });
        }
        Ok(Self {
            metadata: ParameterMetadata::new(name),
            shape,
            setpoints: None,
            getter: Arc::new(getter),
            cache: Mutex::new(None),
            owner: OwnerSlot::new(),
        })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.metadata.label = label.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.metadata.unit = unit.into();
        self
    }

    /// Attach one setpoint array per dimension.
    pub fn with_setpoints(mut self, setpoints: Vec<Setpoints>) -> Result<Self> {
        check_setpoints(&self.metadata.name, &self.shape, &setpoints)?;
        self.setpoints = Some(setpoints);
        Ok(self)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn setpoints(&self) -> Option<&[Setpoints]> {
        self.setpoints.as_deref()
    }
}

impl NamedValue for ArrayParameter {
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn label(&self) -> String {
        self.metadata.label.clone()
    }

    fn unit(&self) -> String {
        self.metadata.unit.clone()
    }

    fn gettable(&self) -> bool {
        true
    }

    fn settable(&self) -> bool {
        false
    }

    fn get(&self) -> Result<ParameterValue> {
        self.owner.ensure_open()?;
        let data = (self.getter)()?;
        let array = ArrayValue::new(self.shape.clone(), data).map_err(|e| match e {
            InstrumentError::ShapeMismatch { message, .. } => InstrumentError::ShapeMismatch {
                name: self.full_name(),
                message,
            },
            other => other,
        })?;
        let value = ParameterValue::Shaped(array);
        *self.cache.lock() = Some(CachedValue::now(value.clone()));
        Ok(value)
    }

    fn set(&self, _value: ParameterValue) -> Result<()> {
        Err(read_only(self.full_name()))
    }

    fn cached(&self) -> Option<CachedValue> {
        self.cache.lock().clone()
    }

    fn owner_slot(&self) -> &OwnerSlot {
        &self.owner
    }
}

/// One item of a [`MultiParameter`]. An empty shape means a scalar.
#[derive(Debug, Clone, Serialize)]
pub struct MultiItem {
    pub name: String,
    pub label: String,
    pub unit: String,
    pub shape: Vec<usize>,
    pub setpoints: Option<Vec<Setpoints>>,
}

impl MultiItem {
    pub fn scalar(name: impl Into<String>, unit: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            unit: unit.into(),
            shape: Vec::new(),
            setpoints: None,
        }
    }

    pub fn array(name: impl Into<String>, unit: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            shape,
            ..Self::scalar(name, unit)
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_setpoints(mut self, setpoints: Vec<Setpoints>) -> Self {
        self.setpoints = Some(setpoints);
        self
    }
}

/// Raw read function for a multi parameter: one value per item, in order.
pub type MultiGetter = Arc<dyn Fn() -> Result<Vec<ParameterValue>> + Send + Sync>;

/// A gettable record of several co-returned named values.
pub struct MultiParameter {
    metadata: ParameterMetadata,
    items: Vec<MultiItem>,
    getter: MultiGetter,
    cache: Mutex<Option<CachedValue>>,
    owner: OwnerSlot,
}

impl fmt::Debug for MultiParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiParameter")
            .field("metadata", &self.metadata)
            .field("items", &self.items)
            .finish()
    }
}

impl MultiParameter {
    pub fn new(
        name: impl Into<String>,
        items: Vec<MultiItem>,
        getter: impl Fn() -> Result<Vec<ParameterValue>> + Send + Sync + 'static,
    ) -> Result<Self> {
        let name = name.into();
        if items.is_empty() {
            return Err(InstrumentError::ShapeMismatch {
                name,
                message: "multi parameters need at least one item".to_string(),
            });
        }
        for (i, item) in items.iter().enumerate() {
            if items[..i].iter().any(|other| other.name == item.name) {
                return Err(InstrumentError::NameCollision(format!(
                    "item '{}' appears twice in multi parameter '{}'",
                    item.name, name
                )));
            }
            if let Some(setpoints) = &item.setpoints {
                check_setpoints(&format!("{}.{}", name, item.name), &item.shape, setpoints)?;
            }
        }
        Ok(Self {
            metadata: ParameterMetadata::new(name),
            items,
            getter: Arc::new(getter),
            cache: Mutex::new(None),
            owner: OwnerSlot::new(),
        })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.metadata.label = label.into();
        self
    }

    pub fn items(&self) -> &[MultiItem] {
        &self.items
    }

    pub fn names(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.name.as_str()).collect()
    }

    pub fn units(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.unit.as_str()).collect()
    }

    pub fn shapes(&self) -> Vec<&[usize]> {
        self.items.iter().map(|item| item.shape.as_slice()).collect()
    }
}

impl NamedValue for MultiParameter {
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn label(&self) -> String {
        self.metadata.label.clone()
    }

    /// Item units joined with ", ".
    fn unit(&self) -> String {
        self.units().join(", ")
    }

    fn gettable(&self) -> bool {
        true
    }

    fn settable(&self) -> bool {
        false
    }

    fn get(&self) -> Result<ParameterValue> {
        self.owner.ensure_open()?;
        let values = (self.getter)()?;
        if values.len() != self.items.len() {
            return Err(InstrumentError::ShapeMismatch {
                name: self.full_name(),
                message: format!(
                    "getter returned {} values for {} items",
                    values.len(),
                    self.items.len()
                ),
            });
        }
        let record = self
            .items
            .iter()
            .map(|item| item.name.clone())
            .zip(values)
            .collect();
        let value = ParameterValue::Record(record);
        *self.cache.lock() = Some(CachedValue::now(value.clone()));
        Ok(value)
    }

    fn set(&self, _value: ParameterValue) -> Result<()> {
        Err(read_only(self.full_name()))
    }

    fn cached(&self) -> Option<CachedValue> {
        self.cache.lock().clone()
    }

    fn owner_slot(&self) -> &OwnerSlot {
        &self.owner
    }
}
