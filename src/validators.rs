//! Value validators.
//!
//! Validators are stateless rules over a value domain. A parameter checks
//! every user-supplied value against its validator before anything reaches
//! hardware; values outside the domain are rejected, never clamped.
//!
//! # Example
//!
//! ```rust
//! use rust_labctl::validators::{Numbers, Validator};
//!
//! let range = Numbers::new(-10.0, 10.0);
//! assert!(range.validate(&2.5.into(), "dac_ch01_voltage").is_ok());
//! assert!(range.validate(&12.0.into(), "dac_ch01_voltage").is_err());
//! ```

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{InstrumentError, Result};
use crate::value::ParameterValue;

/// A rule over a value domain.
pub trait Validator: Send + Sync + Debug {
    /// Fail with [`InstrumentError::Validation`] when `value` is outside the
    /// domain. `context` names the parameter for the error message.
    fn validate(&self, value: &ParameterValue, context: &str) -> Result<()>;

    /// Human-readable description of the domain.
    fn describe(&self) -> String;

    /// True if the domain only contains integers.
    fn is_integer(&self) -> bool {
        false
    }
}

fn reject(context: &str, value: &ParameterValue, domain: String) -> InstrumentError {
    InstrumentError::validation(context, format!("{} is invalid; must be {}", value, domain))
}

/// Accepts any value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anything;

impl Validator for Anything {
    fn validate(&self, _value: &ParameterValue, _context: &str) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "any value".to_string()
    }
}

/// Integers in `[min, max]` (inclusive). Integral floats are accepted.
#[derive(Debug, Clone, Copy)]
pub struct Ints {
    min: i64,
    max: i64,
}

impl Ints {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn non_negative() -> Self {
        Self::new(0, i64::MAX)
    }
}

impl Default for Ints {
    fn default() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }
}

impl Validator for Ints {
    fn validate(&self, value: &ParameterValue, context: &str) -> Result<()> {
        match value.as_i64() {
            Some(v) if v >= self.min && v <= self.max => Ok(()),
            _ => Err(reject(context, value, self.describe())),
        }
    }

    fn describe(&self) -> String {
        format!("an integer in [{}, {}]", self.min, self.max)
    }

    fn is_integer(&self) -> bool {
        true
    }
}

/// Numbers in `[min, max]` (inclusive). NaN is always rejected.
#[derive(Debug, Clone, Copy)]
pub struct Numbers {
    min: f64,
    max: f64,
}

impl Numbers {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

impl Default for Numbers {
    fn default() -> Self {
        Self::new(f64::NEG_INFINITY, f64::INFINITY)
    }
}

impl Validator for Numbers {
    fn validate(&self, value: &ParameterValue, context: &str) -> Result<()> {
        match value.as_f64() {
            Some(v) if !v.is_nan() && v >= self.min && v <= self.max => Ok(()),
            _ => Err(reject(context, value, self.describe())),
        }
    }

    fn describe(&self) -> String {
        format!("a number in [{}, {}]", self.min, self.max)
    }
}

/// Membership in a fixed set of values.
#[derive(Debug, Clone)]
pub struct Enum {
    choices: Vec<ParameterValue>,
}

impl Enum {
    pub fn new<I, V>(choices: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ParameterValue>,
    {
        Self {
            choices: choices.into_iter().map(Into::into).collect(),
        }
    }
}

impl Validator for Enum {
    fn validate(&self, value: &ParameterValue, context: &str) -> Result<()> {
        if self.choices.iter().any(|c| c == value) {
            Ok(())
        } else {
            Err(reject(context, value, self.describe()))
        }
    }

    fn describe(&self) -> String {
        let choices: Vec<String> = self.choices.iter().map(|c| c.to_string()).collect();
        format!("one of {{{}}}", choices.join(", "))
    }
}

/// Strings with a bounded length.
#[derive(Debug, Clone, Copy)]
pub struct Strings {
    min_length: usize,
    max_length: usize,
}

impl Strings {
    pub fn new(min_length: usize, max_length: usize) -> Self {
        Self {
            min_length,
            max_length,
        }
    }
}

impl Default for Strings {
    fn default() -> Self {
        Self::new(0, usize::MAX)
    }
}

impl Validator for Strings {
    fn validate(&self, value: &ParameterValue, context: &str) -> Result<()> {
        match value {
            ParameterValue::String(s)
                if s.chars().count() >= self.min_length && s.chars().count() <= self.max_length =>
            {
                Ok(())
            }
            _ => Err(reject(context, value, self.describe())),
        }
    }

    fn describe(&self) -> String {
        format!(
            "a string of length {}..={}",
            self.min_length, self.max_length
        )
    }
}

/// Arrays of a given shape; `None` accepts any shape.
#[derive(Debug, Clone, Default)]
pub struct Arrays {
    shape: Option<Vec<usize>>,
}

impl Arrays {
    pub fn with_shape(shape: Vec<usize>) -> Self {
        Self { shape: Some(shape) }
    }
}

impl Validator for Arrays {
    fn validate(&self, value: &ParameterValue, context: &str) -> Result<()> {
        let actual = match value {
            ParameterValue::Shaped(arr) => arr.shape().to_vec(),
            ParameterValue::FloatArray(v) => vec![v.len()],
            ParameterValue::IntArray(v) => vec![v.len()],
            _ => return Err(reject(context, value, self.describe())),
        };
        match &self.shape {
            Some(shape) if *shape != actual => Err(reject(context, value, self.describe())),
            _ => Ok(()),
        }
    }

    fn describe(&self) -> String {
        match &self.shape {
            Some(shape) => format!("an array of shape {:?}", shape),
            None => "an array".to_string(),
        }
    }
}

/// Logical AND of several validators.
#[derive(Debug, Clone)]
pub struct AllOf {
    validators: Vec<Arc<dyn Validator>>,
}

impl AllOf {
    pub fn new(validators: Vec<Arc<dyn Validator>>) -> Self {
        Self { validators }
    }
}

impl Validator for AllOf {
    fn validate(&self, value: &ParameterValue, context: &str) -> Result<()> {
        for validator in &self.validators {
            validator.validate(value, context)?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.validators.iter().map(|v| v.describe()).collect();
        parts.join(" and ")
    }

    fn is_integer(&self) -> bool {
        self.validators.iter().any(|v| v.is_integer())
    }
}

/// Combine an optional existing validator with an additional one.
pub fn intersect(
    existing: Option<Arc<dyn Validator>>,
    extra: Arc<dyn Validator>,
) -> Arc<dyn Validator> {
    match existing {
        Some(existing) => Arc::new(AllOf::new(vec![existing, extra])),
        None => extra,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ArrayValue;

    #[test]
    fn test_ints_bounds() {
        let v = Ints::non_negative();
        assert!(v.validate(&0.into(), "n").is_ok());
        assert!(v.validate(&5.0.into(), "n").is_ok());
        assert!(v.validate(&(-1).into(), "n").is_err());
        assert!(v.validate(&2.5.into(), "n").is_err());
        assert!(v.is_integer());
    }

    #[test]
    fn test_numbers_message_names_domain_and_value() {
        let err = Numbers::new(0.0, 1.0)
            .validate(&1.5.into(), "gain")
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("gain"));
        assert!(msg.contains("1.5"));
        assert!(msg.contains("[0, 1]"));
    }

    #[test]
    fn test_numbers_rejects_nan_and_strings() {
        let v = Numbers::default();
        assert!(v.validate(&f64::NAN.into(), "x").is_err());
        assert!(v.validate(&"1.0".into(), "x").is_err());
    }

    #[test]
    fn test_enum_membership() {
        let v = Enum::new(["AC", "DC"]);
        assert!(v.validate(&"AC".into(), "coupling").is_ok());
        assert!(v.validate(&"GND".into(), "coupling").is_err());
    }

    #[test]
    fn test_strings_length() {
        let v = Strings::new(1, 3);
        assert!(v.validate(&"abc".into(), "s").is_ok());
        assert!(v.validate(&"".into(), "s").is_err());
        assert!(v.validate(&"abcd".into(), "s").is_err());
    }

    #[test]
    fn test_arrays_shape() {
        let v = Arrays::with_shape(vec![2, 2]);
        let ok = ArrayValue::new(vec![2, 2], vec![0.0; 4]).unwrap();
        let bad = ArrayValue::new(vec![4], vec![0.0; 4]).unwrap();
        assert!(v.validate(&ok.into(), "a").is_ok());
        assert!(v.validate(&bad.into(), "a").is_err());
    }

    #[test]
    fn test_all_of_is_intersection() {
        let v = AllOf::new(vec![
            Arc::new(Numbers::new(-10.0, 10.0)),
            Arc::new(Numbers::new(0.0, 20.0)),
        ]);
        assert!(v.validate(&5.0.into(), "x").is_ok());
        assert!(v.validate(&(-5.0).into(), "x").is_err());
        assert!(v.validate(&15.0.into(), "x").is_err());
    }
}
