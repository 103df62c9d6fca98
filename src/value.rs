//! Dynamic values flowing through parameters.
//!
//! Instruments report wildly different things: a DAC voltage is a float, a
//! lock-in time constant may be an enumerated string, a scope trace is a
//! shaped array and a multi-valued reading is a record of named items.
//! `ParameterValue` gives all of them one type so parameters can be stored
//! and called generically.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{InstrumentError, Result};

/// A dense, row-major array of floats with an explicit shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl ArrayValue {
    /// Create a shaped array, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(InstrumentError::ShapeMismatch {
                name: "array".to_string(),
                message: format!(
                    "shape {:?} holds {} elements but {} were given",
                    shape,
                    expected,
                    data.len()
                ),
            });
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional array from a vector.
    pub fn from_vec(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Value read from or written to a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    FloatArray(Vec<f64>),
    IntArray(Vec<i64>),
    Shaped(ArrayValue),
    Array(Vec<ParameterValue>),
    Record(IndexMap<String, ParameterValue>),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Null => write!(f, "null"),
            ParameterValue::Bool(b) => write!(f, "{}", b),
            ParameterValue::Int(i) => write!(f, "{}", i),
            ParameterValue::Float(fl) => write!(f, "{}", fl),
            ParameterValue::String(s) => write!(f, "{}", s),
            ParameterValue::FloatArray(arr) => write!(f, "{:?}", arr),
            ParameterValue::IntArray(arr) => write!(f, "{:?}", arr),
            ParameterValue::Shaped(arr) => write!(f, "array{:?}", arr.shape()),
            ParameterValue::Array(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            ParameterValue::Record(items) => {
                write!(f, "{{")?;
                for (i, (name, item)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, item)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl ParameterValue {
    /// Extract value as a string, parsing from scalar types
    pub fn as_string(&self) -> Option<String> {
        match self {
            ParameterValue::String(s) => Some(s.clone()),
            ParameterValue::Bool(b) => Some(b.to_string()),
            ParameterValue::Int(i) => Some(i.to_string()),
            ParameterValue::Float(f) => Some(f.to_string()),
            _ => None,
        }
    }

    /// Extract value as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(f) => Some(*f),
            ParameterValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Extract value as i64; floats must be integral
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(i) => Some(*i),
            ParameterValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    /// Extract value as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// True for scalar ints and floats.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ParameterValue::Int(_) | ParameterValue::Float(_))
    }

    /// Parse a command-line token: bool, int, float, else string.
    pub fn parse_scalar(text: &str) -> Self {
        if let Ok(b) = text.parse::<bool>() {
            ParameterValue::Bool(b)
        } else if let Ok(i) = text.parse::<i64>() {
            ParameterValue::Int(i)
        } else if let Ok(f) = text.parse::<f64>() {
            ParameterValue::Float(f)
        } else {
            ParameterValue::String(text.to_string())
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<i32> for ParameterValue {
    fn from(value: i32) -> Self {
        ParameterValue::Int(value as i64)
    }
}

impl From<u32> for ParameterValue {
    fn from(value: u32) -> Self {
        ParameterValue::Int(value as i64)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::String(value)
    }
}

impl From<Vec<f64>> for ParameterValue {
    fn from(value: Vec<f64>) -> Self {
        ParameterValue::FloatArray(value)
    }
}

impl From<Vec<i64>> for ParameterValue {
    fn from(value: Vec<i64>) -> Self {
        ParameterValue::IntArray(value)
    }
}

impl From<ArrayValue> for ParameterValue {
    fn from(value: ArrayValue) -> Self {
        ParameterValue::Shaped(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_value_shape_check() {
        assert!(ArrayValue::new(vec![2, 3], vec![0.0; 6]).is_ok());
        let err = ArrayValue::new(vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, InstrumentError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_numeric_accessors() {
        assert_eq!(ParameterValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(ParameterValue::Float(4.0).as_i64(), Some(4));
        assert_eq!(ParameterValue::Float(4.5).as_i64(), None);
        assert!(!ParameterValue::String("1".into()).is_numeric());
    }

    #[test]
    fn test_parse_scalar() {
        assert_eq!(ParameterValue::parse_scalar("true"), ParameterValue::Bool(true));
        assert_eq!(ParameterValue::parse_scalar("-2"), ParameterValue::Int(-2));
        assert_eq!(ParameterValue::parse_scalar("0.5"), ParameterValue::Float(0.5));
        assert_eq!(
            ParameterValue::parse_scalar("AC"),
            ParameterValue::String("AC".into())
        );
    }

    #[test]
    fn test_untagged_yaml_scalars() {
        let v: ParameterValue = serde_yaml::from_str("0.25").unwrap();
        assert_eq!(v, ParameterValue::Float(0.25));
        let v: ParameterValue = serde_yaml::from_str("7").unwrap();
        assert_eq!(v, ParameterValue::Int(7));
        let v: ParameterValue = serde_yaml::from_str("[1.0, 2.5]").unwrap();
        assert_eq!(v, ParameterValue::FloatArray(vec![1.0, 2.5]));
    }

    #[test]
    fn test_display_tuple() {
        let v = ParameterValue::Array(vec![1.0.into(), "x".into()]);
        assert_eq!(v.to_string(), "(1, x)");
    }
}
