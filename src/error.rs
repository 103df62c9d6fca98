//! Custom error types for the instrument-control core.
//!
//! This module defines the primary error type, `InstrumentError`, shared by
//! parameters, instruments, groups and the batched caller. Using the
//! `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that can occur.
//!
//! ## Error Hierarchy
//!
//! Errors fall into two families:
//!
//! - **Construction-time** errors abort building an instrument or group and
//!   leave nothing registered: `UnresolvedAbstract`, `UnitMismatch`,
//!   `NameCollision`, `UnresolvedReference`, `ShapeMismatch`.
//! - **Per-call** errors are returned to the immediate caller of `get`/`set`
//!   and never affect other in-flight operations: `Validation`,
//!   `NotSettable`, `NotGettable`, `AbstractParameter`, `InstrumentClosed`,
//!   `Hardware`.
//!
//! `BatchFailed` aggregates per-call errors from a batched acquisition, the
//! same way the application reports several shutdown failures at once.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, InstrumentError>;

#[derive(Error, Debug)]
pub enum InstrumentError {
    #[error("Validation error on '{parameter}': {message}")]
    Validation { parameter: String, message: String },

    #[error("Parameter '{0}' is not settable")]
    NotSettable(String),

    #[error("Parameter '{0}' is not gettable")]
    NotGettable(String),

    #[error("Abstract parameter '{name}' of instrument '{owner}' is not implemented")]
    AbstractParameter { owner: String, name: String },

    #[error("Instrument '{instrument}' has unimplemented abstract parameters: {}", .names.join(", "))]
    UnresolvedAbstract {
        instrument: String,
        names: Vec<String>,
    },

    #[error("Unit mismatch for '{name}': expected '{expected}', got '{actual}'")]
    UnitMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Name collision: {0}")]
    NameCollision(String),

    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),

    #[error("Instrument '{0}' is closed")]
    InstrumentClosed(String),

    #[error("Shape mismatch for '{name}': {message}")]
    ShapeMismatch { name: String, message: String },

    #[error("Invalid attribute '{attribute}' for '{parameter}': {message}")]
    InvalidAttribute {
        parameter: String,
        attribute: String,
        message: String,
    },

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Batch operation {index} failed: {source} ({} more suppressed)", .suppressed.len())]
    BatchFailed {
        index: usize,
        #[source]
        source: Box<InstrumentError>,
        suppressed: Vec<(usize, InstrumentError)>,
    },

    #[error("Configuration load error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl InstrumentError {
    /// Build a validation error for the given parameter.
    pub fn validation(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        InstrumentError::Validation {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Returns true for errors raised while building instruments or groups.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            InstrumentError::UnresolvedAbstract { .. }
                | InstrumentError::UnitMismatch { .. }
                | InstrumentError::NameCollision(_)
                | InstrumentError::UnresolvedReference(_)
                | InstrumentError::ShapeMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InstrumentError::Hardware("dac timeout".to_string());
        assert_eq!(err.to_string(), "Hardware error: dac timeout");
    }

    #[test]
    fn test_unresolved_abstract_lists_all_names() {
        let err = InstrumentError::UnresolvedAbstract {
            instrument: "dac".into(),
            names: vec!["voltage".into(), "current".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("voltage, current"));
        assert!(err.is_construction_error());
    }

    #[test]
    fn test_batch_failed_error() {
        let err = InstrumentError::BatchFailed {
            index: 1,
            source: Box::new(InstrumentError::NotSettable("x".into())),
            suppressed: vec![(3, InstrumentError::Hardware("lockin".into()))],
        };
        assert!(err.to_string().contains("1 more suppressed"));
        assert!(!err.is_construction_error());
    }
}
