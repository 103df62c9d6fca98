//! Step/delay policy for parameter writes.
//!
//! A ramp breaks one `set` into a monotonic sequence of smaller sets so that
//! sensitive hardware (gate voltages, magnet currents) never jumps. The last
//! element of every plan is exactly the requested target.

use std::time::Duration;
use tracing::trace;

use crate::error::{InstrumentError, Result};
use crate::value::ParameterValue;

/// Attribute names accepted by `NamedValue::set_attribute`.
pub const RAMP_ATTRIBUTES: [&str; 3] = ["step", "inter_delay", "post_delay"];

/// Tolerance when deciding whether a distance is an exact multiple of the step.
const STEP_EPSILON: f64 = 1e-9;

/// Longest ramp a single `set` may expand into.
pub const MAX_RAMP_STEPS: usize = 100_000;

/// How a numeric `set` is broken into steps, and how long to wait around them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RampPolicy {
    step: Option<f64>,
    inter_delay: Duration,
    post_delay: Duration,
}

impl RampPolicy {
    /// Policy without a step or delays: every set is a single write.
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest change allowed per write.
    pub fn with_step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    /// Pause between consecutive ramp writes.
    pub fn with_inter_delay(mut self, delay: Duration) -> Self {
        self.inter_delay = delay;
        self
    }

    /// Pause after the final write.
    pub fn with_post_delay(mut self, delay: Duration) -> Self {
        self.post_delay = delay;
        self
    }

    /// Largest change per write, if ramping is enabled.
    pub fn step(&self) -> Option<f64> {
        self.step
    }

    pub fn inter_delay(&self) -> Duration {
        self.inter_delay
    }

    pub fn post_delay(&self) -> Duration {
        self.post_delay
    }

    /// Check the step against the parameter's domain.
    pub fn check(&self, parameter: &str, integer_only: bool) -> Result<()> {
        if let Some(step) = self.step {
            if !step.is_finite() || step <= 0.0 {
                return Err(invalid(parameter, "step", format!("must be positive, got {}", step)));
            }
            if integer_only && step.fract() != 0.0 {
                return Err(invalid(
                    parameter,
                    "step",
                    format!("must be an integer for an integer parameter, got {}", step),
                ));
            }
        }
        Ok(())
    }

    /// Update one attribute from a dynamic value. `Null` clears the step.
    pub fn set_attribute(
        &mut self,
        parameter: &str,
        attribute: &str,
        value: &ParameterValue,
        integer_only: bool,
    ) -> Result<()> {
        match attribute {
            "step" => {
                let mut updated = self.clone();
                updated.step = match value {
                    ParameterValue::Null => None,
                    other => Some(other.as_f64().ok_or_else(|| {
                        invalid(parameter, attribute, format!("expected a number, got {}", other))
                    })?),
                };
                updated.check(parameter, integer_only)?;
                *self = updated;
            }
            "inter_delay" => self.inter_delay = seconds(parameter, attribute, value)?,
            "post_delay" => self.post_delay = seconds(parameter, attribute, value)?,
            other => {
                return Err(invalid(
                    parameter,
                    other,
                    format!("unknown attribute; expected one of {}", RAMP_ATTRIBUTES.join(", ")),
                ))
            }
        }
        Ok(())
    }

    /// Values to write, in order, to move from `start` to `target`.
    ///
    /// Without a step, a numeric start, or a numeric target the plan is the
    /// target alone. Otherwise each element differs from the previous one by
    /// at most `step` and the final element is `target` itself.
    ///
    /// Fails with `Validation` when either end is not finite or the ramp
    /// would need more than [`MAX_RAMP_STEPS`] writes.
    pub fn plan(
        &self,
        parameter: &str,
        start: Option<&ParameterValue>,
        target: &ParameterValue,
    ) -> Result<Vec<ParameterValue>> {
        let (step, start) = match (self.step, start) {
            (Some(step), Some(start)) if start.is_numeric() && target.is_numeric() => (step, start),
            _ => return Ok(vec![target.clone()]),
        };
        let (Some(from), Some(to)) = (start.as_f64(), target.as_f64()) else {
            return Ok(vec![target.clone()]);
        };
        if !from.is_finite() || !to.is_finite() {
            return Err(InstrumentError::validation(
                parameter,
                format!("cannot ramp from {} to {}", from, to),
            ));
        }

        let distance = (to - from).abs();
        if distance == 0.0 {
            return Ok(vec![target.clone()]);
        }
        let ratio = distance / step;
        let steps = if (ratio - ratio.round()).abs() < STEP_EPSILON {
            ratio.round()
        } else {
            ratio.ceil()
        };
        if steps > MAX_RAMP_STEPS as f64 {
            return Err(InstrumentError::validation(
                parameter,
                format!(
                    "ramp from {} to {} with step {} needs {} writes (limit {})",
                    from, to, step, steps, MAX_RAMP_STEPS
                ),
            ));
        }
        let count = steps as usize;
        let direction = if to > from { 1.0 } else { -1.0 };
        let integral = matches!(start, ParameterValue::Int(_))
            && matches!(target, ParameterValue::Int(_))
            && step.fract() == 0.0;

        let mut values: Vec<ParameterValue> = (1..count)
            .map(|k| {
                let v = from + direction * step * k as f64;
                if integral {
                    ParameterValue::Int(v as i64)
                } else {
                    ParameterValue::Float(v)
                }
            })
            .collect();
        values.push(target.clone());
        Ok(values)
    }

    /// Apply each planned value, sleeping `inter_delay` between them and
    /// `post_delay` after the last one.
    pub fn execute<F>(&self, plan: &[ParameterValue], mut apply: F) -> Result<()>
    where
        F: FnMut(&ParameterValue) -> Result<()>,
    {
        for (i, value) in plan.iter().enumerate() {
            trace!(step = i, total = plan.len(), %value, "ramp step");
            apply(value)?;
            if i + 1 < plan.len() && !self.inter_delay.is_zero() {
                std::thread::sleep(self.inter_delay);
            }
        }
        if !self.post_delay.is_zero() {
            std::thread::sleep(self.post_delay);
        }
        Ok(())
    }
}

fn invalid(parameter: &str, attribute: &str, message: String) -> InstrumentError {
    InstrumentError::InvalidAttribute {
        parameter: parameter.to_string(),
        attribute: attribute.to_string(),
        message,
    }
}

fn seconds(parameter: &str, attribute: &str, value: &ParameterValue) -> Result<Duration> {
    let secs = value
        .as_f64()
        .ok_or_else(|| invalid(parameter, attribute, format!("expected seconds, got {}", value)))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| invalid(parameter, attribute, format!("{} is not a valid delay: {}", secs, e)))
}
