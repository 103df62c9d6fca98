//! Simulated instruments.
//!
//! Used by tests, by the `labctl` binary and by station files that name the
//! `mock_dac` / `mock_lockin` drivers. Their "hardware" is shared in-memory
//! state behind a `parking_lot::Mutex`.
//!
//! `DacDriver` is an abstract base: it declares a `voltage` (V) per channel
//! without implementing it. `MockDac` applies the base first and then
//! supplies the concrete parameters.

use parking_lot::Mutex;
use serde::Deserialize;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{InstrumentError, Result};
use crate::instrument::{InstrumentBuilder, InstrumentDriver};
use crate::parameter::{ArrayParameter, MultiItem, MultiParameter, ParameterBuilder, Setpoints};
use crate::validators::Numbers;
use crate::value::{ArrayValue, ParameterValue};

fn channel_name(index: usize) -> String {
    format!("ch{:02}", index)
}

/// Abstract DAC: `chNN.voltage` in volts, implemented by concrete drivers.
#[derive(Debug, Clone)]
pub struct DacDriver {
    pub channels: usize,
}

impl InstrumentDriver for DacDriver {
    fn declare(&self, builder: &mut InstrumentBuilder) -> Result<()> {
        for index in 1..=self.channels {
            let mut channel = InstrumentBuilder::new(channel_name(index));
            channel.add_parameter(
                ParameterBuilder::new("voltage")
                    .unit("V")
                    .label(format!("Channel {} voltage", index))
                    .abstract_()
                    .build()?,
            )?;
            builder.add_submodule(channel_name(index), channel)?;
        }
        Ok(())
    }
}

fn default_channels() -> usize {
    4
}

fn default_range() -> (f64, f64) {
    (-10.0, 10.0)
}

/// Options accepted by the `mock_dac` driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockDacOptions {
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default = "default_range")]
    pub range: (f64, f64),
    /// Ramp step in volts
    #[serde(default)]
    pub step: Option<f64>,
    /// Seconds between ramp steps
    #[serde(default)]
    pub inter_delay: f64,
}

impl Default for MockDacOptions {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            range: default_range(),
            step: None,
            inter_delay: 0.0,
        }
    }
}

/// In-memory multi-channel DAC.
#[derive(Debug, Clone)]
pub struct MockDac {
    options: MockDacOptions,
    outputs: Arc<Mutex<Vec<f64>>>,
}

impl Default for MockDac {
    fn default() -> Self {
        Self::new(MockDacOptions::default())
    }
}

impl MockDac {
    /// DAC with `options.channels` channels named `ch01`, `ch02`, ...
    pub fn new(options: MockDacOptions) -> Self {
        let outputs = Arc::new(Mutex::new(vec![0.0; options.channels]));
        Self { options, outputs }
    }

    /// Raw output levels, one per channel.
    pub fn outputs(&self) -> Vec<f64> {
        self.outputs.lock().clone()
    }
}

impl InstrumentDriver for MockDac {
    fn declare(&self, builder: &mut InstrumentBuilder) -> Result<()> {
        DacDriver {
            channels: self.options.channels,
        }
        .declare(builder)?;

        let (min, max) = self.options.range;
        let inter_delay = Duration::try_from_secs_f64(self.options.inter_delay).map_err(|e| {
            InstrumentError::Configuration(format!("invalid inter_delay: {}", e))
        })?;
        for index in 1..=self.options.channels {
            let (read, write) = (self.outputs.clone(), self.outputs.clone());
            let slot = index - 1;
            let mut voltage = ParameterBuilder::new("voltage")
                .unit("V")
                .label(format!("Channel {} voltage", index))
                .validator(Numbers::new(min, max))
                .getter(move || Ok(read.lock().get(slot).copied().unwrap_or_default().into()))
                .setter(move |value| {
                    if let (Some(out), Some(v)) = (write.lock().get_mut(slot), value.as_f64()) {
                        *out = v;
                    }
                    Ok(())
                })
                .inter_delay(inter_delay);
            if let Some(step) = self.options.step {
                voltage = voltage.step(step);
            }
            if let Some(channel) = builder.submodule_mut(&channel_name(index)) {
                channel.add_parameter(voltage.build()?)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct LockinState {
    frequency: f64,
    amplitude: f64,
    phase: f64,
    /// Raw time constant code
    time_constant: i64,
}

fn default_trace_points() -> usize {
    64
}

/// Options accepted by the `mock_lockin` driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockLockinOptions {
    #[serde(default = "default_trace_points")]
    pub trace_points: usize,
}

impl Default for MockLockinOptions {
    fn default() -> Self {
        Self {
            trace_points: default_trace_points(),
        }
    }
}

/// Simulated lock-in amplifier.
///
/// The demodulated outputs follow the reference: `X = A cos φ`,
/// `Y = A sin φ`.
#[derive(Debug, Clone)]
pub struct MockLockin {
    options: MockLockinOptions,
    state: Arc<Mutex<LockinState>>,
}

impl Default for MockLockin {
    fn default() -> Self {
        Self::new(MockLockinOptions::default())
    }
}

const TIME_CONSTANTS: [(&str, i64); 6] = [
    ("10us", 0),
    ("100us", 1),
    ("1ms", 2),
    ("10ms", 3),
    ("100ms", 4),
    ("1s", 5),
];

impl MockLockin {
    pub fn new(options: MockLockinOptions) -> Self {
        Self {
            options,
            state: Arc::new(Mutex::new(LockinState {
                frequency: 1000.0,
                amplitude: 0.1,
                phase: 0.0,
                time_constant: 2,
            })),
        }
    }

    /// Change the simulated signal phase, in degrees.
    pub fn set_signal_phase(&self, degrees: f64) {
        self.state.lock().phase = degrees;
    }
}

impl InstrumentDriver for MockLockin {
    fn declare(&self, builder: &mut InstrumentBuilder) -> Result<()> {
        let state = self.state.clone();

        let (r, w) = (state.clone(), state.clone());
        builder.add_parameter(
            ParameterBuilder::new("frequency")
                .label("Reference frequency")
                .unit("Hz")
                .validator(Numbers::new(1e-3, 102e3))
                .getter(move || Ok(r.lock().frequency.into()))
                .setter(move |v| {
                    w.lock().frequency = v.as_f64().unwrap_or_default();
                    Ok(())
                })
                .build()?,
        )?;

        let (r, w) = (state.clone(), state.clone());
        builder.add_parameter(
            ParameterBuilder::new("amplitude")
                .label("Reference amplitude")
                .unit("V")
                .validator(Numbers::new(0.004, 5.0))
                .getter(move || Ok(r.lock().amplitude.into()))
                .setter(move |v| {
                    w.lock().amplitude = v.as_f64().unwrap_or_default();
                    Ok(())
                })
                .build()?,
        )?;

        let (r, w) = (state.clone(), state.clone());
        builder.add_parameter(
            ParameterBuilder::new("time_constant")
                .label("Filter time constant")
                .val_mapping(TIME_CONSTANTS)
                .getter(move || Ok(ParameterValue::Int(r.lock().time_constant)))
                .setter(move |raw| {
                    if let Some(code) = raw.as_i64() {
                        w.lock().time_constant = code;
                    }
                    Ok(())
                })
                .build()?,
        )?;

        let r = state.clone();
        builder.add_parameter(
            ParameterBuilder::new("X")
                .unit("V")
                .getter(move || {
                    let s = r.lock();
                    Ok((s.amplitude * s.phase.to_radians().cos()).into())
                })
                .build()?,
        )?;

        let r = state.clone();
        builder.add_parameter(
            ParameterBuilder::new("Y")
                .unit("V")
                .getter(move || {
                    let s = r.lock();
                    Ok((s.amplitude * s.phase.to_radians().sin()).into())
                })
                .build()?,
        )?;

        let points = self.options.trace_points.max(1);
        let r = state.clone();
        let time_axis = ArrayValue::from_vec((0..points).map(|i| i as f64 * 1e-3).collect());
        builder.add_parameter(
            ArrayParameter::new("trace", vec![points], move || {
                let s = r.lock();
                Ok((0..points)
                    .map(|i| {
                        let t = i as f64 * 1e-3;
                        s.amplitude * (2.0 * PI * s.frequency * t + s.phase.to_radians()).sin()
                    })
                    .collect())
            })?
            .with_label("Signal trace")
            .with_unit("V")
            .with_setpoints(vec![Setpoints::new("time", time_axis).with_unit("s")])?,
        )?;

        let r = state;
        builder.add_parameter(
            MultiParameter::new(
                "XY",
                vec![MultiItem::scalar("X", "V"), MultiItem::scalar("Y", "V")],
                move || {
                    let s = r.lock();
                    let phase = s.phase.to_radians();
                    Ok(vec![
                        (s.amplitude * phase.cos()).into(),
                        (s.amplitude * phase.sin()).into(),
                    ])
                },
            )?
            .with_label("Demodulated outputs"),
        )?;
        Ok(())
    }
}
