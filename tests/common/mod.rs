//! Common test utilities for rust-labctl integration tests
//!
//! This module provides reusable helpers for:
//! - Instruments whose reads are slow and record when they ran
//! - Overlap checks on recorded execution windows
//! - Building the DAC + lock-in station used across tests

#![allow(dead_code)] // Utilities may not all be used by every test binary

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_labctl::mock::{MockDac, MockDacOptions, MockLockin};
use rust_labctl::{
    Instrument, InstrumentBuilder, InstrumentDriver, InstrumentRegistry, ParameterBuilder,
};

/// Time interval during which one operation held an instrument.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub start: Instant,
    pub end: Instant,
}

impl Window {
    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Shared log of execution windows, keyed by instrument name.
pub type WindowLog = Arc<Mutex<Vec<(String, Window)>>>;

/// Instrument with `count` parameters `p0..pN` whose reads sleep for
/// `delay` and record their execution window in `log`.
pub fn slow_instrument(
    registry: &InstrumentRegistry,
    name: &str,
    count: usize,
    delay: Duration,
    log: &WindowLog,
) -> Arc<Instrument> {
    let mut builder = InstrumentBuilder::new(name);
    for i in 0..count {
        let log = log.clone();
        let owner = name.to_string();
        builder
            .add_parameter(
                ParameterBuilder::new(format!("p{}", i))
                    .unit("V")
                    .getter(move || {
                        let start = Instant::now();
                        std::thread::sleep(delay);
                        log.lock().push((
                            owner.clone(),
                            Window {
                                start,
                                end: Instant::now(),
                            },
                        ));
                        Ok((i as f64).into())
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
    }
    builder.build(registry).unwrap()
}

/// Windows recorded for one instrument.
pub fn windows_for(log: &WindowLog, name: &str) -> Vec<Window> {
    log.lock()
        .iter()
        .filter(|(owner, _)| owner == name)
        .map(|(_, w)| *w)
        .collect()
}

/// Panics if any two windows overlap.
pub fn assert_disjoint(windows: &[Window], context: &str) {
    for (i, a) in windows.iter().enumerate() {
        for b in &windows[i + 1..] {
            assert!(!a.overlaps(b), "{}: overlapping windows {:?} and {:?}", context, a, b);
        }
    }
}

/// Registry holding a 2-channel mock DAC `dac` and a mock lock-in `lockin`.
pub fn dac_and_lockin() -> (InstrumentRegistry, Arc<Instrument>, Arc<Instrument>) {
    let registry = InstrumentRegistry::new();
    let dac = MockDac::new(MockDacOptions {
        channels: 2,
        ..Default::default()
    })
    .build("dac", &registry)
    .unwrap();
    let lockin = MockLockin::default().build("lockin", &registry).unwrap();
    (registry, dac, lockin)
}
