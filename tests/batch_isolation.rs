//! Thread-affinity guarantees of the batched caller, checked with
//! recorded execution windows.

mod common;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{assert_disjoint, slow_instrument, windows_for, WindowLog};
use rust_labctl::error::InstrumentError;
use rust_labctl::group::{ChannelTypeRegistry, InstrumentGroup};
use rust_labctl::{BatchOperation, BatchedCaller, InstrumentRegistry, ParameterValue};

const DELAY: Duration = Duration::from_millis(40);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_instrument_never_interleaves() {
    let registry = InstrumentRegistry::new();
    let log: WindowLog = Arc::new(Mutex::new(Vec::new()));
    let a = slow_instrument(&registry, "a", 3, DELAY, &log);
    let b = slow_instrument(&registry, "b", 3, DELAY, &log);

    // interleave submissions across instruments
    let mut ops = Vec::new();
    for i in 0..3 {
        let name = format!("p{}", i);
        ops.push(BatchOperation::Get(a.parameter(&name).unwrap()));
        ops.push(BatchOperation::Get(b.parameter(&name).unwrap()));
    }

    let results = BatchedCaller::new(true).execute(ops).await.unwrap();
    let expected: Vec<_> = [0.0, 0.0, 1.0, 1.0, 2.0, 2.0]
        .into_iter()
        .map(|v| Some(ParameterValue::Float(v)))
        .collect();
    assert_eq!(results, expected);

    let a_windows = windows_for(&log, "a");
    let b_windows = windows_for(&log, "b");
    assert_eq!(a_windows.len(), 3);
    assert_disjoint(&a_windows, "instrument a");
    assert_disjoint(&b_windows, "instrument b");

    // different instruments were free to run side by side
    let crossed = a_windows
        .iter()
        .any(|wa| b_windows.iter().any(|wb| wa.overlaps(wb)));
    assert!(crossed, "expected the two instruments to run concurrently");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_instrument_order_is_submission_order() {
    let registry = InstrumentRegistry::new();
    let log: WindowLog = Arc::new(Mutex::new(Vec::new()));
    let a = slow_instrument(&registry, "a", 4, Duration::from_millis(5), &log);

    let ops = ["p3", "p0", "p2", "p1"]
        .iter()
        .map(|n| BatchOperation::Get(a.parameter(n).unwrap()))
        .collect();
    let results = BatchedCaller::new(true).execute(ops).await.unwrap();
    let values: Vec<f64> = results
        .into_iter()
        .map(|v| v.and_then(|v| v.as_f64()).unwrap())
        .collect();
    assert_eq!(values, vec![3.0, 0.0, 2.0, 1.0]);

    let windows = windows_for(&log, "a");
    assert!(windows.windows(2).all(|w| w[0].end <= w[1].start));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delegates_share_their_source_worker() {
    let registry = InstrumentRegistry::new();
    let log: WindowLog = Arc::new(Mutex::new(Vec::new()));
    let a = slow_instrument(&registry, "a", 2, DELAY, &log);
    slow_instrument(&registry, "b", 1, DELAY, &log);

    let spec = serde_yaml::from_str(
        "submodules:\n  dev:\n    parameters:\n      x: a.p0\n      y: a.p1\n",
    )
    .unwrap();
    let group = InstrumentGroup::new("g", spec)
        .build(&registry, &ChannelTypeRegistry::new())
        .unwrap();

    let ops = vec![
        BatchOperation::Get(group.resolve_parameter("dev.x").unwrap()),
        BatchOperation::Get(registry.resolve_parameter("b.p0").unwrap()),
        BatchOperation::Get(group.resolve_parameter("dev.y").unwrap()),
        BatchOperation::Get(a.parameter("p0").unwrap()),
    ];
    BatchedCaller::new(true).execute(ops).await.unwrap();
    assert_disjoint(&windows_for(&log, "a"), "delegates onto a");
    assert_eq!(windows_for(&log, "a").len(), 3);
}

#[tokio::test]
async fn sequential_mode_runs_one_at_a_time() {
    let registry = InstrumentRegistry::new();
    let log: WindowLog = Arc::new(Mutex::new(Vec::new()));
    let a = slow_instrument(&registry, "a", 1, Duration::from_millis(10), &log);
    let b = slow_instrument(&registry, "b", 1, Duration::from_millis(10), &log);

    let started = Instant::now();
    BatchedCaller::new(false)
        .get_all(&[a.parameter("p0").unwrap(), b.parameter("p0").unwrap()])
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(20));

    let all: Vec<_> = log.lock().iter().map(|(_, w)| *w).collect();
    assert_disjoint(&all, "sequential batch");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failure_does_not_cancel_other_partitions() {
    let (_registry, dac, lockin) = common::dac_and_lockin();
    let ops = vec![
        BatchOperation::Set(dac.resolve_parameter("ch01.voltage").unwrap(), 99.0.into()),
        BatchOperation::Set(lockin.parameter("amplitude").unwrap(), 1.5.into()),
        BatchOperation::Set(dac.resolve_parameter("ch02.voltage").unwrap(), 2.0.into()),
        BatchOperation::Get(lockin.parameter("X").unwrap()),
    ];
    let err = BatchedCaller::new(true).execute(ops).await.unwrap_err();
    match err {
        InstrumentError::BatchFailed {
            index,
            source,
            suppressed,
        } => {
            assert_eq!(index, 0);
            assert!(matches!(*source, InstrumentError::Validation { .. }));
            assert!(suppressed.is_empty());
        }
        other => panic!("unexpected error {other:?}"),
    }
    // the rest of the batch still ran
    assert_eq!(lockin.get("amplitude").unwrap(), ParameterValue::Float(1.5));
    assert_eq!(dac.get("ch02.voltage").unwrap(), ParameterValue::Float(2.0));
}
