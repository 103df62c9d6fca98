//! Thread-affinity batched caller.
//!
//! Runs a batch of gets and sets either sequentially or with one blocking
//! worker per underlying instrument. Values whose operations touch the same
//! root instrument (directly, through a delegate, or through a grouped
//! value) always land in the same worker and run in submission order, so an
//! instrument's transport is never driven from two threads at once.
//!
//! ```text
//! ops:  [dac.ch01.voltage, lockin.X, chip.device1.gate(→dac), lockin.Y]
//!
//! worker 1 (dac):     op0 ─ op2
//! worker 2 (lockin):  op1 ─ op3
//!                     results reassembled as [r0, r1, r2, r3]
//! ```

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::BatchConfig;
use crate::error::{InstrumentError, Result};
use crate::instrument::InstrumentId;
use crate::parameter::NamedValue;
use crate::value::ParameterValue;

/// One operation in a batch.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    Get(Arc<dyn NamedValue>),
    Set(Arc<dyn NamedValue>, ParameterValue),
}

impl BatchOperation {
    /// Named value the operation acts on.
    pub fn value(&self) -> &Arc<dyn NamedValue> {
        match self {
            BatchOperation::Get(value) | BatchOperation::Set(value, _) => value,
        }
    }

    /// `Some(value)` for a get, `None` for a set.
    fn run(&self) -> Result<Option<ParameterValue>> {
        match self {
            BatchOperation::Get(value) => value.get().map(Some),
            BatchOperation::Set(value, target) => value.set(target.clone()).map(|_| None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AffinityKey {
    Instrument(InstrumentId),
    /// Values not bound to any instrument are keyed by identity.
    Value(usize),
}

/// Keys of every value at the end of the forwarding chain.
fn affinity_keys(value: &Arc<dyn NamedValue>) -> Vec<AffinityKey> {
    let mut keys = Vec::new();
    collect_keys(value, &mut keys);
    keys
}

fn collect_keys(value: &Arc<dyn NamedValue>, keys: &mut Vec<AffinityKey>) {
    let sources = value.sources();
    if !sources.is_empty() {
        for source in &sources {
            collect_keys(source, keys);
        }
        return;
    }
    let instruments = value.underlying_instruments();
    if instruments.is_empty() {
        keys.push(AffinityKey::Value(Arc::as_ptr(value) as *const () as usize));
    } else {
        keys.extend(instruments.iter().map(|i| AffinityKey::Instrument(i.id())));
    }
}

/// Group operation indices so that operations sharing any underlying
/// instrument end up together. Each partition lists indices in order.
pub fn partition(ops: &[BatchOperation]) -> Vec<Vec<usize>> {
    let mut partitions: Vec<Option<Vec<usize>>> = Vec::new();
    let mut owner: HashMap<AffinityKey, usize> = HashMap::new();

    for (index, op) in ops.iter().enumerate() {
        let keys = affinity_keys(op.value());
        let mut touched: Vec<usize> = keys.iter().filter_map(|k| owner.get(k).copied()).collect();
        touched.sort_unstable();
        touched.dedup();

        let target = match touched.first() {
            Some(&first) => first,
            None => {
                partitions.push(Some(Vec::new()));
                partitions.len() - 1
            }
        };
        // value spans several partitions: merge them into the oldest
        for &other in touched.iter().skip(1) {
            let moved = partitions[other].take().unwrap_or_default();
            if let Some(members) = partitions[target].as_mut() {
                members.extend(moved);
                members.sort_unstable();
            }
            for slot in owner.values_mut() {
                if *slot == other {
                    *slot = target;
                }
            }
        }
        if let Some(members) = partitions[target].as_mut() {
            members.push(index);
        }
        for key in keys {
            owner.insert(key, target);
        }
    }
    partitions.into_iter().flatten().collect()
}

/// Executes batches of operations, optionally one worker per instrument.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchedCaller {
    use_threads: bool,
}

impl BatchedCaller {
    /// `use_threads = false` runs everything in order on one worker.
    pub fn new(use_threads: bool) -> Self {
        Self { use_threads }
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(config.use_threads)
    }

    pub fn use_threads(&self) -> bool {
        self.use_threads
    }

    /// Run every operation and return results in input order.
    ///
    /// All operations run even when some fail. The earliest failure (by
    /// input position) is returned as `BatchFailed`, with later failures
    /// attached as suppressed errors.
    pub async fn execute(&self, ops: Vec<BatchOperation>) -> Result<Vec<Option<ParameterValue>>> {
        let partitions = if self.use_threads {
            partition(&ops)
        } else {
            vec![(0..ops.len()).collect()]
        };
        debug!(
            operations = ops.len(),
            workers = partitions.len(),
            threaded = self.use_threads,
            "executing batch"
        );

        let handles = partitions.iter().map(|indices| {
            let work: Vec<(usize, BatchOperation)> =
                indices.iter().map(|&i| (i, ops[i].clone())).collect();
            tokio::task::spawn_blocking(move || {
                work.into_iter()
                    .map(|(i, op)| (i, op.run()))
                    .collect::<Vec<_>>()
            })
        });
        let joined = join_all(handles).await;

        let mut results: Vec<Option<Result<Option<ParameterValue>>>> =
            (0..ops.len()).map(|_| None).collect();
        for (indices, outcome) in partitions.iter().zip(joined) {
            match outcome {
                Ok(done) => {
                    for (i, result) in done {
                        results[i] = Some(result);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "batch worker panicked");
                    for &i in indices {
                        results[i] = Some(Err(InstrumentError::Hardware(format!(
                            "worker for '{}' failed: {}",
                            ops[i].value().full_name(),
                            e
                        ))));
                    }
                }
            }
        }

        let mut values = Vec::with_capacity(ops.len());
        let mut failures = Vec::new();
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Some(Ok(value)) => values.push(value),
                Some(Err(e)) => failures.push((i, e)),
                None => failures.push((
                    i,
                    InstrumentError::Hardware(format!(
                        "operation on '{}' did not run",
                        ops[i].value().full_name()
                    )),
                )),
            }
        }

        let mut failures = failures.into_iter();
        match failures.next() {
            None => Ok(values),
            Some((index, source)) => {
                let suppressed: Vec<_> = failures.collect();
                warn!(index, error = %source, suppressed = suppressed.len(), "batch failed");
                Err(InstrumentError::BatchFailed {
                    index,
                    source: Box::new(source),
                    suppressed,
                })
            }
        }
    }

    /// Read every value.
    pub async fn get_all(&self, values: &[Arc<dyn NamedValue>]) -> Result<Vec<ParameterValue>> {
        let ops = values.iter().cloned().map(BatchOperation::Get).collect();
        Ok(self
            .execute(ops)
            .await?
            .into_iter()
            .map(|v| v.unwrap_or(ParameterValue::Null))
            .collect())
    }

    /// Write every (value, target) pair.
    pub async fn set_all(&self, pairs: Vec<(Arc<dyn NamedValue>, ParameterValue)>) -> Result<()> {
        let ops = pairs
            .into_iter()
            .map(|(value, target)| BatchOperation::Set(value, target))
            .collect();
        self.execute(ops).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{Instrument, InstrumentBuilder, InstrumentRegistry};
    use crate::parameter::{DelegateParameter, ParameterBuilder};

    fn instrument(registry: &InstrumentRegistry, name: &str) -> Arc<Instrument> {
        let mut builder = InstrumentBuilder::new(name);
        for p in ["a", "b"] {
            builder
                .add_parameter(ParameterBuilder::new(p).manual(0.0).build().unwrap())
                .unwrap();
        }
        builder.build(registry).unwrap()
    }

    fn get(instrument: &Instrument, name: &str) -> BatchOperation {
        BatchOperation::Get(instrument.parameter(name).unwrap())
    }

    #[test]
    fn test_partition_by_instrument() {
        let registry = InstrumentRegistry::new();
        let dac = instrument(&registry, "dac");
        let lockin = instrument(&registry, "lockin");
        let ops = vec![get(&dac, "a"), get(&lockin, "a"), get(&dac, "b"), get(&lockin, "b")];
        assert_eq!(partition(&ops), vec![vec![0, 2], vec![1, 3]]);
    }

    #[test]
    fn test_delegate_joins_source_partition() {
        let registry = InstrumentRegistry::new();
        let dac = instrument(&registry, "dac");
        let lockin = instrument(&registry, "lockin");
        let mut chip = InstrumentBuilder::new("chip");
        let gate = chip
            .add_parameter(DelegateParameter::new("gate", dac.parameter("a").unwrap()).unwrap())
            .unwrap();
        chip.build(&registry).unwrap();

        let ops = vec![
            get(&lockin, "a"),
            BatchOperation::Get(gate),
            get(&dac, "b"),
        ];
        assert_eq!(partition(&ops), vec![vec![0], vec![1, 2]]);
    }

    #[test]
    fn test_unbound_values_partition_by_identity() {
        let shared: Arc<dyn NamedValue> =
            Arc::new(ParameterBuilder::new("x").manual(0.0).build().unwrap());
        let other: Arc<dyn NamedValue> =
            Arc::new(ParameterBuilder::new("y").manual(0.0).build().unwrap());
        let ops = vec![
            BatchOperation::Get(shared.clone()),
            BatchOperation::Get(other),
            BatchOperation::Get(shared),
        ];
        assert_eq!(partition(&ops), vec![vec![0, 2], vec![1]]);
    }

    #[test]
    fn test_delegates_onto_unbound_source_share_partition() {
        let source: Arc<dyn NamedValue> =
            Arc::new(ParameterBuilder::new("x").manual(0.0).build().unwrap());
        let first: Arc<dyn NamedValue> =
            Arc::new(DelegateParameter::new("first", source.clone()).unwrap());
        let second: Arc<dyn NamedValue> =
            Arc::new(DelegateParameter::new("second", source.clone()).unwrap());
        let unrelated: Arc<dyn NamedValue> =
            Arc::new(ParameterBuilder::new("y").manual(0.0).build().unwrap());
        let ops = vec![
            BatchOperation::Get(first),
            BatchOperation::Get(unrelated),
            BatchOperation::Get(second),
            BatchOperation::Get(source),
        ];
        assert_eq!(partition(&ops), vec![vec![0, 2, 3], vec![1]]);
    }

    #[tokio::test]
    async fn test_results_in_input_order() {
        let registry = InstrumentRegistry::new();
        let dac = instrument(&registry, "dac");
        let lockin = instrument(&registry, "lockin");
        let caller = BatchedCaller::new(true);

        caller
            .set_all(vec![
                (dac.parameter("a").unwrap(), 1.0.into()),
                (lockin.parameter("a").unwrap(), 2.0.into()),
                (dac.parameter("b").unwrap(), 3.0.into()),
            ])
            .await
            .unwrap();
        let values = caller
            .get_all(&[
                dac.parameter("b").unwrap(),
                lockin.parameter("a").unwrap(),
                dac.parameter("a").unwrap(),
            ])
            .await
            .unwrap();
        assert_eq!(
            values,
            vec![
                ParameterValue::Float(3.0),
                ParameterValue::Float(2.0),
                ParameterValue::Float(1.0)
            ]
        );
    }

    #[tokio::test]
    async fn test_set_then_get_same_instrument_keeps_order() {
        let registry = InstrumentRegistry::new();
        let dac = instrument(&registry, "dac");
        let a = dac.parameter("a").unwrap();
        let results = BatchedCaller::new(true)
            .execute(vec![
                BatchOperation::Set(a.clone(), 4.0.into()),
                BatchOperation::Get(a),
            ])
            .await
            .unwrap();
        assert_eq!(results, vec![None, Some(ParameterValue::Float(4.0))]);
    }

    #[tokio::test]
    async fn test_errors_reported_by_input_order() {
        let registry = InstrumentRegistry::new();
        let mut builder = InstrumentBuilder::new("bad");
        builder
            .add_parameter(
                ParameterBuilder::new("broken")
                    .getter(|| Err(InstrumentError::Hardware("timeout".into())))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let bad = builder.build(&registry).unwrap();
        let good = instrument(&registry, "good");

        for threaded in [false, true] {
            let err = BatchedCaller::new(threaded)
                .execute(vec![
                    get(&good, "a"),
                    get(&bad, "broken"),
                    get(&good, "b"),
                    get(&bad, "broken"),
                ])
                .await
                .unwrap_err();
            match err {
                InstrumentError::BatchFailed {
                    index, suppressed, ..
                } => {
                    assert_eq!(index, 1);
                    assert_eq!(suppressed.len(), 1);
                    assert_eq!(suppressed[0].0, 3);
                }
                other => panic!("unexpected error {other:?}"),
            }
        }
    }
}
