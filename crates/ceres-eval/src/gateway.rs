use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::trace;

use ceres_mcts::{BatchedEvaluator, EvalBatch, EvalError, EvalOutput, InputEncoding};

// ---------------------------------------------------------------------------
// GatewayStats
// ---------------------------------------------------------------------------

/// Per-gateway timing and batch statistics (atomic, lock-free reads). The
/// driver reads these to tune its target batch size.
pub struct GatewayStats {
    /// Device calls issued.
    pub batches: AtomicU64,
    /// Real positions evaluated (padding excluded).
    pub positions: AtomicU64,
    /// Positions appended purely to satisfy a minimum batch size.
    pub padded_positions: AtomicU64,
    /// Cumulative nanoseconds inside the device evaluators.
    pub eval_time_ns: AtomicU64,
}

impl GatewayStats {
    fn new() -> Self {
        Self {
            batches: AtomicU64::new(0),
            positions: AtomicU64::new(0),
            padded_positions: AtomicU64::new(0),
            eval_time_ns: AtomicU64::new(0),
        }
    }

    pub fn avg_batch_size(&self) -> f64 {
        let b = self.batches.load(Ordering::Relaxed);
        if b == 0 {
            return 0.0;
        }
        self.positions.load(Ordering::Relaxed) as f64 / b as f64
    }

    pub fn eval_time_secs(&self) -> f64 {
        self.eval_time_ns.load(Ordering::Relaxed) as f64 / 1e9
    }
}

// ---------------------------------------------------------------------------
// DeviceGateway
// ---------------------------------------------------------------------------

struct Instance {
    evaluator: Box<dyn BatchedEvaluator>,
    /// Device evaluators are typically not reentrant; one call at a time.
    lock: Mutex<()>,
    /// Callers queued or running on this instance, for routing.
    inflight: AtomicUsize,
}

/// Front door to one or more device evaluators.
///
/// Serialises access per instance, routes each batch to the least-loaded
/// instance, pads undersized batches up to the device minimum (discarding the
/// padding results) and records per-batch timing. Implements
/// [`BatchedEvaluator`] itself, so search workers just share the gateway.
pub struct DeviceGateway {
    instances: Vec<Instance>,
    input_dim: usize,
    input_encoding: InputEncoding,
    max_batch: usize,
    stats: GatewayStats,
}

impl DeviceGateway {
    /// Wrap several evaluator instances (e.g. one per device). They must
    /// agree on input layout.
    pub fn new(evaluators: Vec<Box<dyn BatchedEvaluator>>) -> Self {
        assert!(!evaluators.is_empty(), "gateway needs at least one evaluator");
        let input_dim = evaluators[0].input_dim();
        let input_encoding = evaluators[0].input_encoding();
        let max_batch = evaluators
            .iter()
            .map(|e| e.max_batch_size())
            .min()
            .unwrap_or(usize::MAX);
        for e in &evaluators {
            assert_eq!(e.input_dim(), input_dim, "mixed input dims across instances");
            assert_eq!(
                e.input_encoding(),
                input_encoding,
                "mixed input encodings across instances"
            );
        }
        Self {
            instances: evaluators
                .into_iter()
                .map(|evaluator| Instance {
                    evaluator,
                    lock: Mutex::new(()),
                    inflight: AtomicUsize::new(0),
                })
                .collect(),
            input_dim,
            input_encoding,
            max_batch,
            stats: GatewayStats::new(),
        }
    }

    pub fn single(evaluator: Box<dyn BatchedEvaluator>) -> Self {
        Self::new(vec![evaluator])
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    fn least_loaded(&self) -> &Instance {
        self.instances
            .iter()
            .min_by_key(|inst| inst.inflight.load(Ordering::Relaxed))
            .expect("at least one instance")
    }
}

/// Decrements the instance's in-flight count on every exit path.
struct InflightGuard<'a>(&'a AtomicUsize);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl BatchedEvaluator for DeviceGateway {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn input_encoding(&self) -> InputEncoding {
        self.input_encoding
    }

    fn min_batch_size(&self) -> usize {
        // Padding is handled here; callers never need to.
        1
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }

    fn evaluate(&self, batch: &EvalBatch) -> Result<Vec<EvalOutput>, EvalError> {
        if batch.dim() != self.input_dim {
            return Err(EvalError::ShapeMismatch {
                expected: self.input_dim,
                got: batch.dim(),
            });
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let instance = self.least_loaded();
        instance.inflight.fetch_add(1, Ordering::Relaxed);
        let _guard = InflightGuard(&instance.inflight);

        // Devices that misbehave below a minimum batch get the first entry
        // repeated; the duplicate results are sliced off below.
        let min = instance.evaluator.min_batch_size();
        let mut padded_storage;
        let device_batch = if batch.len() < min {
            padded_storage = batch.clone();
            while padded_storage.len() < min {
                padded_storage.push_entry_from(batch, 0);
            }
            self.stats
                .padded_positions
                .fetch_add((min - batch.len()) as u64, Ordering::Relaxed);
            &padded_storage
        } else {
            batch
        };

        let lock = instance.lock.lock().expect("gateway instance lock poisoned");
        let t0 = Instant::now();
        let mut results = instance.evaluator.evaluate(device_batch)?;
        let elapsed = t0.elapsed().as_nanos() as u64;
        drop(lock);

        if results.len() != device_batch.len() {
            return Err(EvalError::ShapeMismatch {
                expected: device_batch.len(),
                got: results.len(),
            });
        }
        results.truncate(batch.len());
        if results.iter().any(|r| !r.is_finite()) {
            return Err(EvalError::NonFinite);
        }

        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats
            .positions
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.stats.eval_time_ns.fetch_add(elapsed, Ordering::Relaxed);
        trace!(
            positions = batch.len(),
            padded = device_batch.len() - batch.len(),
            elapsed_us = elapsed / 1_000,
            "gateway batch evaluated"
        );
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stub::{batch_of, StubEvaluator, STUB_DIM};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn results_match_inner_evaluator() {
        let inner = Arc::new(StubEvaluator::new());
        let gateway = DeviceGateway::single(Box::new(Arc::clone(&inner)));

        let batch = batch_of(&[5, 9]);
        let direct = inner.evaluate(&batch).unwrap();
        let via_gateway = gateway.evaluate(&batch).unwrap();

        assert_eq!(via_gateway.len(), direct.len());
        for (a, b) in via_gateway.iter().zip(direct.iter()) {
            assert_eq!(a.win, b.win);
            assert_eq!(a.loss, b.loss);
        }
        assert_eq!(gateway.stats().batches.load(Ordering::Relaxed), 1);
        assert_eq!(gateway.stats().positions.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn undersized_batches_are_padded_and_sliced() {
        let inner = Arc::new(StubEvaluator::new().with_min_batch(4));
        let gateway = DeviceGateway::single(Box::new(Arc::clone(&inner)));

        let batch = batch_of(&[7]);
        let results = gateway.evaluate(&batch).unwrap();

        assert_eq!(results.len(), 1, "padding results are discarded");
        assert_eq!(inner.batch_sizes(), vec![4], "device saw the padded batch");
        assert_eq!(gateway.stats().padded_positions.load(Ordering::Relaxed), 3);
        assert_eq!(gateway.stats().positions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn empty_batch_short_circuits() {
        let inner = Arc::new(StubEvaluator::new().with_min_batch(8));
        let gateway = DeviceGateway::single(Box::new(Arc::clone(&inner)));
        let results = gateway.evaluate(&batch_of(&[])).unwrap();
        assert!(results.is_empty());
        assert!(inner.batch_sizes().is_empty(), "device never called");
    }

    #[test]
    fn shape_mismatch_rejected_up_front() {
        let gateway = DeviceGateway::single(Box::new(StubEvaluator::new()));
        let wrong = EvalBatch::new(STUB_DIM + 1);
        assert!(matches!(
            gateway.evaluate(&wrong),
            Err(EvalError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn device_errors_pass_through() {
        let inner = Arc::new(StubEvaluator::new().failing());
        let gateway = DeviceGateway::single(Box::new(Arc::clone(&inner)));
        assert!(matches!(
            gateway.evaluate(&batch_of(&[3])),
            Err(EvalError::Device(_))
        ));
    }

    #[test]
    fn max_batch_is_the_weakest_instance() {
        let a = StubEvaluator::new().with_max_batch(128);
        let b = StubEvaluator::new().with_max_batch(32);
        let gateway = DeviceGateway::new(vec![Box::new(a), Box::new(b)]);
        assert_eq!(gateway.max_batch_size(), 32);
    }

    #[test]
    fn concurrent_calls_spread_across_instances() {
        let first = Arc::new(StubEvaluator::new().with_delay(Duration::from_millis(100)));
        let second = Arc::new(StubEvaluator::new().with_delay(Duration::from_millis(100)));
        let gateway = Arc::new(DeviceGateway::new(vec![
            Box::new(Arc::clone(&first)),
            Box::new(Arc::clone(&second)),
        ]));

        let g1 = Arc::clone(&gateway);
        let t1 = std::thread::spawn(move || g1.evaluate(&batch_of(&[1])).unwrap());
        // Give the first call time to mark its instance busy.
        std::thread::sleep(Duration::from_millis(30));
        let g2 = Arc::clone(&gateway);
        let t2 = std::thread::spawn(move || g2.evaluate(&batch_of(&[2])).unwrap());

        t1.join().unwrap();
        t2.join().unwrap();
        assert_eq!(first.batch_sizes().len(), 1, "first instance took one call");
        assert_eq!(second.batch_sizes().len(), 1, "second instance took the other");
    }
}
