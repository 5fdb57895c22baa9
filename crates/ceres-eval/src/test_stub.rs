//! Shared fixtures for gateway and cache tests: a minimal position and an
//! instrumented evaluator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use ceres_mcts::{
    BatchedEvaluator, CompressedPolicy, EncodedMove, EvalBatch, EvalError, EvalOutput,
    PositionHash, PositionOps, TerminalStatus,
};

pub(crate) const STUB_DIM: usize = 2;

#[derive(Clone, Debug)]
pub(crate) struct StubPosition {
    v: u32,
}

impl StubPosition {
    pub fn new(v: u32) -> Self {
        Self { v }
    }
}

impl PositionOps for StubPosition {
    fn legal_moves(&self, out: &mut Vec<EncodedMove>) {
        out.extend_from_slice(&[1, 2]);
    }

    fn make_move(&mut self, mv: EncodedMove) {
        self.v = self.v.wrapping_add(mv as u32);
    }

    fn terminal_status(&self) -> TerminalStatus {
        TerminalStatus::NotTerminal
    }

    fn hash(&self) -> PositionHash {
        let mut x = self.v as u64 + 0x9E37_79B9_7F4A_7C15;
        x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        x ^= x >> 27;
        PositionHash::new(x, (x >> 17) as u32)
    }

    fn encoded_len(&self) -> usize {
        STUB_DIM
    }

    fn encode_into(&self, buf: &mut [f32]) {
        buf[0] = self.v as f32;
        buf[1] = 1.0;
    }
}

pub(crate) fn batch_of(values: &[u32]) -> EvalBatch {
    let mut batch = EvalBatch::new(STUB_DIM);
    for &v in values {
        batch.push(&StubPosition::new(v));
    }
    batch
}

/// Evaluator that records every batch size it sees and produces a value
/// derived from the encoded position, so tests can tell results apart.
pub(crate) struct StubEvaluator {
    min_batch: usize,
    max_batch: usize,
    delay: Duration,
    fail: AtomicBool,
    sizes: Mutex<Vec<usize>>,
}

impl StubEvaluator {
    pub fn new() -> Self {
        Self {
            min_batch: 1,
            max_batch: usize::MAX,
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            sizes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_min_batch(mut self, n: usize) -> Self {
        self.min_batch = n;
        self
    }

    pub fn with_max_batch(mut self, n: usize) -> Self {
        self.max_batch = n;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(self) -> Self {
        self.fail.store(true, Ordering::Relaxed);
        self
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.sizes.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.sizes.lock().unwrap().len()
    }
}

impl BatchedEvaluator for StubEvaluator {
    fn input_dim(&self) -> usize {
        STUB_DIM
    }

    fn min_batch_size(&self) -> usize {
        self.min_batch
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }

    fn evaluate(&self, batch: &EvalBatch) -> Result<Vec<EvalOutput>, EvalError> {
        self.sizes.lock().unwrap().push(batch.len());
        if self.fail.load(Ordering::Relaxed) {
            return Err(EvalError::Device("stub failure".into()));
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok((0..batch.len())
            .map(|i| {
                let v = batch.entry_planes(i)[0];
                let legal = batch.moves_of(i);
                EvalOutput {
                    win: (v / 1000.0).clamp(0.0, 1.0),
                    loss: 0.1,
                    policy: CompressedPolicy::from_probs(legal, &vec![1.0; legal.len()]),
                    moves_left: v,
                    value_uncertainty: 0.0,
                    policy_uncertainty: 0.0,
                    secondary_value: 0.0,
                }
            })
            .collect())
    }
}
