use thiserror::Error;

use crate::policy::CompressedPolicy;
use crate::position::{EncodedMove, PositionHash, PositionOps};

// ---------------------------------------------------------------------------
// EvalError
// ---------------------------------------------------------------------------

/// Failure from a batched evaluator. Any of these aborts the cycle: no
/// partial batch result is ever applied to the tree.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("input shape mismatch: evaluator expects dim {expected}, batch has {got}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("device error: {0}")]
    Device(String),

    #[error("evaluator produced non-finite outputs")]
    NonFinite,
}

// ---------------------------------------------------------------------------
// InputEncoding
// ---------------------------------------------------------------------------

/// Input dtype an evaluator expects. Declared by the evaluator itself — never
/// inferred from model file names or other side channels.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InputEncoding {
    Float32,
    /// Byte planes; the device evaluator quantises the encoded f32 planes.
    Uint8,
}

// ---------------------------------------------------------------------------
// EvalBatch
// ---------------------------------------------------------------------------

/// Dense batch of encoded positions plus their legal move lists and hashes.
///
/// Planes are one flat `[len * dim]` buffer so an evaluator can hand the
/// slice straight to a device tensor. Legal moves ride along because policy
/// heads emit probabilities over them; hashes ride along for eval caches.
#[derive(Clone, Debug)]
pub struct EvalBatch {
    dim: usize,
    planes: Vec<f32>,
    moves: Vec<EncodedMove>,
    spans: Vec<(u32, u32)>,
    hashes: Vec<PositionHash>,
}

impl EvalBatch {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            planes: Vec::new(),
            moves: Vec::new(),
            spans: Vec::new(),
            hashes: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Encode `pos` and append it. Returns the entry's batch index.
    pub fn push<P: PositionOps>(&mut self, pos: &P) -> usize {
        debug_assert_eq!(pos.encoded_len(), self.dim);
        let i = self.len();

        let start = self.planes.len();
        self.planes.resize(start + self.dim, 0.0);
        pos.encode_into(&mut self.planes[start..]);

        let move_start = self.moves.len() as u32;
        let mut legal = Vec::new();
        pos.legal_moves(&mut legal);
        let count = legal.len() as u32;
        self.moves.extend_from_slice(&legal);
        self.spans.push((move_start, count));
        self.hashes.push(pos.hash());
        i
    }

    /// Append a copy of entry `i` of `other` (padding, cache-miss sub-batches).
    pub fn push_entry_from(&mut self, other: &EvalBatch, i: usize) {
        debug_assert_eq!(self.dim, other.dim);
        self.planes.extend_from_slice(other.entry_planes(i));
        let move_start = self.moves.len() as u32;
        let src = other.moves_of(i);
        self.moves.extend_from_slice(src);
        self.spans.push((move_start, src.len() as u32));
        self.hashes.push(other.hashes[i]);
    }

    /// Drop every entry past the first `n` (used when a failed evaluator
    /// call is retried with a smaller batch).
    pub fn truncate(&mut self, n: usize) {
        if n >= self.len() {
            return;
        }
        self.planes.truncate(n * self.dim);
        let moves_end = match n {
            0 => 0,
            _ => {
                let (start, count) = self.spans[n - 1];
                (start + count) as usize
            }
        };
        self.moves.truncate(moves_end);
        self.spans.truncate(n);
        self.hashes.truncate(n);
    }

    pub fn planes(&self) -> &[f32] {
        &self.planes
    }

    pub fn entry_planes(&self, i: usize) -> &[f32] {
        &self.planes[i * self.dim..(i + 1) * self.dim]
    }

    pub fn moves_of(&self, i: usize) -> &[EncodedMove] {
        let (start, count) = self.spans[i];
        &self.moves[start as usize..(start + count) as usize]
    }

    pub fn hash(&self, i: usize) -> PositionHash {
        self.hashes[i]
    }
}

// ---------------------------------------------------------------------------
// EvalOutput / LeafValues / PolicyLease
// ---------------------------------------------------------------------------

/// Per-position output of an evaluator: WDL value heads, compressed policy,
/// moves-left and uncertainty heads. Missing heads are zero.
#[derive(Clone, Copy, Debug)]
#[must_use]
pub struct EvalOutput {
    /// Win and loss probabilities for the side to move; draw is the rest.
    pub win: f32,
    pub loss: f32,
    pub policy: CompressedPolicy,
    pub moves_left: f32,
    pub value_uncertainty: f32,
    pub policy_uncertainty: f32,
    /// Optional secondary value head; 0 when the net has none.
    pub secondary_value: f32,
}

impl EvalOutput {
    /// Q = P(win) − P(loss), in [-1, +1].
    pub fn q(&self) -> f32 {
        self.win - self.loss
    }

    /// Split into the scalar summary and a policy lease. The lease must be
    /// explicitly released (into a child row) or discarded.
    pub fn into_parts(self) -> (LeafValues, PolicyLease) {
        (
            LeafValues {
                win: self.win,
                loss: self.loss,
                moves_left: self.moves_left,
                value_uncertainty: self.value_uncertainty,
                policy_uncertainty: self.policy_uncertainty,
                secondary_value: self.secondary_value,
            },
            PolicyLease {
                inner: Some(self.policy),
            },
        )
    }

    pub fn is_finite(&self) -> bool {
        self.win.is_finite()
            && self.loss.is_finite()
            && self.moves_left.is_finite()
            && self.value_uncertainty.is_finite()
            && self.policy_uncertainty.is_finite()
            && self.secondary_value.is_finite()
    }
}

/// Scalar part of an evaluation, after the policy has been leased away.
#[derive(Clone, Copy, Debug)]
pub struct LeafValues {
    pub win: f32,
    pub loss: f32,
    pub moves_left: f32,
    pub value_uncertainty: f32,
    pub policy_uncertainty: f32,
    pub secondary_value: f32,
}

impl LeafValues {
    pub fn q(&self) -> f32 {
        self.win - self.loss
    }
}

/// Single-use carrier for a compressed policy on its way into a child row.
///
/// Debug builds assert that every lease is either released or explicitly
/// discarded — a dropped live lease means a leaf lost its policy.
#[derive(Debug)]
pub struct PolicyLease {
    inner: Option<CompressedPolicy>,
}

impl PolicyLease {
    pub fn release(mut self) -> CompressedPolicy {
        self.inner.take().expect("policy lease released twice")
    }

    /// Abandon the policy (cycle abort paths).
    pub fn discard(mut self) {
        self.inner = None;
    }
}

impl Drop for PolicyLease {
    fn drop(&mut self) {
        debug_assert!(self.inner.is_none(), "policy lease dropped without release");
    }
}

// ---------------------------------------------------------------------------
// BatchedEvaluator trait
// ---------------------------------------------------------------------------

/// Clean boundary between search and evaluation.
///
/// The search assembles an `EvalBatch` and gets back one `EvalOutput` per
/// entry. It doesn't know whether the evaluator is a neural network on a
/// device, a gateway multiplexing several of them, or a uniform stub.
///
/// `Send + Sync` because evaluators are shared across worker threads; an
/// implementation whose `evaluate` is not reentrant must serialise internally.
pub trait BatchedEvaluator: Send + Sync {
    /// Number of f32 values per encoded position.
    fn input_dim(&self) -> usize;

    fn input_encoding(&self) -> InputEncoding {
        InputEncoding::Float32
    }

    /// Smallest batch the device produces correct results for. Callers must
    /// pad up to this; results for padding entries are discarded.
    fn min_batch_size(&self) -> usize {
        1
    }

    /// Largest batch a single call accepts.
    fn max_batch_size(&self) -> usize;

    fn evaluate(&self, batch: &EvalBatch) -> Result<Vec<EvalOutput>, EvalError>;
}

impl<T: BatchedEvaluator + ?Sized> BatchedEvaluator for std::sync::Arc<T> {
    fn input_dim(&self) -> usize {
        self.as_ref().input_dim()
    }

    fn input_encoding(&self) -> InputEncoding {
        self.as_ref().input_encoding()
    }

    fn min_batch_size(&self) -> usize {
        self.as_ref().min_batch_size()
    }

    fn max_batch_size(&self) -> usize {
        self.as_ref().max_batch_size()
    }

    fn evaluate(&self, batch: &EvalBatch) -> Result<Vec<EvalOutput>, EvalError> {
        self.as_ref().evaluate(batch)
    }
}

// ---------------------------------------------------------------------------
// UniformEvaluator — no-NN mode
// ---------------------------------------------------------------------------

/// Uniform priors over legal moves, zero values. The no-network mode: search
/// degrades to visit-count-driven exploration.
pub struct UniformEvaluator {
    input_dim: usize,
}

impl UniformEvaluator {
    pub fn new(input_dim: usize) -> Self {
        Self { input_dim }
    }
}

impl BatchedEvaluator for UniformEvaluator {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn max_batch_size(&self) -> usize {
        usize::MAX
    }

    fn evaluate(&self, batch: &EvalBatch) -> Result<Vec<EvalOutput>, EvalError> {
        if batch.dim() != self.input_dim {
            return Err(EvalError::ShapeMismatch {
                expected: self.input_dim,
                got: batch.dim(),
            });
        }
        Ok((0..batch.len())
            .map(|i| {
                let legal = batch.moves_of(i);
                let probs = vec![1.0f32; legal.len()];
                EvalOutput {
                    win: 0.0,
                    loss: 0.0,
                    policy: CompressedPolicy::from_probs(legal, &probs),
                    moves_left: 0.0,
                    value_uncertainty: 0.0,
                    policy_uncertainty: 0.0,
                    secondary_value: 0.0,
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::prior_to_f32;
    use crate::test_util::Takeaway;

    #[test]
    fn batch_push_and_slice() {
        let pos_a = Takeaway::new(7);
        let pos_b = Takeaway::new(2);
        let mut batch = EvalBatch::new(pos_a.encoded_len());

        assert_eq!(batch.push(&pos_a), 0);
        assert_eq!(batch.push(&pos_b), 1);
        assert_eq!(batch.len(), 2);

        // Counter 7 → takes 1..3; counter 2 → takes 1..2.
        assert_eq!(batch.moves_of(0), &[1, 2, 3]);
        assert_eq!(batch.moves_of(1), &[1, 2]);
        assert_eq!(batch.hash(0), pos_a.hash());
        assert_ne!(batch.hash(0), batch.hash(1));
        assert_eq!(batch.planes().len(), 2 * batch.dim());
    }

    #[test]
    fn batch_copy_entry() {
        let pos = Takeaway::new(5);
        let mut batch = EvalBatch::new(pos.encoded_len());
        batch.push(&pos);

        let mut other = EvalBatch::new(batch.dim());
        other.push_entry_from(&batch, 0);
        assert_eq!(other.len(), 1);
        assert_eq!(other.moves_of(0), batch.moves_of(0));
        assert_eq!(other.hash(0), batch.hash(0));
        assert_eq!(other.entry_planes(0), batch.entry_planes(0));
    }

    #[test]
    fn uniform_evaluator_priors() {
        let pos = Takeaway::new(9);
        let mut batch = EvalBatch::new(pos.encoded_len());
        batch.push(&pos);

        let eval = UniformEvaluator::new(pos.encoded_len());
        let out = eval.evaluate(&batch).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].q(), 0.0);

        let legal = batch.moves_of(0);
        let mut priors = vec![0u16; legal.len()];
        out[0].policy.expand_into(legal, &mut priors);
        for &q in &priors {
            assert!((prior_to_f32(q) - 1.0 / 3.0).abs() < 1e-3);
        }
    }

    #[test]
    fn uniform_evaluator_shape_mismatch() {
        let pos = Takeaway::new(9);
        let mut batch = EvalBatch::new(pos.encoded_len());
        batch.push(&pos);

        let eval = UniformEvaluator::new(pos.encoded_len() + 1);
        assert!(matches!(
            eval.evaluate(&batch),
            Err(EvalError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn policy_lease_release() {
        let out = EvalOutput {
            win: 0.6,
            loss: 0.2,
            policy: CompressedPolicy::from_probs(&[1, 2], &[0.5, 0.5]),
            moves_left: 12.0,
            value_uncertainty: 0.1,
            policy_uncertainty: 0.2,
            secondary_value: 0.0,
        };
        assert!((out.q() - 0.4).abs() < 1e-6);

        let (values, lease) = out.into_parts();
        assert!((values.q() - 0.4).abs() < 1e-6);
        let policy = lease.release();
        assert_eq!(policy.len(), 2);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "policy lease dropped without release")]
    fn policy_lease_drop_unreleased_panics() {
        let out = EvalOutput {
            win: 0.0,
            loss: 0.0,
            policy: CompressedPolicy::from_probs(&[1], &[1.0]),
            moves_left: 0.0,
            value_uncertainty: 0.0,
            policy_uncertainty: 0.0,
            secondary_value: 0.0,
        };
        let (_values, lease) = out.into_parts();
        drop(lease);
    }
}
