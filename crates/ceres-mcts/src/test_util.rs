//! Deterministic fixtures for search tests.
//!
//! Chess lives behind `PositionOps`, so tests run on a subtraction game
//! instead: a counter, each move takes 1–3, and the player facing zero has
//! lost ("mated"). An optional draw floor turns landing exactly on the floor
//! value into an insufficient-material-style terminal draw — a trap a search
//! must learn to step around. The game is tiny but exercises every path the
//! search has: forced wins, draw traps, transpositions (different take
//! orders reaching the same counter with the same side to move), and
//! immediate terminal roots.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::backend::{BatchedEvaluator, EvalBatch, EvalError, EvalOutput};
use crate::policy::CompressedPolicy;
use crate::position::{EncodedMove, PositionHash, PositionOps, TerminalStatus};

// ---------------------------------------------------------------------------
// Takeaway — the test game
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Takeaway {
    counter: u32,
    side: u8,
    draw_at: Option<u32>,
}

impl Takeaway {
    pub fn new(counter: u32) -> Self {
        Self {
            counter,
            side: 0,
            draw_at: None,
        }
    }

    /// Landing exactly on `floor` is a terminal draw; passing it is fine.
    pub fn with_draw_floor(counter: u32, floor: u32) -> Self {
        debug_assert!(floor <= counter);
        Self {
            counter,
            side: 0,
            draw_at: Some(floor),
        }
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

impl PositionOps for Takeaway {
    fn legal_moves(&self, out: &mut Vec<EncodedMove>) {
        if self.terminal_status().is_terminal() {
            return;
        }
        for take in 1..=3u32 {
            if take <= self.counter {
                out.push(take as EncodedMove);
            }
        }
    }

    fn make_move(&mut self, mv: EncodedMove) {
        debug_assert!((1..=3).contains(&mv));
        debug_assert!(mv as u32 <= self.counter);
        self.counter -= mv as u32;
        self.side ^= 1;
    }

    fn terminal_status(&self) -> TerminalStatus {
        if let Some(floor) = self.draw_at {
            if self.counter == floor {
                return TerminalStatus::DrawInsufficient;
            }
        }
        if self.counter == 0 {
            TerminalStatus::Checkmate
        } else {
            TerminalStatus::NotTerminal
        }
    }

    fn hash(&self) -> PositionHash {
        let seed = ((self.counter as u64) << 1) | self.side as u64;
        let lo = splitmix64(seed);
        let hi = (splitmix64(seed ^ 0x5851_F42D_4C95_7F2D) >> 32) as u32;
        PositionHash::new(lo, hi)
    }

    fn encoded_len(&self) -> usize {
        3
    }

    fn encode_into(&self, buf: &mut [f32]) {
        buf[0] = self.counter as f32;
        buf[1] = self.side as f32;
        buf[2] = self.draw_at.map_or(-1.0, |f| f as f32);
    }
}

// ---------------------------------------------------------------------------
// Evaluators
// ---------------------------------------------------------------------------

/// Uniform policy, fixed win/loss probabilities. Exercises backup with
/// non-zero leaf values, which the uniform evaluator can't.
pub(crate) struct ConstantEvaluator {
    pub win: f32,
    pub loss: f32,
    pub moves_left: f32,
}

impl BatchedEvaluator for ConstantEvaluator {
    fn input_dim(&self) -> usize {
        3
    }

    fn max_batch_size(&self) -> usize {
        usize::MAX
    }

    fn evaluate(&self, batch: &EvalBatch) -> Result<Vec<EvalOutput>, EvalError> {
        Ok((0..batch.len())
            .map(|i| {
                let legal = batch.moves_of(i);
                EvalOutput {
                    win: self.win,
                    loss: self.loss,
                    policy: CompressedPolicy::from_probs(legal, &vec![1.0; legal.len()]),
                    moves_left: self.moves_left,
                    value_uncertainty: 0.0,
                    policy_uncertainty: 0.0,
                    secondary_value: 0.0,
                }
            })
            .collect())
    }
}

/// Perfect-play evaluator for Takeaway: counters that are multiples of 4
/// (relative to the floor) are lost for the side to move, and the policy
/// prefers moves that hand the opponent such a counter. Lets small searches
/// converge on the game-theoretic line.
pub(crate) struct OracleEvaluator;

impl OracleEvaluator {
    fn decode(batch: &EvalBatch, i: usize) -> (u32, u32) {
        let planes = batch.entry_planes(i);
        let counter = planes[0] as u32;
        let floor = if planes[2] < 0.0 { 0 } else { planes[2] as u32 };
        (counter, floor)
    }
}

impl BatchedEvaluator for OracleEvaluator {
    fn input_dim(&self) -> usize {
        3
    }

    fn max_batch_size(&self) -> usize {
        usize::MAX
    }

    fn evaluate(&self, batch: &EvalBatch) -> Result<Vec<EvalOutput>, EvalError> {
        Ok((0..batch.len())
            .map(|i| {
                let (counter, floor) = Self::decode(batch, i);
                let losing = counter >= floor && (counter - floor) % 4 == 0;
                let (win, loss) = if losing { (0.05, 0.85) } else { (0.85, 0.05) };

                let legal = batch.moves_of(i);
                let probs: Vec<f32> = legal
                    .iter()
                    .map(|&take| {
                        let after = counter - take as u32;
                        if after >= floor && (after - floor) % 4 == 0 {
                            0.9
                        } else {
                            0.05
                        }
                    })
                    .collect();
                EvalOutput {
                    win,
                    loss,
                    policy: CompressedPolicy::from_probs(legal, &probs),
                    moves_left: counter as f32,
                    value_uncertainty: 0.05,
                    policy_uncertainty: 0.05,
                    secondary_value: 0.0,
                }
            })
            .collect())
    }
}

/// Fails its first `failures` calls with a device error, then delegates to a
/// uniform evaluation. Drives the driver's retry-once-then-stop path.
pub(crate) struct FlakyEvaluator {
    pub failures: usize,
    calls: AtomicUsize,
}

impl FlakyEvaluator {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl BatchedEvaluator for FlakyEvaluator {
    fn input_dim(&self) -> usize {
        3
    }

    fn max_batch_size(&self) -> usize {
        usize::MAX
    }

    fn evaluate(&self, batch: &EvalBatch) -> Result<Vec<EvalOutput>, EvalError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        if call < self.failures {
            return Err(EvalError::Device(format!("injected failure #{call}")));
        }
        ConstantEvaluator {
            win: 0.0,
            loss: 0.0,
            moves_left: 0.0,
        }
        .evaluate(batch)
    }
}

// ---------------------------------------------------------------------------
// Tests for the fixtures themselves
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_moves_shrink_near_zero() {
        let mut out = Vec::new();
        Takeaway::new(10).legal_moves(&mut out);
        assert_eq!(out, vec![1, 2, 3]);

        out.clear();
        Takeaway::new(2).legal_moves(&mut out);
        assert_eq!(out, vec![1, 2]);

        out.clear();
        Takeaway::new(0).legal_moves(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn draw_floor_only_triggers_on_exact_landing() {
        // From 4 with floor 2 all takes are legal; take-2 lands on the floor
        // and draws, take-3 passes below it and play continues.
        let mut out = Vec::new();
        let pos = Takeaway::with_draw_floor(4, 2);
        pos.legal_moves(&mut out);
        assert_eq!(out, vec![1, 2, 3]);

        let mut drawn = pos.clone();
        drawn.make_move(2);
        assert_eq!(drawn.terminal_status(), TerminalStatus::DrawInsufficient);

        let mut past = pos.clone();
        past.make_move(3);
        assert_eq!(past.terminal_status(), TerminalStatus::NotTerminal);
    }

    #[test]
    fn terminal_classification() {
        assert_eq!(Takeaway::new(0).terminal_status(), TerminalStatus::Checkmate);
        assert_eq!(
            Takeaway::with_draw_floor(2, 2).terminal_status(),
            TerminalStatus::DrawInsufficient
        );
        assert_eq!(Takeaway::new(5).terminal_status(), TerminalStatus::NotTerminal);
    }

    #[test]
    fn transposition_orders_share_hashes() {
        // 7 −1−2 and 7 −2−1 reach counter 4 with the same side to move.
        let mut a = Takeaway::new(7);
        a.make_move(1);
        a.make_move(2);
        let mut b = Takeaway::new(7);
        b.make_move(2);
        b.make_move(1);
        assert_eq!(a.hash(), b.hash());

        // Same counter, different side to move → different position.
        let mut c = Takeaway::new(7);
        c.make_move(3);
        assert_eq!(c.counter(), 4);
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn oracle_knows_the_losing_counters() {
        let pos = Takeaway::new(4);
        let mut batch = EvalBatch::new(3);
        batch.push(&pos);
        let out = OracleEvaluator.evaluate(&batch).unwrap();
        assert!(out[0].q() < 0.0, "counter 4 is lost for the side to move");

        let pos = Takeaway::new(3);
        let mut batch = EvalBatch::new(3);
        batch.push(&pos);
        let out = OracleEvaluator.evaluate(&batch).unwrap();
        assert!(out[0].q() > 0.0, "counter 3 is won for the side to move");
    }

    #[test]
    fn flaky_evaluator_recovers() {
        let pos = Takeaway::new(5);
        let mut batch = EvalBatch::new(3);
        batch.push(&pos);

        let eval = FlakyEvaluator::new(1);
        assert!(eval.evaluate(&batch).is_err());
        assert!(eval.evaluate(&batch).is_ok());
        assert_eq!(eval.calls(), 2);
    }
}
