use crate::position::EncodedMove;

/// Fixed-point denominator for stored priors: 65535 == probability 1.0.
pub const PRIOR_ONE: u16 = u16::MAX;

/// Entries kept verbatim in a compressed policy. Chosen so the struct stays
/// within a single cache line; everything past the top 14 moves is residual.
pub const POLICY_TOP_K: usize = 14;

// ---------------------------------------------------------------------------
// CompressedPolicy
// ---------------------------------------------------------------------------

/// Top-K slice of a policy head's output.
///
/// Stores the K most probable legal moves with fixed-point probabilities; the
/// leftover mass is spread uniformly over the remaining legal moves when the
/// policy is expanded into a child row. Entries are ordered by descending
/// probability.
#[derive(Clone, Copy, Debug)]
pub struct CompressedPolicy {
    moves: [EncodedMove; POLICY_TOP_K],
    probs: [u16; POLICY_TOP_K],
    len: u8,
}

impl CompressedPolicy {
    /// Compress `probs` (aligned with `moves`, not necessarily normalised).
    pub fn from_probs(moves: &[EncodedMove], probs: &[f32]) -> Self {
        debug_assert_eq!(moves.len(), probs.len());
        let sum: f32 = probs.iter().copied().filter(|p| p.is_finite() && *p > 0.0).sum();

        // Degenerate policy → uniform.
        if sum <= 0.0 {
            let uniform = vec![1.0f32; moves.len()];
            return Self::from_positive_probs(moves, &uniform, moves.len() as f32);
        }
        Self::from_positive_probs(moves, probs, sum)
    }

    fn from_positive_probs(moves: &[EncodedMove], probs: &[f32], sum: f32) -> Self {
        // Rank move indices by descending probability; ties keep move order.
        let mut order: Vec<usize> = (0..moves.len()).collect();
        order.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(std::cmp::Ordering::Equal));
        order.truncate(POLICY_TOP_K);

        let mut out = Self {
            moves: [0; POLICY_TOP_K],
            probs: [0; POLICY_TOP_K],
            len: order.len() as u8,
        };

        let mut budget = PRIOR_ONE as u32;
        for (slot, &i) in order.iter().enumerate() {
            let p = (probs[i].max(0.0) / sum).min(1.0);
            let q = ((p * PRIOR_ONE as f32).round() as u32).min(budget);
            out.moves[slot] = moves[i];
            out.probs[slot] = q as u16;
            budget -= q;
        }

        // When every legal move fits, rounding drift must not leak into a
        // phantom residual: give the remainder to the top entry.
        if order.len() == moves.len() && budget > 0 && out.len > 0 {
            out.probs[0] = (out.probs[0] as u32 + budget).min(PRIOR_ONE as u32) as u16;
        }
        out
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn entry(&self, i: usize) -> (EncodedMove, u16) {
        debug_assert!(i < self.len());
        (self.moves[i], self.probs[i])
    }

    fn listed(&self, mv: EncodedMove) -> Option<u16> {
        self.moves[..self.len()]
            .iter()
            .position(|&m| m == mv)
            .map(|i| self.probs[i])
    }

    /// Expand into fixed-point priors for the full legal move list.
    ///
    /// Listed moves take their stored probability; the residual mass is
    /// spread uniformly (to the unit) over unlisted moves, so the row sums
    /// to exactly `PRIOR_ONE`.
    pub fn expand_into(&self, legal: &[EncodedMove], out: &mut [u16]) {
        debug_assert_eq!(legal.len(), out.len());

        let mut listed_sum = 0u32;
        let mut unlisted = 0usize;
        for (i, &mv) in legal.iter().enumerate() {
            match self.listed(mv) {
                Some(q) => {
                    out[i] = q;
                    listed_sum += q as u32;
                }
                None => {
                    out[i] = 0;
                    unlisted += 1;
                }
            }
        }

        let residual = (PRIOR_ONE as u32).saturating_sub(listed_sum);
        if unlisted > 0 {
            let base = (residual / unlisted as u32) as u16;
            let mut extra = (residual % unlisted as u32) as usize;
            for (i, &mv) in legal.iter().enumerate() {
                if self.listed(mv).is_none() {
                    out[i] = base + if extra > 0 { extra -= 1; 1 } else { 0 };
                }
            }
        } else if residual > 0 {
            // All moves listed but quantisation left mass behind.
            if let Some(max) = out.iter_mut().max_by_key(|q| **q) {
                *max = (*max as u32 + residual).min(PRIOR_ONE as u32) as u16;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

pub fn prior_to_f32(q: u16) -> f32 {
    q as f32 / PRIOR_ONE as f32
}

/// Softmax over raw logits with a temperature, in place.
pub fn softmax(logits: &mut [f32], temperature: f32) {
    if logits.is_empty() {
        return;
    }
    let t = temperature.max(1e-3);
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for l in logits.iter_mut() {
        *l = ((*l - max) / t).exp();
        sum += *l;
    }
    if sum > 0.0 {
        for l in logits.iter_mut() {
            *l /= sum;
        }
    }
}

/// Sharpen or flatten an already-normalised distribution: p_i^(1/T), renormalised.
pub fn apply_temperature(probs: &mut [f32], temperature: f32) {
    if (temperature - 1.0).abs() < 1e-6 || probs.is_empty() {
        return;
    }
    let inv_t = 1.0 / temperature.max(1e-3);
    let mut sum = 0.0f32;
    for p in probs.iter_mut() {
        *p = p.max(0.0).powf(inv_t);
        sum += *p;
    }
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
}

/// Quantise non-negative weights to fixed point so they sum to exactly
/// `PRIOR_ONE` (largest-remainder rounding). Used when priors are rewritten
/// wholesale, e.g. mixing root noise.
pub fn quantize_exact(weights: &[f32]) -> Vec<u16> {
    let sum: f32 = weights.iter().copied().filter(|w| *w > 0.0).sum();
    let n = weights.len();
    if n == 0 {
        return Vec::new();
    }
    if sum <= 0.0 {
        // Uniform fallback.
        let base = PRIOR_ONE as u32 / n as u32;
        let extra = PRIOR_ONE as u32 % n as u32;
        return (0..n)
            .map(|i| (base + if (i as u32) < extra { 1 } else { 0 }) as u16)
            .collect();
    }

    let scaled: Vec<f32> = weights
        .iter()
        .map(|w| w.max(0.0) / sum * PRIOR_ONE as f32)
        .collect();
    let mut out: Vec<u16> = scaled.iter().map(|s| *s as u16).collect();
    let floor_sum: u32 = out.iter().map(|q| *q as u32).sum();
    let mut remainder = (PRIOR_ONE as u32).saturating_sub(floor_sum) as usize;

    // Hand leftover units to the largest fractional parts.
    let mut frac_order: Vec<usize> = (0..n).collect();
    frac_order.sort_by(|&a, &b| {
        let fa = scaled[a] - scaled[a].floor();
        let fb = scaled[b] - scaled[b].floor();
        fb.partial_cmp(&fa).unwrap_or(std::cmp::Ordering::Equal)
    });
    for &i in frac_order.iter() {
        if remainder == 0 {
            break;
        }
        out[i] += 1;
        remainder -= 1;
    }
    // Float drift can leave a unit or two beyond one-per-entry.
    let mut i = 0;
    while remainder > 0 {
        out[i % n] += 1;
        remainder -= 1;
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_policy_fits_a_cache_line() {
        assert!(std::mem::size_of::<CompressedPolicy>() <= 64);
    }

    #[test]
    fn expand_round_trips_small_policy() {
        let moves: Vec<EncodedMove> = vec![10, 20, 30];
        let probs = vec![0.5, 0.3, 0.2];
        let cp = CompressedPolicy::from_probs(&moves, &probs);

        let mut out = vec![0u16; 3];
        cp.expand_into(&moves, &mut out);

        let total: u32 = out.iter().map(|q| *q as u32).sum();
        assert_eq!(total, PRIOR_ONE as u32);
        assert!((prior_to_f32(out[0]) - 0.5).abs() < 1e-3);
        assert!((prior_to_f32(out[1]) - 0.3).abs() < 1e-3);
        assert!((prior_to_f32(out[2]) - 0.2).abs() < 1e-3);
    }

    #[test]
    fn residual_spread_over_unlisted_moves() {
        // 20 moves, only top 14 listed; the remaining 6 share the residual.
        let moves: Vec<EncodedMove> = (0..20).collect();
        let mut probs = vec![0.01f32; 20];
        for p in probs.iter_mut().take(14) {
            *p = 0.07;
        }
        let cp = CompressedPolicy::from_probs(&moves, &probs);
        assert_eq!(cp.len(), POLICY_TOP_K);

        let mut out = vec![0u16; 20];
        cp.expand_into(&moves, &mut out);

        let total: u32 = out.iter().map(|q| *q as u32).sum();
        assert_eq!(total, PRIOR_ONE as u32);
        // Every unlisted move got a nonzero share.
        for &q in &out {
            assert!(q > 0);
        }
    }

    #[test]
    fn zero_policy_degrades_to_uniform() {
        let moves: Vec<EncodedMove> = vec![1, 2, 3, 4];
        let cp = CompressedPolicy::from_probs(&moves, &[0.0; 4]);
        let mut out = vec![0u16; 4];
        cp.expand_into(&moves, &mut out);
        for &q in &out {
            assert!((prior_to_f32(q) - 0.25).abs() < 1e-3);
        }
    }

    #[test]
    fn softmax_normalises() {
        let mut logits = vec![1.0, 2.0, 3.0];
        softmax(&mut logits, 1.0);
        let sum: f32 = logits.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(logits[2] > logits[1] && logits[1] > logits[0]);
    }

    #[test]
    fn temperature_sharpens() {
        let mut cold = vec![0.6, 0.4];
        apply_temperature(&mut cold, 0.5);
        assert!(cold[0] > 0.6, "low temperature should sharpen");

        let mut hot = vec![0.6, 0.4];
        apply_temperature(&mut hot, 2.0);
        assert!(hot[0] < 0.6, "high temperature should flatten");
    }

    #[test]
    fn quantize_exact_sums_to_one() {
        for weights in [
            vec![0.1f32, 0.2, 0.7],
            vec![1.0; 37],
            vec![0.0, 0.0, 1.0],
            vec![0.333, 0.333, 0.334],
        ] {
            let q = quantize_exact(&weights);
            let total: u32 = q.iter().map(|v| *v as u32).sum();
            assert_eq!(total, PRIOR_ONE as u32, "weights {weights:?}");
        }
    }

    #[test]
    fn quantize_exact_zero_weights_uniform() {
        let q = quantize_exact(&[0.0; 5]);
        let total: u32 = q.iter().map(|v| *v as u32).sum();
        assert_eq!(total, PRIOR_ONE as u32);
    }
}
