use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;
use rand_distr::{Distribution, Gamma};

use crate::config::SearchConfig;
use crate::node::{NodeIdx, NodeStore, STATE_EXPANDED, STATE_EXPANDING, STATE_UNEXPANDED};
use crate::policy::{prior_to_f32, quantize_exact};
use crate::position::{PositionOps, TerminalStatus};

// ---------------------------------------------------------------------------
// DescentOutcome — what happened at the end of one PUCT walk
// ---------------------------------------------------------------------------

/// Result of a single descent. For the first three variants virtual loss is
/// still outstanding on every node of `path` (the backup reverses it); the
/// bare variants have already been cleaned up.
pub(crate) enum DescentOutcome<P> {
    /// Claimed an unexpanded leaf that needs the evaluator.
    NeedsEval {
        path: Vec<NodeIdx>,
        leaf: NodeIdx,
        position: P,
    },
    /// Reached a terminal node; value is fixed by its status.
    Terminal {
        path: Vec<NodeIdx>,
        leaf: NodeIdx,
        status: TerminalStatus,
    },
    /// Claimed leaf whose position already has an authoritative evaluated
    /// node elsewhere in the tree.
    TableHit {
        path: Vec<NodeIdx>,
        leaf: NodeIdx,
        source: NodeIdx,
    },
    /// Another in-flight descent owns the leaf; virtual loss reverted.
    Collision,
    /// Node arena exhausted mid-descent; virtual loss reverted.
    OutOfNodes,
    /// Stop flag observed mid-descent; virtual loss reverted.
    Stopped,
}

/// Reverse the virtual loss a descent left on `path`.
pub(crate) fn revert_virtual_loss(store: &NodeStore, path: &[NodeIdx]) {
    for &idx in path {
        store.node(idx).remove_virtual_loss();
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// PUCT descent engine. One instance per worker; all state it touches lives
/// in the shared store, so instances are cheap and independent.
pub(crate) struct Selector<'a, P: PositionOps> {
    store: &'a NodeStore,
    config: &'a SearchConfig,
    root: NodeIdx,
    root_position: &'a P,
    stop: &'a AtomicBool,
}

impl<'a, P: PositionOps> Selector<'a, P> {
    pub fn new(
        store: &'a NodeStore,
        config: &'a SearchConfig,
        root: NodeIdx,
        root_position: &'a P,
        stop: &'a AtomicBool,
    ) -> Self {
        Self {
            store,
            config,
            root,
            root_position,
            stop,
        }
    }

    /// Run up to `k` descents. Stops early when the arena overflows or the
    /// stop flag trips; collisions are returned so the driver can adapt its
    /// batch target.
    pub fn collect(&self, k: usize) -> Vec<DescentOutcome<P>> {
        let mut out = Vec::with_capacity(k);
        for _ in 0..k {
            let outcome = self.descend();
            let fatal = matches!(
                &outcome,
                DescentOutcome::OutOfNodes | DescentOutcome::Stopped
            );
            out.push(outcome);
            if fatal {
                break;
            }
        }
        out
    }

    fn descend(&self) -> DescentOutcome<P> {
        let store = self.store;
        let mut position = self.root_position.clone();
        let mut path: Vec<NodeIdx> = Vec::with_capacity(64);
        let mut current = self.root;

        loop {
            if self.stop.load(Ordering::Relaxed) {
                revert_virtual_loss(store, &path);
                return DescentOutcome::Stopped;
            }

            let node = store.node(current);
            node.add_virtual_loss();
            path.push(current);

            let status = node.terminal_status();
            if status.is_terminal() {
                return DescentOutcome::Terminal {
                    path,
                    leaf: current,
                    status,
                };
            }

            match node.expansion_state() {
                STATE_UNEXPANDED => {
                    if !node.try_claim_expansion() {
                        revert_virtual_loss(store, &path);
                        return DescentOutcome::Collision;
                    }
                    // Ours. Check for an already-evaluated twin first.
                    let hash = position.hash();
                    debug_assert_eq!(node.hash(), hash, "hash mismatch on expansion");
                    if let Some(source) = store.transposition_lookup(hash) {
                        if source != current
                            && store.node(source).is_expanded()
                            && store.node(source).visits() >= self.config.transposition_min_visits
                        {
                            return DescentOutcome::TableHit {
                                path,
                                leaf: current,
                                source,
                            };
                        }
                    }
                    return DescentOutcome::NeedsEval {
                        path,
                        leaf: current,
                        position,
                    };
                }
                STATE_EXPANDING => {
                    // The owner is off being evaluated; don't pile on.
                    revert_virtual_loss(store, &path);
                    return DescentOutcome::Collision;
                }
                state => {
                    debug_assert_eq!(state, STATE_EXPANDED);
                    let is_root = current == self.root;
                    let Some(best) = self.select_child(current, is_root) else {
                        // Expanded node with no children is a provider bug.
                        debug_assert!(false, "expanded node without children");
                        revert_virtual_loss(store, &path);
                        return DescentOutcome::Collision;
                    };

                    let (row, _) = node.children().expect("expanded node has a row");
                    let slot = store.child_slot(row, best);
                    let mv = slot.mv();

                    let next = match slot.child() {
                        Some(child) => child,
                        None => {
                            if slot.try_reserve() {
                                // Materialise the child in place.
                                position.make_move(mv);
                                let hash = position.hash();
                                match store.alloc_node(Some(current), mv, hash) {
                                    Some(child) => {
                                        let child_status = position.terminal_status();
                                        if child_status.is_terminal() {
                                            store.node(child).set_terminal(child_status);
                                        }
                                        slot.publish_child(child);
                                        current = child;
                                        continue;
                                    }
                                    None => {
                                        slot.cancel_reserve();
                                        revert_virtual_loss(store, &path);
                                        return DescentOutcome::OutOfNodes;
                                    }
                                }
                            }
                            // Lost the reservation race; wait for the winner.
                            match slot.wait_for_child() {
                                Some(child) => child,
                                None => {
                                    revert_virtual_loss(store, &path);
                                    return DescentOutcome::Collision;
                                }
                            }
                        }
                    };

                    position.make_move(mv);
                    debug_assert_eq!(
                        store.node(next).hash(),
                        position.hash(),
                        "child node does not match the position reached by its move"
                    );
                    current = next;
                }
            }
        }
    }

    /// PUCT argmax over the children of `parent`. Ties break toward the
    /// lower move index (earlier row entry).
    fn select_child(&self, parent: NodeIdx, is_root: bool) -> Option<usize> {
        let store = self.store;
        let node = store.node(parent);
        let (row, count) = node.children()?;
        if count == 0 {
            return None;
        }

        let vlpv = self.config.virtual_loss_per_visit;
        let stats = node.stats();
        let n_eff_parent = stats.n + node.virtual_loss() * vlpv;

        // Prior mass of children that have real visits, for the FPU penalty.
        let mut visited_mass = 0.0f32;
        for i in 0..count as usize {
            let slot = store.child_slot(row, i);
            if let Some(child) = slot.child() {
                if store.node(child).visits() > 0 {
                    visited_mass += prior_to_f32(slot.prior());
                }
            }
        }
        let fpu = stats.q() - self.config.fpu_reduction(is_root) * visited_mass.sqrt();

        let cpuct = self.config.cpuct(n_eff_parent, is_root);
        let u_scale = cpuct * (n_eff_parent.max(1) as f32).sqrt();

        let mut best = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for i in 0..count as usize {
            let slot = store.child_slot(row, i);
            let prior = prior_to_f32(slot.prior());

            let (q, n_eff_child) = match slot.child() {
                Some(child) => {
                    let cs = store.node(child).stats();
                    let vl = store.node(child).virtual_loss() * vlpv;
                    let n_eff = cs.n + vl;
                    if n_eff == 0 {
                        (fpu, 0)
                    } else {
                        // Child sums are from the child's side to move;
                        // negate for the parent and charge −1 per in-flight
                        // descent.
                        ((-cs.value_sum - vl as f32) / n_eff as f32, n_eff)
                    }
                }
                None => (fpu, 0),
            };

            let score = q + u_scale * prior / (1.0 + n_eff_child as f32);
            if score > best_score {
                best_score = score;
                best = i;
            }
        }
        Some(best)
    }
}

// ---------------------------------------------------------------------------
// Root noise
// ---------------------------------------------------------------------------

/// Mix Dirichlet noise into the root priors, re-quantising exactly so the
/// row still sums to one.
pub(crate) fn apply_root_noise<R: Rng>(
    store: &NodeStore,
    root: NodeIdx,
    config: &SearchConfig,
    rng: &mut R,
) {
    let epsilon = config.dirichlet_noise_epsilon;
    if epsilon <= 0.0 {
        return;
    }
    let Some((row, count)) = store.node(root).children() else {
        return;
    };
    let n = count as usize;
    if n == 0 {
        return;
    }

    let gamma = match Gamma::new(config.dirichlet_noise_alpha as f64, 1.0) {
        Ok(g) => g,
        Err(_) => return,
    };
    let mut noise: Vec<f32> = (0..n).map(|_| gamma.sample(rng) as f32).collect();
    let sum: f32 = noise.iter().sum();
    if sum > 0.0 {
        for x in noise.iter_mut() {
            *x /= sum;
        }
    } else {
        noise.fill(1.0 / n as f32);
    }

    let mixed: Vec<f32> = (0..n)
        .map(|i| {
            let p = prior_to_f32(store.child_slot(row, i).prior());
            (1.0 - epsilon) * p + epsilon * noise[i]
        })
        .collect();
    let quantised = quantize_exact(&mixed);
    for (i, q) in quantised.into_iter().enumerate() {
        store.child_slot(row, i).set_prior(q);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
