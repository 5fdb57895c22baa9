use std::collections::HashMap;

use tracing::trace;

use crate::backend::{EvalBatch, EvalOutput};
use crate::backup::backup;
use crate::config::SearchConfig;
use crate::node::{NodeIdx, NodeStore};
use crate::policy::{apply_temperature, prior_to_f32, quantize_exact};
use crate::position::{PositionHash, PositionOps};
use crate::select::{revert_virtual_loss, DescentOutcome};

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// A claimed leaf waiting on the evaluator, plus any same-cycle twins that
/// resolved to the same position and ride on its result.
pub(crate) struct PendingLeaf {
    pub path: Vec<NodeIdx>,
    pub leaf: NodeIdx,
    pub batch_slot: usize,
    pub links: Vec<LinkedLeaf>,
}

pub(crate) struct LinkedLeaf {
    pub path: Vec<NodeIdx>,
    pub leaf: NodeIdx,
}

/// Output of classification: the evaluation batch and the leaves it feeds.
/// Terminals and transposition hits were already backed up during
/// classification and do not appear here.
pub(crate) struct CyclePlan {
    pub pending: Vec<PendingLeaf>,
    pub batch: EvalBatch,
}

/// What one classification pass did, for the driver's statistics.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct CycleTally {
    pub terminals: usize,
    pub table_hits: usize,
    pub collisions: usize,
    pub dedup_links: usize,
    pub deferred: usize,
    pub stopped: bool,
    pub out_of_capacity: bool,
}

impl CycleTally {
    /// Descents that produced a backup or a batch entry this cycle.
    pub fn productive(&self, batched: usize) -> usize {
        self.terminals + self.table_hits + self.dedup_links + batched
    }
}

// ---------------------------------------------------------------------------
// classify — outcomes to batch + immediate backups
// ---------------------------------------------------------------------------

/// Sort descent outcomes into immediate work and evaluator work.
///
/// Terminals back up their fixed value on the spot. Transposition hits copy
/// value and policy from the authoritative node and back up. Fresh leaves are
/// deduplicated by position hash — the first becomes the batch entry, twins
/// are linked — and appended to the batch until `max_batch_size`; the
/// overflow is released back to the tree for the next cycle.
pub(crate) fn classify<P: PositionOps>(
    store: &NodeStore,
    config: &SearchConfig,
    input_dim: usize,
    outcomes: Vec<DescentOutcome<P>>,
) -> (CyclePlan, CycleTally) {
    let mut plan = CyclePlan {
        pending: Vec::new(),
        batch: EvalBatch::new(input_dim),
    };
    let mut tally = CycleTally::default();
    let mut primaries: HashMap<PositionHash, usize> = HashMap::new();

    for outcome in outcomes {
        match outcome {
            DescentOutcome::Terminal { path, leaf, status } => {
                debug_assert_eq!(store.node(leaf).terminal_status(), status);
                backup(store, &path, status.value(), 0.0);
                tally.terminals += 1;
            }
            DescentOutcome::TableHit { path, leaf, source } => {
                if copy_from_source(store, leaf, source) {
                    let src = store.node(source).stats();
                    backup(store, &path, src.q(), src.moves_left());
                    tally.table_hits += 1;
                } else {
                    // Row arena exhausted while copying.
                    abandon_leaf(store, &path, leaf);
                    tally.out_of_capacity = true;
                }
            }
            DescentOutcome::NeedsEval { path, leaf, position } => {
                let hash = store.node(leaf).hash();
                if let Some(&slot) = primaries.get(&hash) {
                    plan.pending[slot].links.push(LinkedLeaf { path, leaf });
                    tally.dedup_links += 1;
                } else if plan.batch.len() >= config.max_batch_size {
                    abandon_leaf(store, &path, leaf);
                    tally.deferred += 1;
                } else {
                    let batch_slot = plan.batch.push(&position);
                    primaries.insert(hash, plan.pending.len());
                    plan.pending.push(PendingLeaf {
                        path,
                        leaf,
                        batch_slot,
                        links: Vec::new(),
                    });
                }
            }
            DescentOutcome::Collision => tally.collisions += 1,
            DescentOutcome::OutOfNodes => tally.out_of_capacity = true,
            DescentOutcome::Stopped => tally.stopped = true,
        }
    }

    trace!(
        batched = plan.batch.len(),
        terminals = tally.terminals,
        table_hits = tally.table_hits,
        links = tally.dedup_links,
        collisions = tally.collisions,
        deferred = tally.deferred,
        "cycle classified"
    );
    (plan, tally)
}

/// Give an evaluated leaf a child row copied from its transposition source:
/// same moves, same priors, fresh unexpanded children (visit statistics stay
/// independent per subtree).
fn copy_from_source(store: &NodeStore, leaf: NodeIdx, source: NodeIdx) -> bool {
    let src_node = store.node(source);
    let Some((src_row, count)) = src_node.children() else {
        debug_assert!(false, "transposition source must be expanded");
        return false;
    };
    let Some(row) = store.alloc_child_row(count as usize) else {
        return false;
    };
    for i in 0..count as usize {
        let src_slot = store.child_slot(src_row, i);
        store.child_slot(row, i).init(src_slot.mv(), src_slot.prior());
    }
    let node = store.node(leaf);
    node.set_eval_info(
        src_node.value_uncertainty(),
        src_node.policy_uncertainty(),
        src_node.secondary_value(),
    );
    node.publish_children(row, count);
    true
}

fn abandon_leaf(store: &NodeStore, path: &[NodeIdx], leaf: NodeIdx) {
    store.node(leaf).cancel_expansion();
    revert_virtual_loss(store, path);
}

// ---------------------------------------------------------------------------
// apply — materialise evaluator results
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ApplyTally {
    pub evaluated: usize,
    pub linked: usize,
}

/// Arena ran out while materialising results; the cycle was unwound.
pub(crate) struct CapacityExhausted;

/// Write evaluator results into the tree: build each primary's child row from
/// its compressed policy (with the softmax temperature applied), publish,
/// register the position in the transposition index, back up — then give
/// every linked twin a copy of the row and the same backup.
pub(crate) fn apply(
    store: &NodeStore,
    config: &SearchConfig,
    plan: CyclePlan,
    results: Vec<EvalOutput>,
) -> Result<ApplyTally, CapacityExhausted> {
    let CyclePlan { pending, batch } = plan;
    debug_assert_eq!(results.len(), batch.len());
    let mut tally = ApplyTally::default();
    let mut pending = pending.into_iter();

    while let Some(entry) = pending.next() {
        let out = results[entry.batch_slot];
        let (values, lease) = out.into_parts();
        let legal = batch.moves_of(entry.batch_slot);
        debug_assert!(!legal.is_empty(), "non-terminal leaf with no legal moves");

        let Some(row) = store.alloc_child_row(legal.len()) else {
            lease.discard();
            abandon_leaf(store, &entry.path, entry.leaf);
            for link in entry.links {
                abandon_leaf(store, &link.path, link.leaf);
            }
            unwind(store, pending);
            return Err(CapacityExhausted);
        };

        // Expand the compressed policy over the legal moves, reshaped by the
        // softmax temperature.
        let policy = lease.release();
        let mut priors = vec![0u16; legal.len()];
        policy.expand_into(legal, &mut priors);
        if (config.policy_softmax_temperature - 1.0).abs() > 1e-6 {
            let mut probs: Vec<f32> = priors.iter().map(|&q| prior_to_f32(q)).collect();
            apply_temperature(&mut probs, config.policy_softmax_temperature);
            priors = quantize_exact(&probs);
        }
        for (i, (&mv, &prior)) in legal.iter().zip(priors.iter()).enumerate() {
            store.child_slot(row, i).init(mv, prior);
        }

        let node = store.node(entry.leaf);
        node.set_eval_info(
            values.value_uncertainty,
            values.policy_uncertainty,
            values.secondary_value,
        );
        node.publish_children(row, legal.len() as u16);
        store.transposition_insert(batch.hash(entry.batch_slot), entry.leaf);

        backup(store, &entry.path, values.q(), values.moves_left);
        tally.evaluated += 1;

        // Twins share the evaluation; their subtrees stay independent.
        let mut links = entry.links.into_iter();
        while let Some(link) = links.next() {
            let Some(link_row) = store.alloc_child_row(legal.len()) else {
                abandon_leaf(store, &link.path, link.leaf);
                for rest in links {
                    abandon_leaf(store, &rest.path, rest.leaf);
                }
                unwind(store, pending);
                return Err(CapacityExhausted);
            };
            for i in 0..legal.len() {
                let src = store.child_slot(row, i);
                store.child_slot(link_row, i).init(src.mv(), src.prior());
            }
            let link_node = store.node(link.leaf);
            link_node.set_eval_info(
                values.value_uncertainty,
                values.policy_uncertainty,
                values.secondary_value,
            );
            link_node.publish_children(link_row, legal.len() as u16);
            backup(store, &link.path, values.q(), values.moves_left);
            tally.linked += 1;
        }
    }

    Ok(tally)
}

/// Undo every claim and virtual loss a plan still holds (evaluator failure,
/// capacity exhaustion, retry shrink). No partial cycle is ever backed up.
pub(crate) fn abort(store: &NodeStore, plan: CyclePlan) {
    unwind(store, plan.pending.into_iter());
}

fn unwind(store: &NodeStore, pending: impl Iterator<Item = PendingLeaf>) {
    for entry in pending {
        abandon_leaf(store, &entry.path, entry.leaf);
        for link in entry.links {
            abandon_leaf(store, &link.path, link.leaf);
        }
    }
}

/// Keep only the first `keep` batch entries of a plan (evaluator retry with
/// a smaller batch); everything else is released back to the tree.
pub(crate) fn shrink(store: &NodeStore, plan: CyclePlan, keep: usize) -> CyclePlan {
    let mut pending = plan.pending;
    let dropped = pending.split_off(keep.min(pending.len()));
    unwind(store, dropped.into_iter());
    let mut batch = plan.batch;
    batch.truncate(keep);
    CyclePlan { pending, batch }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
