use crate::node::{NodeIdx, NodeStore};

/// Propagate a leaf evaluation along `path` (root-first, leaf last).
///
/// `leaf_value` is from the leaf's side to move and alternates sign on each
/// step up; `leaf_moves_left` grows by one per ply. Every node gets its
/// (N, Σv, Σv², Σml) tuple updated under its stat lock, then its virtual loss
/// removed — the release decrement is what publishes the new sums to later
/// selectors.
///
/// The caller must have published the leaf's child row (if any) before
/// backing up; backup itself never touches rows.
pub(crate) fn backup(store: &NodeStore, path: &[NodeIdx], leaf_value: f32, leaf_moves_left: f32) {
    debug_assert!(leaf_value.abs() <= 1.0 + 1e-5, "value outside [-1, 1]");

    let mut value = leaf_value;
    let mut moves_left = leaf_moves_left;
    for &idx in path.iter().rev() {
        let node = store.node(idx);
        node.add_sample(value, moves_left);
        node.remove_virtual_loss();
        value = -value;
        moves_left += 1.0;
    }
}
