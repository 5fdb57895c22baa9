use tracing::debug;

use crate::config::SearchConfig;
use crate::node::{NodeIdx, NodeStore};
use crate::position::{EncodedMove, PositionHash, PositionOps};

// ---------------------------------------------------------------------------
// SearchTree
// ---------------------------------------------------------------------------

/// Lifecycle manager for the node store and root: bundles the arena, the
/// root index and the externally maintained root position. The search driver
/// operates on the store through the accessors; this type only handles
/// construction, tree reuse and inspection.
pub struct SearchTree<P: PositionOps> {
    store: NodeStore,
    config: SearchConfig,
    root: NodeIdx,
    root_position: P,
    /// A reparent happened; the free list is rebuilt lazily at the start of
    /// the next search.
    pending_rebuild: bool,
}

impl<P: PositionOps> SearchTree<P> {
    pub fn new(position: P, config: SearchConfig) -> Self {
        assert!(config.max_nodes > 0, "max_nodes must be positive");
        let store = NodeStore::new(config.max_nodes, config.child_slot_capacity());
        let root = alloc_root(&store, &position);
        Self {
            store,
            config,
            root,
            root_position: position,
            pending_rebuild: false,
        }
    }

    pub fn root(&self) -> NodeIdx {
        self.root
    }

    pub fn root_position(&self) -> &P {
        &self.root_position
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Play `mv` on the root position. With tree reuse enabled and the
    /// matching child already materialised, the root moves to that child and
    /// its subtree (statistics included) survives; everything else becomes
    /// reclaimable. Returns `true` when the subtree was kept.
    pub fn advance_root(&mut self, mv: EncodedMove) -> bool {
        let mut next = self.root_position.clone();
        next.make_move(mv);

        if self.config.tree_reuse_enabled {
            if let Some(child) = self.find_root_child(mv) {
                debug!(?child, "root advanced into kept subtree");
                self.root = child;
                self.root_position = next;
                self.pending_rebuild = true;
                return true;
            }
        }
        self.reinit(next);
        false
    }

    fn find_root_child(&self, mv: EncodedMove) -> Option<NodeIdx> {
        let (row, count) = self.store.node(self.root).children()?;
        (0..count as usize)
            .map(|i| self.store.child_slot(row, i))
            .find(|slot| slot.mv() == mv)
            .and_then(|slot| slot.child())
    }

    /// Throw the whole tree away and restart from `position`.
    pub fn reinit(&mut self, position: P) {
        self.store.reset();
        self.root = alloc_root(&self.store, &position);
        self.root_position = position;
        self.pending_rebuild = false;
    }

    /// Called by the driver before a search: settle a pending reparent by
    /// rebuilding the free list and the transposition index over the kept
    /// subtree.
    pub(crate) fn prepare_for_search(&mut self) {
        if self.pending_rebuild {
            self.store.rebuild_after_reparent(self.root);
            self.pending_rebuild = false;
        }
    }

    /// Compact debug dump of the reachable tree, on demand only.
    pub fn snapshot(&self) -> TreeSnapshot {
        let mut nodes = Vec::new();
        let mut stack = vec![self.root];
        let mut seen = std::collections::HashSet::new();
        while let Some(idx) = stack.pop() {
            if !seen.insert(idx) {
                continue;
            }
            let node = self.store.node(idx);
            let stats = node.stats();
            nodes.push(NodeSnapshot {
                index: idx.as_u32(),
                hash: node.hash(),
                visits: stats.n,
                value_sum: stats.value_sum,
                num_children: node.num_children(),
            });
            if let Some((row, count)) = node.children() {
                for i in 0..count as usize {
                    if let Some(child) = self.store.child_slot(row, i).child() {
                        stack.push(child);
                    }
                }
            }
        }
        TreeSnapshot { nodes }
    }

    /// Walk the reachable tree and check the quiescence invariants. Panics on
    /// violation; meant for tests and debugging, never the search hot path.
    pub fn check_invariants(&self) {
        let mut stack = vec![self.root];
        let mut seen = std::collections::HashSet::new();
        let mut claimed_children = std::collections::HashSet::new();

        while let Some(idx) = stack.pop() {
            if !seen.insert(idx) {
                panic!("node {idx:?} reachable through two parents");
            }
            let node = self.store.node(idx);
            let stats = node.stats();

            assert_eq!(
                node.virtual_loss(),
                0,
                "outstanding virtual loss on {idx:?} at quiescence"
            );
            assert!(
                stats.q().abs() <= 1.0 + 1e-4,
                "mean value out of range on {idx:?}: {}",
                stats.q()
            );
            if node.terminal_status().is_terminal() {
                assert_eq!(node.num_children(), 0, "terminal {idx:?} has children");
            }

            if let Some((row, count)) = node.children() {
                let mut child_sum = 0u64;
                for i in 0..count as usize {
                    let slot = self.store.child_slot(row, i);
                    if let Some(child) = slot.child() {
                        if !claimed_children.insert(child) {
                            panic!("child {child:?} appears in two rows");
                        }
                        child_sum += self.store.node(child).visits() as u64;
                        stack.push(child);
                    }
                }
                assert_eq!(
                    stats.n as u64,
                    child_sum + 1,
                    "visit bookkeeping broken at {idx:?}: N={} children={}",
                    stats.n,
                    child_sum
                );

                // The authoritative transposition entry for this hash must
                // point at a node with that hash.
                if let Some(authority) = self.store.transposition_lookup(node.hash()) {
                    assert_eq!(
                        self.store.node(authority).hash(),
                        node.hash(),
                        "transposition entry disagrees with node hash"
                    );
                }
            }
        }
    }
}

fn alloc_root<P: PositionOps>(store: &NodeStore, position: &P) -> NodeIdx {
    let root = store
        .alloc_node(None, 0, position.hash())
        .expect("fresh arena cannot be full");
    let status = position.terminal_status();
    if status.is_terminal() {
        store.node(root).set_terminal(status);
    }
    root
}

// ---------------------------------------------------------------------------
// TreeSnapshot
// ---------------------------------------------------------------------------

/// One node of an exported debug snapshot.
#[derive(Clone, Copy, Debug)]
pub struct NodeSnapshot {
    pub index: u32,
    pub hash: PositionHash,
    pub visits: u32,
    pub value_sum: f32,
    pub num_children: u16,
}

#[derive(Clone, Debug)]
pub struct TreeSnapshot {
    pub nodes: Vec<NodeSnapshot>,
}

impl TreeSnapshot {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn total_visits(&self) -> u64 {
        self.nodes.iter().map(|n| n.visits as u64).sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
