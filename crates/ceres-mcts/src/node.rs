use std::ops::Index;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use thread_local::ThreadLocal;

use crate::position::{EncodedMove, PositionHash, TerminalStatus};
use crate::transposition::TranspositionIndex;

// ---------------------------------------------------------------------------
// Indices and sentinels
// ---------------------------------------------------------------------------

/// Typed index into the node arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeIdx(u32);

impl NodeIdx {
    pub(crate) fn new(raw: u32) -> Self {
        debug_assert!(raw < CHILD_RESERVED);
        Self(raw)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Typed index of a child row's first slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RowIdx(u32);

impl RowIdx {
    fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// "No node" marker for parent links.
const NO_NODE: u32 = u32::MAX;

/// Child-slot sentinel: the child has never been materialised.
pub(crate) const CHILD_UNEXPANDED: u32 = u32::MAX;
/// Child-slot sentinel: a selector is materialising the child right now.
pub(crate) const CHILD_RESERVED: u32 = u32::MAX - 1;

/// Expansion lifecycle of a node.
pub(crate) const STATE_UNEXPANDED: u8 = 0;
pub(crate) const STATE_EXPANDING: u8 = 1;
pub(crate) const STATE_EXPANDED: u8 = 2;

/// Spins before a waiter yields the core (expansion races, stat lock).
const SPIN_LIMIT: u32 = 64;

// ---------------------------------------------------------------------------
// StatCell — (N, Σv, Σv², Σml) behind a per-node spin lock
// ---------------------------------------------------------------------------

/// Snapshot of a node's accumulated statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeStats {
    pub n: u32,
    pub value_sum: f32,
    pub value_sq_sum: f32,
    pub moves_left_sum: f32,
}

impl NodeStats {
    /// Mean backed-up value, from this node's side to move. 0 when unvisited.
    pub fn q(&self) -> f32 {
        if self.n == 0 {
            0.0
        } else {
            self.value_sum / self.n as f32
        }
    }

    /// Standard deviation of the backed-up values.
    pub fn q_deviation(&self) -> f32 {
        if self.n == 0 {
            return 0.0;
        }
        let mean = self.q();
        (self.value_sq_sum / self.n as f32 - mean * mean).max(0.0).sqrt()
    }

    pub fn moves_left(&self) -> f32 {
        if self.n == 0 {
            0.0
        } else {
            self.moves_left_sum / self.n as f32
        }
    }
}

/// Visit count and value sums, guarded by a one-byte spin lock so the tuple
/// mutates atomically as required by the backup ordering rules. Contention is
/// rare (distinct descents hit distinct paths), so the lock spins briefly and
/// then yields.
struct StatCell {
    lock: AtomicU8,
    n: AtomicU32,
    value_sum: AtomicU32,
    value_sq_sum: AtomicU32,
    moves_left_sum: AtomicU32,
}

impl StatCell {
    fn empty() -> Self {
        Self {
            lock: AtomicU8::new(0),
            n: AtomicU32::new(0),
            value_sum: AtomicU32::new(0.0f32.to_bits()),
            value_sq_sum: AtomicU32::new(0.0f32.to_bits()),
            moves_left_sum: AtomicU32::new(0.0f32.to_bits()),
        }
    }

    fn acquire(&self) {
        let mut spins = 0u32;
        while self
            .lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins < SPIN_LIMIT {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
                spins = 0;
            }
        }
    }

    fn release(&self) {
        self.lock.store(0, Ordering::Release);
    }

    fn add(&self, value: f32, moves_left: f32) {
        self.acquire();
        self.n.fetch_add(1, Ordering::Relaxed);
        let w = f32::from_bits(self.value_sum.load(Ordering::Relaxed)) + value;
        let sq = f32::from_bits(self.value_sq_sum.load(Ordering::Relaxed)) + value * value;
        let ml = f32::from_bits(self.moves_left_sum.load(Ordering::Relaxed)) + moves_left;
        self.value_sum.store(w.to_bits(), Ordering::Relaxed);
        self.value_sq_sum.store(sq.to_bits(), Ordering::Relaxed);
        self.moves_left_sum.store(ml.to_bits(), Ordering::Relaxed);
        self.release();
    }

    fn read(&self) -> NodeStats {
        self.acquire();
        let out = NodeStats {
            n: self.n.load(Ordering::Relaxed),
            value_sum: f32::from_bits(self.value_sum.load(Ordering::Relaxed)),
            value_sq_sum: f32::from_bits(self.value_sq_sum.load(Ordering::Relaxed)),
            moves_left_sum: f32::from_bits(self.moves_left_sum.load(Ordering::Relaxed)),
        };
        self.release();
        out
    }

    fn visits(&self) -> u32 {
        self.n.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.lock.store(0, Ordering::Relaxed);
        self.n.store(0, Ordering::Relaxed);
        self.value_sum.store(0.0f32.to_bits(), Ordering::Relaxed);
        self.value_sq_sum.store(0.0f32.to_bits(), Ordering::Relaxed);
        self.moves_left_sum.store(0.0f32.to_bits(), Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// NodeRecord — one packed arena slot
// ---------------------------------------------------------------------------

/// One MCTS node. Every mutable field is atomic; a freshly allocated record
/// is private to the allocating thread until its index is published (child
/// slot store with release ordering), so identity fields use relaxed stores.
pub struct NodeRecord {
    hash_lo: AtomicU64,
    hash_hi: AtomicU32,
    parent: AtomicU32,
    child_row: AtomicU32,
    stats: StatCell,
    vloss: AtomicU32,
    value_unc: AtomicU32,
    policy_unc: AtomicU32,
    secondary: AtomicU32,
    num_children: AtomicU16,
    mv: AtomicU16,
    state: AtomicU8,
    terminal: AtomicU8,
}

impl NodeRecord {
    fn empty() -> Self {
        Self {
            hash_lo: AtomicU64::new(0),
            hash_hi: AtomicU32::new(0),
            parent: AtomicU32::new(NO_NODE),
            child_row: AtomicU32::new(0),
            stats: StatCell::empty(),
            vloss: AtomicU32::new(0),
            value_unc: AtomicU32::new(0.0f32.to_bits()),
            policy_unc: AtomicU32::new(0.0f32.to_bits()),
            secondary: AtomicU32::new(0.0f32.to_bits()),
            num_children: AtomicU16::new(0),
            mv: AtomicU16::new(0),
            state: AtomicU8::new(STATE_UNEXPANDED),
            terminal: AtomicU8::new(TerminalStatus::NotTerminal as u8),
        }
    }

    fn init(&self, parent: u32, mv: EncodedMove, hash: PositionHash) {
        self.hash_lo.store(hash.lo, Ordering::Relaxed);
        self.hash_hi.store(hash.hi, Ordering::Relaxed);
        self.parent.store(parent, Ordering::Relaxed);
        self.child_row.store(0, Ordering::Relaxed);
        self.stats.reset();
        self.vloss.store(0, Ordering::Relaxed);
        self.value_unc.store(0.0f32.to_bits(), Ordering::Relaxed);
        self.policy_unc.store(0.0f32.to_bits(), Ordering::Relaxed);
        self.secondary.store(0.0f32.to_bits(), Ordering::Relaxed);
        self.num_children.store(0, Ordering::Relaxed);
        self.mv.store(mv, Ordering::Relaxed);
        self.state.store(STATE_UNEXPANDED, Ordering::Relaxed);
        self.terminal
            .store(TerminalStatus::NotTerminal as u8, Ordering::Relaxed);
    }

    // --- Identity ---

    pub fn hash(&self) -> PositionHash {
        PositionHash::new(
            self.hash_lo.load(Ordering::Relaxed),
            self.hash_hi.load(Ordering::Relaxed),
        )
    }

    pub fn parent(&self) -> Option<NodeIdx> {
        match self.parent.load(Ordering::Relaxed) {
            NO_NODE => None,
            raw => Some(NodeIdx(raw)),
        }
    }

    pub(crate) fn clear_parent(&self) {
        self.parent.store(NO_NODE, Ordering::Relaxed);
    }

    /// Encoded move that led from the parent to this node.
    pub fn move_from_parent(&self) -> EncodedMove {
        self.mv.load(Ordering::Relaxed)
    }

    // --- Expansion lifecycle ---

    pub(crate) fn expansion_state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn is_expanded(&self) -> bool {
        self.expansion_state() == STATE_EXPANDED
    }

    /// CAS Unexpanded → Expanding. Exactly one descent per cycle wins; losers
    /// treat the leaf as a collision.
    pub(crate) fn try_claim_expansion(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_UNEXPANDED,
                STATE_EXPANDING,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Roll an unfinished claim back (collision cleanup, aborted cycles).
    pub(crate) fn cancel_expansion(&self) {
        let prev = self.state.swap(STATE_UNEXPANDED, Ordering::Release);
        debug_assert_eq!(prev, STATE_EXPANDING, "cancelling a claim that was never taken");
    }

    /// Publish the child row. The release store on `state` is what makes the
    /// row contents visible to other selectors.
    pub(crate) fn publish_children(&self, row: RowIdx, count: u16) {
        self.child_row.store(row.0, Ordering::Relaxed);
        self.num_children.store(count, Ordering::Relaxed);
        let prev = self.state.swap(STATE_EXPANDED, Ordering::Release);
        debug_assert_eq!(prev, STATE_EXPANDING, "publishing without a claim");
    }

    /// Child row and count; `None` until published.
    pub fn children(&self) -> Option<(RowIdx, u16)> {
        if !self.is_expanded() {
            return None;
        }
        Some((
            RowIdx(self.child_row.load(Ordering::Relaxed)),
            self.num_children.load(Ordering::Relaxed),
        ))
    }

    pub fn num_children(&self) -> u16 {
        if self.is_expanded() {
            self.num_children.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    // --- Terminal ---

    pub fn terminal_status(&self) -> TerminalStatus {
        TerminalStatus::from_u8(self.terminal.load(Ordering::Acquire))
    }

    pub(crate) fn set_terminal(&self, status: TerminalStatus) {
        debug_assert!(status.is_terminal());
        debug_assert!(!self.is_expanded(), "terminal nodes never have children");
        self.terminal.store(status as u8, Ordering::Release);
    }

    // --- Virtual loss ---

    pub fn virtual_loss(&self) -> u32 {
        self.vloss.load(Ordering::Relaxed)
    }

    pub(crate) fn add_virtual_loss(&self) {
        self.vloss.fetch_add(1, Ordering::Relaxed);
    }

    /// The release decrement pairs with acquire reads in later selectors, so
    /// the stat updates of the same backup are visible once vloss drops.
    pub(crate) fn remove_virtual_loss(&self) {
        let prev = self.vloss.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "virtual loss underflow");
    }

    // --- Statistics ---

    pub fn visits(&self) -> u32 {
        self.stats.visits()
    }

    pub fn stats(&self) -> NodeStats {
        self.stats.read()
    }

    pub(crate) fn add_sample(&self, value: f32, moves_left: f32) {
        self.stats.add(value, moves_left);
    }

    // --- Evaluation heads ---

    pub(crate) fn set_eval_info(&self, value_unc: f32, policy_unc: f32, secondary: f32) {
        self.value_unc.store(value_unc.to_bits(), Ordering::Relaxed);
        self.policy_unc.store(policy_unc.to_bits(), Ordering::Relaxed);
        self.secondary.store(secondary.to_bits(), Ordering::Relaxed);
    }

    pub fn value_uncertainty(&self) -> f32 {
        f32::from_bits(self.value_unc.load(Ordering::Relaxed))
    }

    pub fn policy_uncertainty(&self) -> f32 {
        f32::from_bits(self.policy_unc.load(Ordering::Relaxed))
    }

    pub fn secondary_value(&self) -> f32 {
        f32::from_bits(self.secondary.load(Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// ChildSlot / ChildRowArena
// ---------------------------------------------------------------------------

/// One child entry: encoded move, fixed-point prior, child node index.
/// Move and prior are written before the parent publishes its row; the child
/// index transitions Unexpanded → Reserved → node index as the child is
/// materialised by the first descent through it.
pub struct ChildSlot {
    mv: AtomicU16,
    prior: AtomicU16,
    child: AtomicU32,
}

impl ChildSlot {
    fn empty() -> Self {
        Self {
            mv: AtomicU16::new(0),
            prior: AtomicU16::new(0),
            child: AtomicU32::new(CHILD_UNEXPANDED),
        }
    }

    pub(crate) fn init(&self, mv: EncodedMove, prior: u16) {
        self.mv.store(mv, Ordering::Relaxed);
        self.prior.store(prior, Ordering::Relaxed);
        self.child.store(CHILD_UNEXPANDED, Ordering::Relaxed);
    }

    pub fn mv(&self) -> EncodedMove {
        self.mv.load(Ordering::Relaxed)
    }

    pub fn prior(&self) -> u16 {
        self.prior.load(Ordering::Relaxed)
    }

    pub(crate) fn set_prior(&self, prior: u16) {
        self.prior.store(prior, Ordering::Relaxed);
    }

    /// Raw child word, including sentinels.
    pub(crate) fn child_raw(&self) -> u32 {
        self.child.load(Ordering::Acquire)
    }

    /// Materialised child, if any.
    pub fn child(&self) -> Option<NodeIdx> {
        match self.child_raw() {
            CHILD_UNEXPANDED | CHILD_RESERVED => None,
            raw => Some(NodeIdx(raw)),
        }
    }

    /// Try to win the right to materialise this child.
    pub(crate) fn try_reserve(&self) -> bool {
        self.child
            .compare_exchange(
                CHILD_UNEXPANDED,
                CHILD_RESERVED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub(crate) fn publish_child(&self, idx: NodeIdx) {
        debug_assert_eq!(self.child_raw(), CHILD_RESERVED);
        self.child.store(idx.0, Ordering::Release);
    }

    /// Reservation failed downstream (arena full): put the slot back.
    pub(crate) fn cancel_reserve(&self) {
        debug_assert_eq!(self.child_raw(), CHILD_RESERVED);
        self.child.store(CHILD_UNEXPANDED, Ordering::Release);
    }

    /// Bounded spin-then-yield wait for a reserved slot to resolve. Returns
    /// the child index, or `None` if the winner still hasn't published (the
    /// waiter then treats the descent as a collision).
    pub(crate) fn wait_for_child(&self) -> Option<NodeIdx> {
        let mut spins = 0u32;
        let mut yields = 0u32;
        loop {
            match self.child_raw() {
                CHILD_RESERVED => {
                    spins += 1;
                    if spins < SPIN_LIMIT {
                        std::hint::spin_loop();
                    } else if yields < 4 {
                        std::thread::yield_now();
                        spins = 0;
                        yields += 1;
                    } else {
                        return None;
                    }
                }
                CHILD_UNEXPANDED => return None,
                raw => return Some(NodeIdx(raw)),
            }
        }
    }
}

/// Variable-length child rows, bump-allocated from one slab. Each thread
/// carves private chunks off the global cursor so row allocation doesn't
/// contend on the hot path.
struct ChildRowArena {
    slots: Box<[ChildSlot]>,
    next: AtomicUsize,
    local: ThreadLocal<std::cell::Cell<(usize, usize)>>,
    overflow: AtomicBool,
}

/// Slots a thread grabs at a time from the global cursor.
const ROW_CHUNK: usize = 2048;

impl ChildRowArena {
    fn new(capacity: usize) -> Self {
        let slots: Vec<ChildSlot> = (0..capacity).map(|_| ChildSlot::empty()).collect();
        Self {
            slots: slots.into_boxed_slice(),
            next: AtomicUsize::new(0),
            local: ThreadLocal::new(),
            overflow: AtomicBool::new(false),
        }
    }

    fn grab_global(&self, len: usize) -> Option<usize> {
        let start = self.next.fetch_add(len, Ordering::Relaxed);
        if start.saturating_add(len) > self.slots.len() {
            self.overflow.store(true, Ordering::Relaxed);
            return None;
        }
        Some(start)
    }

    fn alloc(&self, len: usize) -> Option<RowIdx> {
        debug_assert!(len > 0);
        let chunk = ROW_CHUNK.min(self.slots.len());
        if len >= chunk {
            return self.grab_global(len).map(|s| RowIdx(s as u32));
        }

        let cell = self.local.get_or(|| std::cell::Cell::new((0, 0)));
        let (cursor, end) = cell.get();
        if cursor + len <= end {
            cell.set((cursor + len, end));
            return Some(RowIdx(cursor as u32));
        }

        // Chunk exhausted; the tail is abandoned.
        let start = self.grab_global(chunk)?;
        cell.set((start + len, start + chunk));
        Some(RowIdx(start as u32))
    }

    fn slot(&self, row: RowIdx, i: usize) -> &ChildSlot {
        &self.slots[row.as_usize() + i]
    }

    fn reset(&mut self) {
        self.next.store(0, Ordering::Relaxed);
        self.local.clear();
        self.overflow.store(false, Ordering::Relaxed);
    }

    fn overflowed(&self) -> bool {
        self.overflow.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// NodeStore
// ---------------------------------------------------------------------------

/// Fixed-capacity arena of node records, the child-row slab and the
/// transposition index. Append-only during a search; shared by value
/// reference across all workers.
pub struct NodeStore {
    nodes: Box<[NodeRecord]>,
    next: AtomicUsize,
    allocated: AtomicUsize,
    free: Mutex<Vec<u32>>,
    overflow: AtomicBool,
    rows: ChildRowArena,
    index: TranspositionIndex,
}

impl NodeStore {
    pub fn new(max_nodes: usize, child_slot_capacity: usize) -> Self {
        let nodes: Vec<NodeRecord> = (0..max_nodes).map(|_| NodeRecord::empty()).collect();
        Self {
            nodes: nodes.into_boxed_slice(),
            next: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            free: Mutex::new(Vec::new()),
            overflow: AtomicBool::new(false),
            rows: ChildRowArena::new(child_slot_capacity),
            index: TranspositionIndex::with_capacity(max_nodes),
        }
    }

    /// Allocate and initialise a node. `None` once the arena is exhausted;
    /// the overflow flag is sticky until the next reset.
    pub fn alloc_node(
        &self,
        parent: Option<NodeIdx>,
        mv: EncodedMove,
        hash: PositionHash,
    ) -> Option<NodeIdx> {
        let raw = match self.free.lock().expect("free list poisoned").pop() {
            Some(idx) => idx,
            None => {
                let bumped = self.next.fetch_add(1, Ordering::Relaxed);
                if bumped >= self.nodes.len() {
                    self.overflow.store(true, Ordering::Relaxed);
                    return None;
                }
                bumped as u32
            }
        };

        let idx = NodeIdx(raw);
        self.nodes[idx.as_usize()].init(parent.map_or(NO_NODE, NodeIdx::as_u32), mv, hash);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some(idx)
    }

    pub fn node(&self, idx: NodeIdx) -> &NodeRecord {
        &self.nodes[idx.as_usize()]
    }

    pub fn alloc_child_row(&self, num_children: usize) -> Option<RowIdx> {
        self.rows.alloc(num_children)
    }

    pub fn child_slot(&self, row: RowIdx, i: usize) -> &ChildSlot {
        self.rows.slot(row, i)
    }

    pub fn transposition_lookup(&self, hash: PositionHash) -> Option<NodeIdx> {
        self.index.lookup(hash)
    }

    /// Insert, returning the authoritative node for `hash` (the existing one
    /// on a race — first writer wins).
    pub fn transposition_insert(&self, hash: PositionHash, idx: NodeIdx) -> NodeIdx {
        self.index.insert(hash, idx)
    }

    pub fn transposition_len(&self) -> usize {
        self.index.len()
    }

    /// Live node count.
    pub fn len(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// True once any allocation has failed (node or child-row arena).
    pub fn overflowed(&self) -> bool {
        self.overflow.load(Ordering::Relaxed) || self.rows.overflowed()
    }

    /// Drop every node. Records are lazily re-initialised on allocation.
    pub fn reset(&mut self) {
        self.next.store(0, Ordering::Relaxed);
        self.allocated.store(0, Ordering::Relaxed);
        self.free.lock().expect("free list poisoned").clear();
        self.overflow.store(false, Ordering::Relaxed);
        self.rows.reset();
        self.index.clear();
    }

    /// After the root moved to a kept child: everything unreachable from
    /// `root` becomes allocatable again and the transposition index is
    /// rebuilt over the surviving subtree. Child-row slots of discarded
    /// nodes are not reclaimed until a full reset.
    pub fn rebuild_after_reparent(&mut self, root: NodeIdx) {
        let high_water = self.next.load(Ordering::Relaxed).min(self.nodes.len());
        let mut reachable = vec![false; high_water];
        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            let slot = &mut reachable[idx.as_usize()];
            if *slot {
                continue;
            }
            *slot = true;
            if let Some((row, count)) = self.node(idx).children() {
                for i in 0..count as usize {
                    if let Some(child) = self.child_slot(row, i).child() {
                        stack.push(child);
                    }
                }
            }
        }

        let mut free = self.free.lock().expect("free list poisoned");
        free.clear();
        let mut kept = 0usize;
        for (raw, &alive) in reachable.iter().enumerate() {
            if alive {
                kept += 1;
            } else {
                free.push(raw as u32);
            }
        }
        drop(free);
        self.allocated.store(kept, Ordering::Relaxed);
        self.overflow.store(false, Ordering::Relaxed);

        self.index.clear();
        for (raw, &alive) in reachable.iter().enumerate() {
            if alive {
                let idx = NodeIdx(raw as u32);
                if self.node(idx).is_expanded() {
                    self.index.insert(self.node(idx).hash(), idx);
                }
            }
        }

        self.node(root).clear_parent();
    }
}

impl Index<NodeIdx> for NodeStore {
    type Output = NodeRecord;
    fn index(&self, idx: NodeIdx) -> &Self::Output {
        self.node(idx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
