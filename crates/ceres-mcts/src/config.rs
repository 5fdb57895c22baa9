// ---------------------------------------------------------------------------
// BestMoveSelection
// ---------------------------------------------------------------------------

/// How the final move is chosen from the root's children.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BestMoveSelection {
    /// Most-visited child.
    MaxN,
    /// Highest-Q child (parent perspective), requires at least one visit.
    MaxQ,
    /// Most-visited child, breaking near-ties on Q.
    MaxNWithQTiebreak,
}

// ---------------------------------------------------------------------------
// SearchConfig
// ---------------------------------------------------------------------------

/// Search configuration — immutable, shareable across worker threads.
#[derive(Clone, Debug)]
pub struct SearchConfig {
    /// Base exploration constant in the PUCT formula.
    pub cpuct_base: f32,
    /// Coefficient of the log-growth term of the cpuct schedule.
    pub cpuct_factor: f32,
    /// Offset of the log-growth term: cpuct = base + factor * ln((N + init) / init).
    pub cpuct_init: f32,
    /// Multiplier applied to cpuct at the root only.
    pub cpuct_at_root_multiplier: f32,

    /// First-play urgency penalty at interior nodes.
    pub fpu_reduction: f32,
    /// First-play urgency penalty at the root.
    pub fpu_reduction_at_root: f32,

    /// Exponent 1/T applied to evaluator policies before compression.
    pub policy_softmax_temperature: f32,

    /// Fraction of root priors replaced by Dirichlet noise. 0 disables.
    pub dirichlet_noise_epsilon: f32,
    pub dirichlet_noise_alpha: f32,

    /// Weight of one in-flight descent in effective visit counts. 0 disables
    /// virtual loss entirely (single-threaded runs only).
    pub virtual_loss_per_visit: u32,

    /// Minimum visit count on the authoritative node before a transposition
    /// lookup counts as a hit.
    pub transposition_min_visits: u32,

    /// Arena capacity. Exceeding it ends the search with CapacityExhausted.
    pub max_nodes: usize,
    /// Child-slot arena capacity, as slots per node of `max_nodes`.
    pub child_slots_per_node: usize,

    /// Hard cap on positions per evaluator call; excess leaves are deferred.
    pub max_batch_size: usize,
    /// Leaves the selector aims to gather per cycle.
    pub target_batch_size: usize,

    pub num_worker_threads: usize,

    /// Keep the played child's subtree across `advance_root`.
    pub tree_reuse_enabled: bool,

    pub best_move_selection: BestMoveSelection,

    /// Seed for root noise and tie-break randomness. Single-threaded runs
    /// with equal seeds are bit-reproducible.
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            cpuct_base: 1.745,
            cpuct_factor: 3.894,
            cpuct_init: 38739.0,
            cpuct_at_root_multiplier: 1.0,
            fpu_reduction: 0.33,
            fpu_reduction_at_root: 0.1,
            policy_softmax_temperature: 1.0,
            dirichlet_noise_epsilon: 0.0,
            dirichlet_noise_alpha: 0.3,
            virtual_loss_per_visit: 1,
            transposition_min_visits: 1,
            max_nodes: 1 << 20,
            child_slots_per_node: 40,
            max_batch_size: 1024,
            target_batch_size: 256,
            num_worker_threads: 1,
            tree_reuse_enabled: true,
            best_move_selection: BestMoveSelection::MaxNWithQTiebreak,
            seed: 0,
        }
    }
}

impl SearchConfig {
    /// Small arena, tiny batches, no noise — keeps unit tests fast and exact.
    pub fn for_testing() -> Self {
        Self {
            max_nodes: 1 << 14,
            child_slots_per_node: 8,
            max_batch_size: 16,
            target_batch_size: 4,
            ..Self::default()
        }
    }

    pub fn with_max_nodes(mut self, n: usize) -> Self {
        self.max_nodes = n;
        self
    }

    pub fn with_target_batch_size(mut self, n: usize) -> Self {
        self.target_batch_size = n;
        self
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.num_worker_threads = n.max(1);
        self
    }

    pub fn with_noise(mut self, epsilon: f32, alpha: f32) -> Self {
        self.dirichlet_noise_epsilon = epsilon;
        self.dirichlet_noise_alpha = alpha;
        self
    }

    pub fn with_best_move_selection(mut self, sel: BestMoveSelection) -> Self {
        self.best_move_selection = sel;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// cpuct for a node with `n_effective` visits (real + virtual).
    pub(crate) fn cpuct(&self, n_effective: u32, is_root: bool) -> f32 {
        let grown = self.cpuct_base
            + self.cpuct_factor
                * ((n_effective as f32 + self.cpuct_init) / self.cpuct_init).ln();
        if is_root {
            grown * self.cpuct_at_root_multiplier
        } else {
            grown
        }
    }

    pub(crate) fn fpu_reduction(&self, is_root: bool) -> f32 {
        if is_root {
            self.fpu_reduction_at_root
        } else {
            self.fpu_reduction
        }
    }

    pub(crate) fn child_slot_capacity(&self) -> usize {
        self.max_nodes.saturating_mul(self.child_slots_per_node)
    }
}
