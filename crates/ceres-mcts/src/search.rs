use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::{debug, trace, warn};

use crate::backend::{BatchedEvaluator, EvalOutput};
use crate::backup::backup;
use crate::config::{BestMoveSelection, SearchConfig};
use crate::gather::{abort, apply, classify, shrink, CyclePlan};
use crate::node::{NodeIdx, NodeStore};
use crate::policy::prior_to_f32;
use crate::position::{EncodedMove, PositionOps};
use crate::select::{apply_root_noise, Selector};
use crate::tree::SearchTree;

// ---------------------------------------------------------------------------
// Limits, status, result types
// ---------------------------------------------------------------------------

/// When a search ends.
#[derive(Clone, Copy, Debug)]
pub enum SearchLimit {
    /// Stop once the root has accumulated this many visits. (Arena capacity
    /// is a separate, hard bound from the config.)
    Nodes(u64),
    /// Wall-clock budget. In-flight cycles complete; no new cycle starts
    /// past the deadline.
    Time(Duration),
    /// Fixed number of completed evaluation cycles.
    Cycles(u64),
    /// Adaptive: stop once the best root move's Q leads the runner-up by at
    /// least this margin (both visited).
    QDiff(f32),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SearchStatus {
    /// The limit fired; normal termination.
    LimitReached,
    /// Node or child-row arena filled up; the result is valid for the nodes
    /// that were allocated.
    CapacityExhausted,
    /// The evaluator failed twice in a row; the search stopped early.
    EvaluatorFailed,
}

/// Per-root-child summary in the final report.
#[derive(Clone, Copy, Debug)]
pub struct RootMove {
    pub mv: EncodedMove,
    pub visits: u32,
    /// Q from the root player's perspective; 0 when unvisited.
    pub q: f32,
    pub prior: f32,
}

/// Aggregate counters for one search.
#[derive(Clone, Copy, Debug, Default)]
pub struct SearchTelemetry {
    pub batches: u64,
    pub positions: u64,
    pub eval_time: Duration,
    pub collisions: u64,
    pub transposition_hits: u64,
    pub dedup_links: u64,
    pub terminal_visits: u64,
    pub deferred: u64,
}

impl SearchTelemetry {
    pub fn avg_batch_size(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.positions as f64 / self.batches as f64
        }
    }
}

#[derive(Clone, Debug)]
pub struct SearchResult {
    /// `None` only when the root itself is terminal.
    pub best_move: Option<EncodedMove>,
    /// Principal variation, most-visited line from the root.
    pub pv: Vec<EncodedMove>,
    /// Q of the best move, from the root player's perspective.
    pub q: f32,
    /// Standard deviation of the values backed up through the best move.
    pub q_uncertainty: f32,
    /// Moves-left estimate at the root.
    pub moves_left: f32,
    /// Nodes in the arena when the search stopped.
    pub nodes: usize,
    pub cycles: u64,
    pub elapsed: Duration,
    pub root_moves: Vec<RootMove>,
    pub telemetry: SearchTelemetry,
    pub status: SearchStatus,
}

// ---------------------------------------------------------------------------
// Shared per-search state
// ---------------------------------------------------------------------------

struct SearchState {
    stop: AtomicBool,
    capacity_exhausted: AtomicBool,
    evaluator_failed: AtomicBool,
    cycles: AtomicU64,
    batches: AtomicU64,
    positions: AtomicU64,
    eval_time_ns: AtomicU64,
    collisions: AtomicU64,
    transposition_hits: AtomicU64,
    dedup_links: AtomicU64,
    terminal_visits: AtomicU64,
    deferred: AtomicU64,
}

impl SearchState {
    fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            capacity_exhausted: AtomicBool::new(false),
            evaluator_failed: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            positions: AtomicU64::new(0),
            eval_time_ns: AtomicU64::new(0),
            collisions: AtomicU64::new(0),
            transposition_hits: AtomicU64::new(0),
            dedup_links: AtomicU64::new(0),
            terminal_visits: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
        }
    }

    fn telemetry(&self) -> SearchTelemetry {
        SearchTelemetry {
            batches: self.batches.load(Ordering::Relaxed),
            positions: self.positions.load(Ordering::Relaxed),
            eval_time: Duration::from_nanos(self.eval_time_ns.load(Ordering::Relaxed)),
            collisions: self.collisions.load(Ordering::Relaxed),
            transposition_hits: self.transposition_hits.load(Ordering::Relaxed),
            dedup_links: self.dedup_links.load(Ordering::Relaxed),
            terminal_visits: self.terminal_visits.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// search — public entry point
// ---------------------------------------------------------------------------

/// Run a search on `tree` until `limit` fires.
///
/// Worker threads each run select → classify → evaluate → apply cycles
/// against the shared store; with more than one worker the stages pipeline
/// naturally (one worker's batch evaluates while another selects). The
/// evaluator is shared, so implementations that are not reentrant must
/// serialise internally (the device gateway does).
pub fn search<P: PositionOps>(
    tree: &mut SearchTree<P>,
    evaluator: &dyn BatchedEvaluator,
    limit: SearchLimit,
) -> SearchResult {
    let started = Instant::now();
    tree.prepare_for_search();

    let config = tree.config().clone();
    let root = tree.root();

    // Terminal root: nothing to search. Record the single mandatory visit.
    let root_status = tree.store().node(root).terminal_status();
    if root_status.is_terminal() {
        if tree.store().node(root).visits() == 0 {
            tree.store().node(root).add_virtual_loss();
            backup(tree.store(), &[root], root_status.value(), 0.0);
        }
        return build_result(
            tree.store(),
            root,
            &config,
            &SearchState::new(),
            started.elapsed(),
            SearchStatus::LimitReached,
        );
    }

    let state = SearchState::new();
    let deadline = match limit {
        SearchLimit::Time(budget) => Some(started + budget),
        _ => None,
    };

    // Bootstrap: the root must be expanded before workers fan out, both for
    // root noise and so first descents have children to walk.
    if !tree.store().node(root).is_expanded() {
        run_cycle(tree, evaluator, &config, &state, 1);
        if terminal_status_of(&state) != SearchStatus::LimitReached {
            return build_result(
                tree.store(),
                root,
                &config,
                &state,
                started.elapsed(),
                terminal_status_of(&state),
            );
        }
    }

    if config.dirichlet_noise_epsilon > 0.0 {
        let mut rng = ChaCha20Rng::seed_from_u64(config.seed);
        apply_root_noise(tree.store(), root, &config, &mut rng);
    }

    let workers = config.num_worker_threads.max(1);
    if workers == 1 {
        worker_loop(tree, evaluator, &config, &state, limit, deadline, started);
    } else {
        let tree = &*tree;
        let state = &state;
        let config = &config;
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(move || {
                    worker_loop(tree, evaluator, config, state, limit, deadline, started);
                });
            }
        });
    }

    let status = terminal_status_of(&state);
    let result = build_result(tree.store(), root, &config, &state, started.elapsed(), status);
    debug!(
        nodes = result.nodes,
        cycles = result.cycles,
        avg_batch = result.telemetry.avg_batch_size(),
        ?status,
        "search finished"
    );
    result
}

fn terminal_status_of(state: &SearchState) -> SearchStatus {
    if state.evaluator_failed.load(Ordering::Relaxed) {
        SearchStatus::EvaluatorFailed
    } else if state.capacity_exhausted.load(Ordering::Relaxed) {
        SearchStatus::CapacityExhausted
    } else {
        SearchStatus::LimitReached
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

fn worker_loop<P: PositionOps>(
    tree: &SearchTree<P>,
    evaluator: &dyn BatchedEvaluator,
    config: &SearchConfig,
    state: &SearchState,
    limit: SearchLimit,
    deadline: Option<Instant>,
    started: Instant,
) {
    let store = tree.store();
    let root = tree.root();

    // Worker-local leaf target: shrinks when descents collide, recovers
    // toward the configured target when they don't.
    let mut k = config.target_batch_size.max(1);

    loop {
        if state.stop.load(Ordering::Relaxed) {
            break;
        }
        if limit_reached(store, root, config, state, limit, deadline, started) {
            state.stop.store(true, Ordering::Relaxed);
            break;
        }

        // Don't select far past a node budget.
        if let SearchLimit::Nodes(target) = limit {
            let visits = store.node(root).visits() as usize;
            let remaining = (target as usize).saturating_sub(visits);
            k = k.min(remaining.max(1));
        }

        let collided = run_cycle(tree, evaluator, config, state, k);
        if state.stop.load(Ordering::Relaxed) {
            break;
        }

        // Collision-adaptive batch target.
        if collided {
            k = (k / 2).max(1);
        } else if k < config.target_batch_size {
            k = (k * 2).min(config.target_batch_size);
        }
    }
}

/// One full cycle. Returns whether collisions dominated (caller shrinks `k`).
/// Sets stop/capacity/evaluator flags on fatal conditions.
fn run_cycle<P: PositionOps>(
    tree: &SearchTree<P>,
    evaluator: &dyn BatchedEvaluator,
    config: &SearchConfig,
    state: &SearchState,
    k: usize,
) -> bool {
    let store = tree.store();
    let selector = Selector::new(store, config, tree.root(), tree.root_position(), &state.stop);

    let outcomes = selector.collect(k);
    let (plan, tally) = classify(store, config, evaluator.input_dim(), outcomes);

    state.collisions.fetch_add(tally.collisions as u64, Ordering::Relaxed);
    state
        .transposition_hits
        .fetch_add(tally.table_hits as u64, Ordering::Relaxed);
    state.dedup_links.fetch_add(tally.dedup_links as u64, Ordering::Relaxed);
    state
        .terminal_visits
        .fetch_add(tally.terminals as u64, Ordering::Relaxed);
    state.deferred.fetch_add(tally.deferred as u64, Ordering::Relaxed);

    if tally.out_of_capacity || store.overflowed() {
        abort(store, plan);
        state.capacity_exhausted.store(true, Ordering::Relaxed);
        state.stop.store(true, Ordering::Relaxed);
        return false;
    }

    let collided = tally.collisions > tally.productive(plan.batch.len());

    if plan.batch.is_empty() {
        // All descents resolved inside the tree (terminals, hits, collisions).
        if tally.productive(0) == 0 {
            // Pure collision cycle; give the in-flight batch a moment.
            std::thread::yield_now();
        }
        state.cycles.fetch_add(1, Ordering::Relaxed);
        return collided;
    }

    let Some((plan, results)) = evaluate_with_retry(store, evaluator, state, plan) else {
        state.evaluator_failed.store(true, Ordering::Relaxed);
        state.stop.store(true, Ordering::Relaxed);
        return false;
    };

    match apply(store, config, plan, results) {
        Ok(applied) => {
            trace!(
                evaluated = applied.evaluated,
                linked = applied.linked,
                "cycle applied"
            );
        }
        Err(_) => {
            state.capacity_exhausted.store(true, Ordering::Relaxed);
            state.stop.store(true, Ordering::Relaxed);
            return false;
        }
    }
    state.cycles.fetch_add(1, Ordering::Relaxed);
    collided
}

/// Evaluate the plan's batch, retrying once with a halved batch on failure.
/// A second failure (or malformed output) abandons the cycle entirely.
fn evaluate_with_retry(
    store: &NodeStore,
    evaluator: &dyn BatchedEvaluator,
    state: &SearchState,
    plan: CyclePlan,
) -> Option<(CyclePlan, Vec<EvalOutput>)> {
    match evaluate_once(evaluator, state, &plan) {
        Ok(results) => Some((plan, results)),
        Err(err) => {
            let keep = (plan.batch.len() / 2).max(1);
            warn!(%err, keep, "evaluator failed, retrying with smaller batch");
            let plan = shrink(store, plan, keep);
            match evaluate_once(evaluator, state, &plan) {
                Ok(results) => Some((plan, results)),
                Err(err) => {
                    warn!(%err, "evaluator failed twice, stopping search");
                    abort(store, plan);
                    None
                }
            }
        }
    }
}

fn evaluate_once(
    evaluator: &dyn BatchedEvaluator,
    state: &SearchState,
    plan: &CyclePlan,
) -> Result<Vec<EvalOutput>, crate::backend::EvalError> {
    let t0 = Instant::now();
    let results = evaluator.evaluate(&plan.batch)?;
    let elapsed = t0.elapsed().as_nanos() as u64;

    if results.len() != plan.batch.len() {
        return Err(crate::backend::EvalError::ShapeMismatch {
            expected: plan.batch.len(),
            got: results.len(),
        });
    }
    if results.iter().any(|r| !r.is_finite()) {
        return Err(crate::backend::EvalError::NonFinite);
    }

    state.batches.fetch_add(1, Ordering::Relaxed);
    state
        .positions
        .fetch_add(plan.batch.len() as u64, Ordering::Relaxed);
    state.eval_time_ns.fetch_add(elapsed, Ordering::Relaxed);
    Ok(results)
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

fn limit_reached(
    store: &NodeStore,
    root: NodeIdx,
    config: &SearchConfig,
    state: &SearchState,
    limit: SearchLimit,
    deadline: Option<Instant>,
    _started: Instant,
) -> bool {
    match limit {
        SearchLimit::Nodes(n) => store.node(root).visits() as u64 >= n,
        SearchLimit::Time(_) => deadline.is_some_and(|d| Instant::now() >= d),
        SearchLimit::Cycles(c) => state.cycles.load(Ordering::Relaxed) >= c,
        SearchLimit::QDiff(margin) => {
            let moves = root_moves(store, root);
            let mut best: Option<&RootMove> = None;
            let mut second: Option<&RootMove> = None;
            for m in moves.iter().filter(|m| m.visits > 0) {
                match best {
                    Some(b) if m.q <= b.q => {
                        if second.is_none_or(|s| m.q > s.q) {
                            second = Some(m);
                        }
                    }
                    _ => {
                        second = best;
                        best = Some(m);
                    }
                }
            }
            match (best, second) {
                (Some(b), Some(s)) => b.q - s.q >= margin,
                // A single legal move is as decided as it gets.
                (Some(_), None) => moves.len() == 1,
                _ => false,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Result extraction
// ---------------------------------------------------------------------------

fn root_moves(store: &NodeStore, root: NodeIdx) -> Vec<RootMove> {
    let Some((row, count)) = store.node(root).children() else {
        return Vec::new();
    };
    (0..count as usize)
        .map(|i| {
            let slot = store.child_slot(row, i);
            let (visits, q) = match slot.child() {
                Some(child) => {
                    let stats = store.node(child).stats();
                    // Child sums are from the child's side; negate for the
                    // root player.
                    (stats.n, if stats.n > 0 { -stats.q() } else { 0.0 })
                }
                None => (0, 0.0),
            };
            RootMove {
                mv: slot.mv(),
                visits,
                q,
                prior: prior_to_f32(slot.prior()),
            }
        })
        .collect()
}

fn pick_best(moves: &[RootMove], selection: BestMoveSelection) -> Option<&RootMove> {
    if moves.is_empty() {
        return None;
    }
    match selection {
        BestMoveSelection::MaxN => moves.iter().max_by_key(|m| m.visits),
        BestMoveSelection::MaxQ => moves
            .iter()
            .filter(|m| m.visits > 0)
            .max_by(|a, b| a.q.partial_cmp(&b.q).unwrap_or(std::cmp::Ordering::Equal))
            .or_else(|| moves.iter().max_by_key(|m| m.visits)),
        BestMoveSelection::MaxNWithQTiebreak => {
            let max_n = moves.iter().map(|m| m.visits).max().unwrap_or(0);
            moves
                .iter()
                .filter(|m| m.visits == max_n)
                .max_by(|a, b| a.q.partial_cmp(&b.q).unwrap_or(std::cmp::Ordering::Equal))
        }
    }
}

fn principal_variation(store: &NodeStore, root: NodeIdx, first: Option<EncodedMove>) -> Vec<EncodedMove> {
    let mut pv = Vec::new();
    let mut current = root;

    // The PV starts with the selected best move, then follows visit counts.
    if let Some(mv) = first {
        let Some(next) = follow(store, current, mv) else {
            return pv;
        };
        pv.push(mv);
        current = next;
    }

    while pv.len() < 64 {
        let Some((row, count)) = store.node(current).children() else {
            break;
        };
        let mut best: Option<(u32, EncodedMove, NodeIdx)> = None;
        for i in 0..count as usize {
            let slot = store.child_slot(row, i);
            if let Some(child) = slot.child() {
                let visits = store.node(child).visits();
                if visits > 0 && best.is_none_or(|(n, _, _)| visits > n) {
                    best = Some((visits, slot.mv(), child));
                }
            }
        }
        let Some((_, mv, child)) = best else { break };
        pv.push(mv);
        current = child;
    }
    pv
}

fn follow(store: &NodeStore, parent: NodeIdx, mv: EncodedMove) -> Option<NodeIdx> {
    let (row, count) = store.node(parent).children()?;
    (0..count as usize)
        .map(|i| store.child_slot(row, i))
        .find(|slot| slot.mv() == mv)
        .and_then(|slot| slot.child())
}

fn build_result(
    store: &NodeStore,
    root: NodeIdx,
    config: &SearchConfig,
    state: &SearchState,
    elapsed: Duration,
    status: SearchStatus,
) -> SearchResult {
    let moves = root_moves(store, root);
    let best = pick_best(&moves, config.best_move_selection);
    let best_move = best.map(|m| m.mv);

    let (q, q_uncertainty) = match best {
        Some(m) if m.visits > 0 => {
            let unc = follow(store, root, m.mv)
                .map(|child| store.node(child).stats().q_deviation())
                .unwrap_or(0.0);
            (m.q, unc)
        }
        _ => {
            let stats = store.node(root).stats();
            (stats.q(), stats.q_deviation())
        }
    };

    SearchResult {
        best_move,
        pv: principal_variation(store, root, best_move),
        q,
        q_uncertainty,
        moves_left: store.node(root).stats().moves_left(),
        nodes: store.len(),
        cycles: state.cycles.load(Ordering::Relaxed),
        elapsed,
        root_moves: moves,
        telemetry: state.telemetry(),
        status,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
