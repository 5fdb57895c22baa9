//! Evaluation cache: identical positions reached in different searches (or
//! after tree reuse discarded their nodes) skip the device entirely.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use thread_local::ThreadLocal;
use tracing::trace;

use ceres_mcts::{BatchedEvaluator, EvalBatch, EvalError, EvalOutput, InputEncoding};

const LOAD_FACTOR: f64 = 1.9;

// ---------------------------------------------------------------------------
// EvalCache — open addressing with FIFO eviction
// ---------------------------------------------------------------------------

struct Entry {
    key: u64,
    value: Option<EvalOutput>,
}

/// Fixed-capacity hash table of evaluator outputs keyed by folded position
/// hash. Linear probing, FIFO eviction with probe-chain compaction, inserts
/// of an existing key ignored (same position, same evaluation).
pub struct EvalCache {
    table: Vec<Entry>,
    insertion_order: VecDeque<u64>,
    capacity: usize,
    size: usize,
}

impl EvalCache {
    pub fn new(capacity: usize) -> Self {
        let table_size = (capacity as f64 * LOAD_FACTOR) as usize + 1;
        let mut table = Vec::with_capacity(table_size);
        table.resize_with(table_size, || Entry { key: 0, value: None });
        Self {
            table,
            insertion_order: VecDeque::with_capacity(capacity),
            capacity,
            size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn lookup(&self, key: u64) -> Option<EvalOutput> {
        if self.capacity == 0 {
            return None;
        }
        let table_size = self.table.len();
        let mut idx = (key % table_size as u64) as usize;
        loop {
            match &self.table[idx] {
                Entry { value: None, .. } => return None,
                Entry { key: k, value: Some(v) } if *k == key => return Some(*v),
                _ => {}
            }
            idx += 1;
            if idx >= table_size {
                idx -= table_size;
            }
        }
    }

    /// Insert; existing keys are left untouched, and the oldest entry is
    /// evicted once the cache is over capacity.
    pub fn insert(&mut self, key: u64, value: EvalOutput) {
        if self.capacity == 0 {
            return;
        }
        let table_size = self.table.len();
        let mut idx = (key % table_size as u64) as usize;
        loop {
            match &self.table[idx] {
                Entry { value: None, .. } => break,
                Entry { key: k, value: Some(_) } if *k == key => return,
                _ => {}
            }
            idx += 1;
            if idx >= table_size {
                idx -= table_size;
            }
        }

        self.table[idx] = Entry {
            key,
            value: Some(value),
        };
        self.insertion_order.push_back(key);
        self.size += 1;

        while self.size > self.capacity {
            self.evict_oldest();
        }
    }

    /// Remove the FIFO-oldest entry, then compact the probe chain that
    /// follows the hole so later entries stay reachable.
    fn evict_oldest(&mut self) {
        let key = self
            .insertion_order
            .pop_front()
            .expect("evicting from an empty cache");
        let table_size = self.table.len();

        let mut idx = (key % table_size as u64) as usize;
        loop {
            if self.table[idx].value.is_some() && self.table[idx].key == key {
                break;
            }
            idx += 1;
            if idx >= table_size {
                idx -= table_size;
            }
        }
        self.table[idx].value = None;
        self.size -= 1;

        let mut next = (idx + 1) % table_size;
        while self.table[next].value.is_some() {
            let home = (self.table[next].key % table_size as u64) as usize;
            if !in_circular_range(home, idx + 1, next, table_size) {
                self.table.swap(idx, next);
                idx = next;
            }
            next = (next + 1) % table_size;
        }
    }
}

/// Is `target` inside the circular range `[start, end]` (inclusive)?
fn in_circular_range(target: usize, start: usize, end: usize, table_size: usize) -> bool {
    let start = start % table_size;
    if start <= end {
        target >= start && target <= end
    } else {
        target >= start || target <= end
    }
}

// ---------------------------------------------------------------------------
// CacheStats / CachingEvaluator
// ---------------------------------------------------------------------------

pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

impl CacheStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let h = self.hits.load(Relaxed);
        let total = h + self.misses.load(Relaxed);
        if total == 0 {
            0.0
        } else {
            h as f64 / total as f64
        }
    }
}

/// Caching decorator for any evaluator.
///
/// Caches are thread-local — each search worker keeps its own, so there is no
/// cross-thread contention and no locking on the hit path. The decorator
/// splits each batch into hits and misses, forwards only the misses, and
/// reassembles results in order.
pub struct CachingEvaluator {
    inner: Box<dyn BatchedEvaluator>,
    caches: ThreadLocal<RefCell<EvalCache>>,
    capacity: usize,
    pub stats: CacheStats,
}

impl CachingEvaluator {
    pub fn new(inner: Box<dyn BatchedEvaluator>, capacity: usize) -> Self {
        Self {
            inner,
            caches: ThreadLocal::new(),
            capacity,
            stats: CacheStats::new(),
        }
    }
}

impl BatchedEvaluator for CachingEvaluator {
    fn input_dim(&self) -> usize {
        self.inner.input_dim()
    }

    fn input_encoding(&self) -> InputEncoding {
        self.inner.input_encoding()
    }

    fn min_batch_size(&self) -> usize {
        self.inner.min_batch_size()
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }

    fn evaluate(&self, batch: &EvalBatch) -> Result<Vec<EvalOutput>, EvalError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let capacity = self.capacity;
        let cache_cell = self.caches.get_or(|| RefCell::new(EvalCache::new(capacity)));
        let mut cache = cache_cell.borrow_mut();

        let n = batch.len();
        let mut results: Vec<Option<EvalOutput>> = vec![None; n];
        let mut miss_indices: Vec<usize> = Vec::new();
        let mut miss_batch = EvalBatch::new(batch.dim());

        for i in 0..n {
            match cache.lookup(batch.hash(i).fold()) {
                Some(cached) => results[i] = Some(cached),
                None => {
                    miss_indices.push(i);
                    miss_batch.push_entry_from(batch, i);
                }
            }
        }

        let hits = (n - miss_indices.len()) as u64;
        self.stats.hits.fetch_add(hits, Relaxed);
        self.stats.misses.fetch_add(miss_indices.len() as u64, Relaxed);
        trace!(hits, misses = miss_indices.len(), "eval cache split");

        if !miss_batch.is_empty() {
            let miss_results = self.inner.evaluate(&miss_batch)?;
            if miss_results.len() != miss_batch.len() {
                return Err(EvalError::ShapeMismatch {
                    expected: miss_batch.len(),
                    got: miss_results.len(),
                });
            }
            for (j, &orig) in miss_indices.iter().enumerate() {
                cache.insert(batch.hash(orig).fold(), miss_results[j]);
                results[orig] = Some(miss_results[j]);
            }
        }

        Ok(results.into_iter().map(|r| r.expect("slot filled")).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stub::{batch_of, StubEvaluator};
    use ceres_mcts::CompressedPolicy;
    use std::sync::Arc;

    fn output(v: f32) -> EvalOutput {
        EvalOutput {
            win: v,
            loss: 0.0,
            policy: CompressedPolicy::from_probs(&[1], &[1.0]),
            moves_left: 0.0,
            value_uncertainty: 0.0,
            policy_uncertainty: 0.0,
            secondary_value: 0.0,
        }
    }

    // ---- EvalCache ----

    #[test]
    fn insert_and_lookup() {
        let mut cache = EvalCache::new(16);
        cache.insert(42, output(0.5));
        assert_eq!(cache.lookup(42).unwrap().win, 0.5);
        assert!(cache.lookup(43).is_none());
    }

    #[test]
    fn insert_existing_key_is_ignored() {
        let mut cache = EvalCache::new(16);
        cache.insert(42, output(0.5));
        cache.insert(42, output(0.9));
        assert_eq!(cache.lookup(42).unwrap().win, 0.5);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn fifo_eviction() {
        let mut cache = EvalCache::new(3);
        for key in 1..=3 {
            cache.insert(key, output(key as f32));
        }
        cache.insert(4, output(4.0));

        assert_eq!(cache.len(), 3);
        assert!(cache.lookup(1).is_none(), "oldest evicted");
        for key in 2..=4 {
            assert!(cache.lookup(key).is_some());
        }
    }

    #[test]
    fn probe_chains_survive_eviction() {
        // Capacity 4 → table size 8; keys 0 and 8 collide in bucket 0.
        let mut cache = EvalCache::new(4);
        cache.insert(0, output(0.0));
        cache.insert(8, output(8.0));
        cache.insert(100, output(1.0));
        cache.insert(200, output(2.0));
        cache.insert(300, output(3.0)); // evicts key 0

        assert!(cache.lookup(0).is_none());
        assert_eq!(cache.lookup(8).unwrap().win, 8.0, "chain compacted, still findable");
    }

    #[test]
    fn zero_capacity_is_inert() {
        let mut cache = EvalCache::new(0);
        cache.insert(1, output(1.0));
        assert!(cache.lookup(1).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn churn_keeps_recent_entries() {
        let mut cache = EvalCache::new(32);
        for key in 0..1000u64 {
            cache.insert(key, output(key as f32));
        }
        assert_eq!(cache.len(), 32);
        for key in 968..1000u64 {
            assert!(cache.lookup(key).is_some(), "recent key {key} present");
        }
        for key in 0..900u64 {
            assert!(cache.lookup(key).is_none(), "old key {key} evicted");
        }
    }

    // ---- CachingEvaluator ----

    #[test]
    fn repeat_positions_skip_the_device() {
        let inner = Arc::new(StubEvaluator::new());
        let caching = CachingEvaluator::new(Box::new(Arc::clone(&inner)), 64);

        let batch = batch_of(&[5, 9]);
        let first = caching.evaluate(&batch).unwrap();
        let second = caching.evaluate(&batch).unwrap();

        assert_eq!(inner.calls(), 1, "second call served from cache");
        assert_eq!(first[0].win, second[0].win);
        assert_eq!(caching.stats.hits.load(Relaxed), 2);
        assert_eq!(caching.stats.misses.load(Relaxed), 2);
    }

    #[test]
    fn partial_hits_forward_only_misses() {
        let inner = Arc::new(StubEvaluator::new());
        let caching = CachingEvaluator::new(Box::new(Arc::clone(&inner)), 64);

        caching.evaluate(&batch_of(&[5])).unwrap();
        let mixed = caching.evaluate(&batch_of(&[5, 9, 13])).unwrap();

        assert_eq!(mixed.len(), 3);
        assert_eq!(inner.batch_sizes(), vec![1, 2], "only the two misses went down");
        // Results keep batch order: entry 0 is the cached value for 5.
        assert_eq!(mixed[0].moves_left, 5.0);
        assert_eq!(mixed[1].moves_left, 9.0);
        assert_eq!(mixed[2].moves_left, 13.0);
    }

    #[test]
    fn inner_errors_propagate() {
        let caching = CachingEvaluator::new(Box::new(StubEvaluator::new().failing()), 64);
        assert!(caching.evaluate(&batch_of(&[1])).is_err());
    }
}
