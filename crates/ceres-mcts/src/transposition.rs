use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::node::NodeIdx;
use crate::position::PositionHash;

/// Probes before a lookup or insert gives up. A full table degrades to
/// "no sharing", never to an error.
const MAX_PROBE: usize = 32;

/// Substitute key for the (astronomically unlikely) hash with a zero low
/// word, since 0 marks an empty slot.
const ZERO_KEY: u64 = 0x9E37_79B9_7F4A_7C15;

fn key_of(hash: PositionHash) -> u64 {
    if hash.lo == 0 {
        ZERO_KEY
    } else {
        hash.lo
    }
}

fn pack_value(hash: PositionHash, idx: NodeIdx) -> u64 {
    ((hash.hi as u64) << 32) | (idx.as_u32() as u64 + 1)
}

fn unpack_value(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, (value as u32) - 1)
}

// ---------------------------------------------------------------------------
// TranspositionIndex
// ---------------------------------------------------------------------------

/// Lock-free map from 96-bit position hash to the authoritative node index.
///
/// Power-of-two open addressing with linear probing. A slot is a (key, value)
/// pair of atomics: inserters CAS the key into an empty slot and then publish
/// the packed (hash-high, node-index) value with a release store; readers
/// that observe the key but a still-zero value treat the slot as a miss (the
/// insert is mid-flight). First writer wins — a racing insert for the same
/// hash returns the existing index so both paths share one authoritative
/// node.
pub struct TranspositionIndex {
    slots: Box<[TtSlot]>,
    mask: u64,
    filled: AtomicUsize,
}

struct TtSlot {
    key: AtomicU64,
    value: AtomicU64,
}

impl TtSlot {
    fn empty() -> Self {
        Self {
            key: AtomicU64::new(0),
            value: AtomicU64::new(0),
        }
    }
}

impl TranspositionIndex {
    /// Table sized to the next power of two ≥ 2 × `expected_nodes`.
    pub fn with_capacity(expected_nodes: usize) -> Self {
        let size = expected_nodes.saturating_mul(2).next_power_of_two().max(16);
        let slots: Vec<TtSlot> = (0..size).map(|_| TtSlot::empty()).collect();
        Self {
            slots: slots.into_boxed_slice(),
            mask: (size - 1) as u64,
            filled: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.filled.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, hash: PositionHash) -> Option<NodeIdx> {
        let key = key_of(hash);
        let mut slot_idx = (key & self.mask) as usize;
        for _ in 0..MAX_PROBE {
            let slot = &self.slots[slot_idx];
            let found = slot.key.load(Ordering::Acquire);
            if found == 0 {
                return None;
            }
            if found == key {
                let value = slot.value.load(Ordering::Acquire);
                if value == 0 {
                    // Insert in flight; miss rather than wait.
                    return None;
                }
                let (hi, idx) = unpack_value(value);
                if hi == hash.hi {
                    return Some(NodeIdx::new(idx));
                }
                // Low-word collision with a different position: keep probing.
            }
            slot_idx = (slot_idx + 1) & self.mask as usize;
        }
        None
    }

    /// Insert `hash → idx`, returning the authoritative index: `idx` when the
    /// insert took effect, the previously inserted node when the hash was
    /// already present (first writer wins).
    pub fn insert(&self, hash: PositionHash, idx: NodeIdx) -> NodeIdx {
        let key = key_of(hash);
        let packed = pack_value(hash, idx);
        let mut slot_idx = (key & self.mask) as usize;
        for _ in 0..MAX_PROBE {
            let slot = &self.slots[slot_idx];
            let found = slot.key.load(Ordering::Acquire);
            if found == 0 {
                match slot
                    .key
                    .compare_exchange(0, key, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        slot.value.store(packed, Ordering::Release);
                        self.filled.fetch_add(1, Ordering::Relaxed);
                        return idx;
                    }
                    Err(race_key) if race_key == key => {
                        // Lost the slot to an insert of the same key.
                        if let Some(existing) = self.wait_value(slot, hash) {
                            return existing;
                        }
                    }
                    Err(_) => {}
                }
            } else if found == key {
                if let Some(existing) = self.wait_value(slot, hash) {
                    return existing;
                }
            }
            slot_idx = (slot_idx + 1) & self.mask as usize;
        }
        // Probe window exhausted — the entry is simply not shared.
        idx
    }

    /// Spin briefly for a mid-flight insert's value. `None` means the stored
    /// entry is a different position (same low word) and probing continues.
    fn wait_value(&self, slot: &TtSlot, hash: PositionHash) -> Option<NodeIdx> {
        let mut spins = 0u32;
        loop {
            let value = slot.value.load(Ordering::Acquire);
            if value != 0 {
                let (hi, idx) = unpack_value(value);
                return if hi == hash.hi {
                    Some(NodeIdx::new(idx))
                } else {
                    None
                };
            }
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter() {
            slot.key.store(0, Ordering::Relaxed);
            slot.value.store(0, Ordering::Relaxed);
        }
        self.filled.store(0, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
