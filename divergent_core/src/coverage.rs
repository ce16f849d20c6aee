//! Per-context edge coverage storage.
//!
//! A [`CoverageMap`] is a fixed array of saturating one-byte hit counters,
//! indexed by `guard_id % capacity`. Distinct guards may share a slot; the
//! map is a novelty heuristic, not an exact edge trace. One map exists per
//! isolated execution context and is reset before and snapshotted after every
//! execution by the driver that owns it.
//!
//! Counters are [`AtomicU8`]s so that instrumentation running on several
//! threads of one target can increment without undefined behaviour. Increments
//! are a relaxed load followed by a relaxed store: racing increments of the
//! same slot may be lost, other slots are never affected.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

/// Default number of counters, matching the usual SanitizerCoverage map size.
pub const DEFAULT_MAP_CAPACITY: usize = 1 << 16;
/// Smallest accepted map; anything smaller collides on almost every edge.
pub const MIN_MAP_CAPACITY: usize = 64;
/// Largest accepted map.
pub const MAX_MAP_CAPACITY: usize = 1 << 24;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CoverageError {
    #[error(
        "coverage map capacity {0} is outside the supported range {MIN_MAP_CAPACITY}..={MAX_MAP_CAPACITY}"
    )]
    InvalidCapacity(usize),

    #[error("coverage data of {actual} bytes does not match map capacity {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

#[derive(Debug)]
pub struct CoverageMap {
    counters: Box<[AtomicU8]>,
}

impl CoverageMap {
    pub fn new(capacity: usize) -> Result<Self, CoverageError> {
        if !(MIN_MAP_CAPACITY..=MAX_MAP_CAPACITY).contains(&capacity) {
            return Err(CoverageError::InvalidCapacity(capacity));
        }
        let counters = (0..capacity).map(|_| AtomicU8::new(0)).collect();
        Ok(Self { counters })
    }

    pub fn capacity(&self) -> usize {
        self.counters.len()
    }

    /// Base address of the counter array, for instrumentation that writes the
    /// map directly. The array is `capacity()` bytes long and lives as long as
    /// the map.
    pub fn as_ptr(&self) -> *const u8 {
        // `AtomicU8` has the same size and alignment as `u8`.
        self.counters.as_ptr().cast::<u8>()
    }

    /// Saturating increment of one counter. Lossy under contention.
    #[inline]
    pub fn increment(&self, index: usize) {
        let slot = &self.counters[index % self.counters.len()];
        let current = slot.load(Ordering::Relaxed);
        if current != u8::MAX {
            slot.store(current + 1, Ordering::Relaxed);
        }
    }

    /// Adds externally collected counts, saturating at 255.
    pub fn absorb(&self, counts: &[u8]) -> Result<(), CoverageError> {
        if counts.len() != self.counters.len() {
            return Err(CoverageError::LengthMismatch {
                expected: self.counters.len(),
                actual: counts.len(),
            });
        }
        for (slot, &count) in self.counters.iter().zip(counts) {
            if count != 0 {
                let current = slot.load(Ordering::Relaxed);
                slot.store(current.saturating_add(count), Ordering::Relaxed);
            }
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> u8 {
        self.counters[index % self.counters.len()].load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for slot in self.counters.iter() {
            slot.store(0, Ordering::Relaxed);
        }
        // Publish the zeroed map before the next execution is dispatched.
        std::sync::atomic::fence(Ordering::Release);
    }

    pub fn snapshot(&self) -> CoverageSnapshot {
        std::sync::atomic::fence(Ordering::Acquire);
        let counts = self
            .counters
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect();
        CoverageSnapshot { counts }
    }
}

/// Immutable copy of a coverage map taken right after one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSnapshot {
    counts: Box<[u8]>,
}

impl CoverageSnapshot {
    pub fn from_counts(counts: Vec<u8>) -> Self {
        Self {
            counts: counts.into_boxed_slice(),
        }
    }

    pub fn counts(&self) -> &[u8] {
        &self.counts
    }

    pub fn capacity(&self) -> usize {
        self.counts.len()
    }

    pub fn covered_edges(&self) -> usize {
        self.counts.iter().filter(|&&c| c != 0).count()
    }

    pub fn covered_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, c)| **c != 0)
            .map(|(i, _)| i)
    }

    /// MD5 over the set of covered slots, ignoring hit counts. Two inputs
    /// with the same signature exercised the same slots.
    pub fn signature(&self) -> [u8; 16] {
        let mut bits = vec![0u8; self.counts.len().div_ceil(8)];
        for index in self.covered_indices() {
            bits[index / 8] |= 1 << (index % 8);
        }
        md5::compute(&bits).0
    }

    /// Renders the map as rows of `+` (hit) and `-` (not hit).
    pub fn render_grid(&self, width: usize) -> String {
        let width = width.max(1);
        let mut out = String::with_capacity(self.counts.len() + self.counts.len() / width + 1);
        for row in self.counts.chunks(width) {
            out.extend(row.iter().map(|&c| if c != 0 { '+' } else { '-' }));
            out.push('\n');
        }
        out
    }
}

/// Running union of every slot ever hit in one target version's map.
#[derive(Debug, Clone)]
pub struct CoverageUnion {
    seen: Box<[u8]>,
}

impl CoverageUnion {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.seen.len()
    }

    pub fn covered_edges(&self) -> usize {
        self.seen.iter().filter(|&&c| c != 0).count()
    }

    /// Whether `snapshot` hits any slot never hit before. Does not modify the
    /// union.
    pub fn has_novel(&self, snapshot: &CoverageSnapshot) -> bool {
        let new = snapshot.counts();
        if new.len() != self.seen.len() {
            return new.iter().zip(self.seen.iter()).any(|(&n, &s)| n != 0 && s == 0);
        }

        let mut new_words = new.chunks_exact(8);
        let mut seen_words = self.seen.chunks_exact(8);
        for (n, s) in new_words.by_ref().zip(seen_words.by_ref()) {
            let n = u64::from_ne_bytes(n.try_into().unwrap_or([0; 8]));
            let s = u64::from_ne_bytes(s.try_into().unwrap_or([0; 8]));
            if n != 0 && has_new_byte(n, s) {
                return true;
            }
        }
        new_words
            .remainder()
            .iter()
            .zip(seen_words.remainder())
            .any(|(&n, &s)| n != 0 && s == 0)
    }

    /// Folds `snapshot` into the union and returns how many slots it hit for
    /// the first time.
    pub fn union_with(&mut self, snapshot: &CoverageSnapshot) -> usize {
        let mut novel = 0;
        for (seen, &count) in self.seen.iter_mut().zip(snapshot.counts()) {
            if count != 0 && *seen == 0 {
                *seen = count;
                novel += 1;
            }
        }
        novel
    }
}

/// True when some byte lane is nonzero in `new` and zero in `seen`.
#[inline]
fn has_new_byte(new: u64, seen: u64) -> bool {
    const LOW: u64 = 0x7f7f_7f7f_7f7f_7f7f;
    // High bit of each lane set iff that lane of `x` is nonzero.
    let nonzero = |x: u64| ((x & LOW) + LOW | x) & !LOW;
    nonzero(new) & !nonzero(seen) != 0
}
