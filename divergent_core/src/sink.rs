use crate::coverage::{CoverageError, CoverageMap};
use std::sync::Arc;

/// The callback side of a [`CoverageMap`]: instrumented code reports each
/// edge it executes here.
///
/// Every method is O(1) apart from [`CoverageSink::absorb`] and never
/// allocates. Increments are best-effort: the sink may be shared by several
/// threads of the same target and racing hits on one slot can be lost.
#[derive(Debug, Clone)]
pub struct CoverageSink {
    map: Arc<CoverageMap>,
}

impl CoverageSink {
    pub fn new(map: Arc<CoverageMap>) -> Self {
        Self { map }
    }

    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }

    /// Records one execution of the edge with id `guard`. Id `0` marks an
    /// inactive edge and is ignored.
    #[inline]
    pub fn hit(&self, guard: u32) {
        if guard == 0 {
            return;
        }
        self.map.increment(guard as usize);
    }

    /// Reads the guard slot and records a hit for it.
    ///
    /// # Safety
    /// `guard` must point to a live, aligned guard slot.
    #[inline]
    pub unsafe fn hit_guard(&self, guard: *const u32) {
        // SAFETY: upheld by the caller.
        let id = unsafe { guard.read_volatile() };
        self.hit(id);
    }

    /// Merges counts collected by an out-of-process target.
    pub fn absorb(&self, counts: &[u8]) -> Result<(), CoverageError> {
        self.map.absorb(counts)
    }
}

/// SanitizerCoverage `trace-pc-guard` callbacks.
///
/// With the `sancov` feature enabled, code compiled with
/// `-fsanitize-coverage=trace-pc-guard` and linked into the same process
/// reports its edges to the sink passed to [`sancov::install`]. Ids are
/// assigned by one process-wide [`GuardRegistry`](crate::guard::GuardRegistry)
/// because the init callback runs from static constructors, possibly before
/// `main`. Hits arriving before `install` are dropped.
#[cfg(feature = "sancov")]
pub mod sancov {
    use super::CoverageSink;
    use crate::guard::GuardRegistry;
    use std::sync::OnceLock;

    static REGISTRY: GuardRegistry = GuardRegistry::new();
    static SINK: OnceLock<CoverageSink> = OnceLock::new();

    /// Routes every instrumented edge of this process into `sink`. Returns
    /// the sink back if one was already installed.
    pub fn install(sink: CoverageSink) -> Result<(), CoverageSink> {
        SINK.set(sink)
    }

    pub fn registry() -> &'static GuardRegistry {
        &REGISTRY
    }

    /// # Safety
    /// Called by instrumentation with the bounds of one guard section.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard_init(start: *mut u32, stop: *mut u32) {
        // SAFETY: the compiler passes the bounds of the image's guard section.
        if let Err(e) = unsafe { REGISTRY.assign_raw(start, stop) } {
            // Coverage from this image would be meaningless.
            tracing::error!(error = %e, "guard assignment failed");
            std::process::abort();
        }
    }

    /// # Safety
    /// Called by instrumentation with a guard slot of a live image.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard(guard: *mut u32) {
        if let Some(sink) = SINK.get() {
            // SAFETY: the instrumentation passes one of its own guard slots.
            unsafe { sink.hit_guard(guard) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::MIN_MAP_CAPACITY;
    use crate::guard::GuardRegistry;

    fn sink() -> (Arc<CoverageMap>, CoverageSink) {
        let map = Arc::new(CoverageMap::new(MIN_MAP_CAPACITY).unwrap());
        (Arc::clone(&map), CoverageSink::new(map))
    }

    #[test]
    fn zero_guard_contributes_nothing() {
        let (map, sink) = sink();
        sink.hit(0);
        let zero: u32 = 0;
        unsafe { sink.hit_guard(&zero) };
        assert_eq!(map.snapshot().covered_edges(), 0);
    }

    #[test]
    fn guard_ids_index_modulo_capacity() {
        let (map, sink) = sink();
        sink.hit(5);
        sink.hit(5 + MIN_MAP_CAPACITY as u32);
        assert_eq!(map.get(5), 2);
    }

    #[test]
    fn counters_never_exceed_255() {
        let (map, sink) = sink();
        for _ in 0..1_000 {
            sink.hit(1);
        }
        assert_eq!(map.get(1), u8::MAX);
    }

    #[test]
    fn registry_ids_drive_the_sink() {
        let (map, sink) = sink();
        let registry = GuardRegistry::new();
        let mut guards = [0u32; 3];
        registry.assign(&mut guards).unwrap();
        for guard in &guards {
            unsafe { sink.hit_guard(guard) };
        }
        let covered: Vec<usize> = map.snapshot().covered_indices().collect();
        assert_eq!(covered, vec![1, 2, 3]);
    }

    #[test]
    fn concurrent_hits_only_touch_their_own_slots() {
        let (map, sink) = sink();
        std::thread::scope(|s| {
            for guard in 1..=4u32 {
                let sink = sink.clone();
                s.spawn(move || {
                    for _ in 0..10_000 {
                        sink.hit(guard);
                        sink.hit(10);
                    }
                });
            }
        });
        let snapshot = map.snapshot();
        for guard in 1..=4 {
            assert_eq!(snapshot.counts()[guard], u8::MAX);
        }
        assert!(snapshot.counts()[10] > 0);
        let touched: Vec<usize> = snapshot.covered_indices().collect();
        assert_eq!(touched, vec![1, 2, 3, 4, 10], "no other slot may be written");
    }
}
