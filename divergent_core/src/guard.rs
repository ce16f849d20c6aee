//! Load-time edge identifiers.
//!
//! Instrumented images carry a section of `u32` guard slots, one per
//! control-flow edge, all zero when the image is loaded. The registry hands
//! each slot a unique nonzero id so that the coverage sink can index the
//! coverage map with it. Id `0` means "inactive" and never reaches a counter.

use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

/// Errors raised while assigning guard ids. Both invalidate every later
/// novelty decision, so callers treat them as fatal at startup.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum GuardError {
    /// The guard section bounds are inverted.
    #[error("guard range is corrupt: start {start:#x} is past stop {stop:#x}")]
    InvalidRange { start: usize, stop: usize },

    /// Assigning the section would wrap the id counter back onto `0`.
    #[error("guard id space exhausted: {issued} ids issued, {requested} more requested")]
    Exhausted { issued: u32, requested: usize },
}

/// Hands out monotonically increasing guard ids across every image loaded
/// into one process.
#[derive(Debug, Default)]
pub struct GuardRegistry {
    last_issued: AtomicU32,
}

impl GuardRegistry {
    pub const fn new() -> Self {
        Self {
            last_issued: AtomicU32::new(0),
        }
    }

    /// Number of ids issued so far, which is also the highest id issued.
    pub fn last_issued(&self) -> u32 {
        self.last_issued.load(Ordering::Acquire)
    }

    /// Assigns ids to a freshly loaded guard section.
    ///
    /// Returns how many guards were assigned. An empty section, or one whose
    /// first guard is already nonzero, is left untouched: loaders may invoke
    /// the init callback more than once for the same image.
    pub fn assign(&self, guards: &mut [u32]) -> Result<usize, GuardError> {
        match guards.first() {
            None => return Ok(0),
            Some(&first) if first != 0 => return Ok(0),
            Some(_) => {}
        }

        let count = guards.len();
        let count_u32 = u32::try_from(count).map_err(|_| GuardError::Exhausted {
            issued: self.last_issued(),
            requested: count,
        })?;

        // Reserve the whole block at once so concurrent loaders never interleave.
        let base = self
            .last_issued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |issued| {
                issued.checked_add(count_u32)
            })
            .map_err(|issued| GuardError::Exhausted {
                issued,
                requested: count,
            })?;

        for (offset, guard) in guards.iter_mut().enumerate() {
            *guard = base + 1 + offset as u32;
        }
        Ok(count)
    }

    /// Pointer-range form of [`GuardRegistry::assign`] matching the
    /// `__sanitizer_cov_trace_pc_guard_init(start, stop)` callback.
    ///
    /// # Safety
    /// `start..stop` must be a valid, writable, properly aligned guard section
    /// not concurrently accessed by anything but the instrumentation.
    pub unsafe fn assign_raw(&self, start: *mut u32, stop: *mut u32) -> Result<usize, GuardError> {
        if start == stop {
            return Ok(0);
        }
        if start > stop {
            return Err(GuardError::InvalidRange {
                start: start as usize,
                stop: stop as usize,
            });
        }
        // SAFETY: the caller guarantees `start..stop` is one live guard section.
        let guards = unsafe {
            let len = stop.offset_from(start) as usize;
            std::slice::from_raw_parts_mut(start, len)
        };
        self.assign(guards)
    }
}
