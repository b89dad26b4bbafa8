//! Process-wide diagnostic counters.
//!
//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent; a snapshot taken while other threads map or unmap
//! pages may be transiently inconsistent. Do NOT use these values for
//! allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    #[allow(dead_code)]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }

    #[inline]
    pub fn fetch_add(&self, val: usize, ordering: Ordering) -> usize {
        self.0.fetch_add(Self::delta(val), ordering).max(0).cast_unsigned()
    }
}

// Bytes currently mapped for arena pages, across all arenas
crate::sync::static_atomic! {
    pub static TOTAL_MAPPED: Counter = Counter::new();
}
// Arena pages currently mapped, across all arenas
crate::sync::static_atomic! {
    pub static ARENA_PAGES_LIVE: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Point-in-time copy of the process-wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_mapped: usize,
    pub arena_pages_live: usize,
}

impl MemoryStats {
    #[must_use]
    pub fn snapshot() -> Self {
        Self {
            total_mapped: TOTAL_MAPPED.get(),
            arena_pages_live: ARENA_PAGES_LIVE.get(),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_add_sub() {
        let counter = Counter::new();
        counter.add(10);
        counter.add(5);
        counter.sub(3);
        assert_eq!(counter.get(), 12);
        assert_eq!(counter.fetch_add(1, Ordering::Relaxed), 12);
        assert_eq!(counter.get(), 13);
    }

    #[test]
    fn test_counter_clamps_negative() {
        let counter = Counter::new();
        sub_saturating(&counter, 7);
        assert_eq!(counter.get(), 0);
        counter.add(10);
        assert_eq!(counter.get(), 3);
    }

    #[test]
    fn test_counter_clamps_huge_delta() {
        let counter = Counter::new();
        counter.add(usize::MAX);
        assert_eq!(counter.get(), isize::MAX as usize);
    }

    #[test]
    fn test_snapshot_reads_globals() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let before = MemoryStats::snapshot();
        TOTAL_MAPPED.add(4096);
        ARENA_PAGES_LIVE.add(1);
        let during = MemoryStats::snapshot();
        sub_saturating(&TOTAL_MAPPED, 4096);
        sub_saturating(&ARENA_PAGES_LIVE, 1);

        assert_eq!(during.total_mapped, before.total_mapped + 4096);
        assert_eq!(during.arena_pages_live, before.arena_pages_live + 1);
        assert_eq!(MemoryStats::snapshot(), before);
    }
}
