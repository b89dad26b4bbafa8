//! Arena pages.
//!
//! ```text
//!   0        4        8                          8 + 4*D            page_size
//!   ┌────────┬────────┬──────────────────────────┬─────────────────────────┐
//!   │capacity│  used  │ directory[0..D]  (u32)   │   byte region (bump)    │
//!   └────────┴────────┴──────────────────────────┴─────────────────────────┘
//! ```
//!
//! `directory[i]` holds, relative to its own slot, the address where
//! allocation `i` begins; `directory[i + 1]` holds where it ends and the next
//! one begins. Only `directory[0..=used]` is meaningful.

use super::free_list::ALIGNMENT;
use super::relptr::{self, RelOffset};
use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::atomic::{AtomicU32, Ordering};
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Upper bound for a configured page size; directory offsets are 32-bit.
pub(crate) const MAX_PAGE_SIZE: usize = 1 << 30;

#[repr(C)]
struct PageHeader {
    capacity: AtomicU32,
    used: AtomicU32,
}

const HEADER_SIZE: usize = size_of::<PageHeader>();

/// Page geometry derived from the configured page size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaLayout {
    /// Bytes mapped per page.
    pub page_size: usize,
    /// Directory slots per page (`page_size / 8`).
    pub directory_len: usize,
    /// Number of free-list size classes (`page_size / 16`).
    pub class_count: usize,
    /// Offset of the byte region from the start of the page.
    pub region_offset: usize,
    /// Largest block a fresh page can hold. An allocation must end strictly
    /// before the page end, so this is at least one alignment unit short of
    /// the region; it is rounded down so that half of it stays aligned.
    pub page_capacity: usize,
    /// Largest request `allocate` accepts.
    pub max_alloc_size: usize,
}

impl ArenaLayout {
    /// Geometry for `page_size`, which must be a power of two no smaller than 256.
    pub(crate) fn new(page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two() && page_size >= 256);
        let directory_len = page_size / 8;
        let class_count = page_size / 16;
        let region_offset = HEADER_SIZE + directory_len * size_of::<RelOffset>();
        // Two blocks of `page_capacity / 2` must share one fresh page whatever
        // the header size.
        let page_capacity =
            (page_size - region_offset - ALIGNMENT) / (2 * ALIGNMENT) * (2 * ALIGNMENT);
        let max_alloc_size = page_capacity.min(class_count * ALIGNMENT);
        Self {
            page_size,
            directory_len,
            class_count,
            region_offset,
            page_capacity,
            max_alloc_size,
        }
    }
}

/// Handle to one mapped arena page.
pub(crate) struct Page {
    base: NonNull<u8>,
    /// Directory slots whose allocation currently sits on a free list.
    #[cfg(debug_assertions)]
    freed: FixedBitSet,
}

impl Page {
    /// Map a zeroed page from the OS and seed its bump cursor.
    pub(crate) fn map(layout: &ArenaLayout) -> Result<Self, VmError> {
        // Safety: FFI call to map a fresh region.
        let base = unsafe { PlatformVmOps::map(layout.page_size)? };

        // directory_len <= MAX_PAGE_SIZE / 8, so it always fits.
        let slots = u32::try_from(layout.directory_len).unwrap_or(u32::MAX);
        let header = PageHeader {
            capacity: AtomicU32::new(slots),
            used: AtomicU32::new(0),
        };
        // Safety: the mapping is page aligned and at least HEADER_SIZE bytes.
        unsafe { base.as_ptr().cast::<PageHeader>().write(header) };

        let page = Self {
            base,
            #[cfg(debug_assertions)]
            freed: FixedBitSet::with_capacity(layout.directory_len),
        };
        // Safety: slot 0 is inside the directory.
        unsafe { relptr::store(page.slot(0), page.base_addr() + layout.region_offset) };

        stats::TOTAL_MAPPED.fetch_add(layout.page_size, Ordering::Relaxed);
        stats::ARENA_PAGES_LIVE.fetch_add(1, Ordering::Relaxed);

        Ok(page)
    }

    /// Return the page to the OS. Every pointer into it becomes invalid.
    pub(crate) fn release(self, layout: &ArenaLayout) -> Result<(), VmError> {
        // Safety: the header was written in `map` and is dropped exactly once.
        unsafe { std::ptr::drop_in_place(self.base.as_ptr().cast::<PageHeader>()) };
        // Safety: base/page_size is the mapping created in `map`.
        unsafe { PlatformVmOps::release(self.base, layout.page_size)? };

        stats::sub_saturating(&stats::TOTAL_MAPPED, layout.page_size);
        stats::sub_saturating(&stats::ARENA_PAGES_LIVE, 1);
        Ok(())
    }

    fn header(&self) -> &PageHeader {
        // Safety: written in `map`, lives until `release` consumes self.
        unsafe { self.base.cast::<PageHeader>().as_ref() }
    }

    fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn slot(&self, index: usize) -> *mut RelOffset {
        // Safety: callers only pass indices below directory_len, which keeps
        // the slot inside the mapping.
        unsafe { self.base.as_ptr().add(HEADER_SIZE).cast::<RelOffset>().add(index) }
    }

    /// Absolute address stored in `directory[index]`.
    fn boundary(&self, index: usize) -> usize {
        // Safety: slot is inside the directory and was written before `used` passed it.
        unsafe { relptr::load(self.slot(index)) }
    }

    pub(crate) fn used(&self) -> usize {
        self.header().used.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn capacity(&self) -> usize {
        self.header().capacity.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn is_frozen(&self, layout: &ArenaLayout) -> bool {
        self.capacity() < layout.directory_len
    }

    /// Current bump cursor.
    pub(crate) fn cursor(&self) -> usize {
        self.boundary(self.used())
    }

    fn end(&self, layout: &ArenaLayout) -> usize {
        self.base_addr() + layout.page_size
    }

    /// Bytes between the bump cursor and the page end.
    pub(crate) fn remaining(&self, layout: &ArenaLayout) -> usize {
        self.end(layout) - self.cursor()
    }

    /// Bytes handed out by bump allocation so far.
    pub(crate) fn bumped_bytes(&self, layout: &ArenaLayout) -> usize {
        self.cursor() - (self.base_addr() + layout.region_offset)
    }

    /// Carve `size` bytes (already rounded) off the bump cursor.
    ///
    /// Returns `None` when the block would reach the page end or no directory
    /// slot is left to record where it ends.
    pub(crate) fn try_bump(&self, size: usize, layout: &ArenaLayout) -> Option<NonNull<u8>> {
        let used = self.used();
        if used + 1 >= self.capacity() {
            return None;
        }
        let start = self.boundary(used);
        let end = start.checked_add(size)?;
        if end >= self.end(layout) {
            return None;
        }
        // Safety: used + 1 < capacity <= directory_len.
        unsafe { relptr::store(self.slot(used + 1), end) };
        let next = u32::try_from(used + 1).unwrap_or(u32::MAX);
        self.header().used.store(next, Ordering::Relaxed);
        // Safety: start lies inside this mapping; derive it from `base` to keep provenance.
        Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start - self.base_addr())) })
    }

    /// Stop the page from growing any further.
    pub(crate) fn freeze(&self) {
        let used = self.header().used.load(Ordering::Relaxed);
        self.header().capacity.store(used, Ordering::Relaxed);
    }

    /// True if `addr` lies inside this page's byte region.
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    pub(crate) fn contains(&self, addr: usize, layout: &ArenaLayout) -> bool {
        addr >= self.base_addr() + layout.region_offset && addr < self.end(layout)
    }

    /// Boundaries `directory[0..=used]` as absolute addresses.
    #[cfg(test)]
    pub(crate) fn boundaries(&self) -> impl Iterator<Item = usize> + '_ {
        (0..=self.used()).map(|i| self.boundary(i))
    }

    /// Directory index and recorded length of the allocation starting at `addr`.
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    pub(crate) fn find_allocation(&self, addr: usize) -> Option<(usize, usize)> {
        let used = self.used();
        let (mut lo, mut hi) = (0, used);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let start = self.boundary(mid);
            if start == addr {
                return Some((mid, self.boundary(mid + 1) - start));
            }
            if start < addr {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        None
    }

    #[cfg(debug_assertions)]
    pub(crate) fn freed_mut(&mut self) -> &mut FixedBitSet {
        &mut self.freed
    }
}

/// Look up the page and directory slot of `addr` and check the caller's size.
///
/// Used by debug builds to turn free-list corruption into an immediate panic.
#[cfg(debug_assertions)]
pub(crate) fn debug_check_free(
    pages: &mut [Page],
    layout: &ArenaLayout,
    addr: usize,
    rounded: usize,
) {
    let page = pages.iter_mut().find(|p| p.contains(addr, layout));
    let Some(page) = page else {
        panic!("pagearena misuse: {addr:#x} does not belong to this arena");
    };
    let Some((slot, len)) = page.find_allocation(addr) else {
        panic!("pagearena misuse: {addr:#x} is not the start of an allocation");
    };
    assert!(
        len == rounded,
        "pagearena misuse: freeing {addr:#x} with size {rounded}, but it was allocated with size {len}"
    );
    assert!(
        !page.freed_mut().contains(slot),
        "pagearena misuse: double free of {addr:#x}"
    );
    page.freed_mut().insert(slot);
}

/// Clear the freed mark of a block that is being handed out again.
#[cfg(debug_assertions)]
pub(crate) fn debug_mark_reused(pages: &mut [Page], layout: &ArenaLayout, addr: usize) {
    if let Some(page) = pages.iter_mut().find(|p| p.contains(addr, layout)) {
        if let Some((slot, _)) = page.find_allocation(addr) {
            page.freed_mut().set(slot, false);
        }
    }
}

#[cfg(test)]
mod layout_tests {
    use super::*;

    // Pure arithmetic; runs under loom as well, where the header is larger.
    #[test]
    fn test_half_capacity_pairs_fit_any_page_size() {
        let mut page_size = 256;
        while page_size <= MAX_PAGE_SIZE {
            let l = ArenaLayout::new(page_size);
            let half = l.page_capacity / 2;
            assert!(half.is_multiple_of(ALIGNMENT), "{l:?}");
            assert!(l.region_offset.is_multiple_of(ALIGNMENT), "{l:?}");
            assert!(
                l.region_offset + 2 * half < page_size,
                "two half-capacity blocks must fit one page: {l:?}"
            );
            assert!(
                l.region_offset + 3 * half >= page_size,
                "a third half-capacity block must not fit: {l:?}"
            );
            assert!(l.max_alloc_size <= l.page_capacity, "{l:?}");
            page_size *= 2;
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn layout() -> ArenaLayout {
        ArenaLayout::new(PlatformVmOps::page_size())
    }

    #[test]
    fn test_layout_4k() {
        let l = ArenaLayout::new(4096);
        assert_eq!(l.directory_len, 512);
        assert_eq!(l.class_count, 256);
        assert_eq!(l.region_offset, 8 + 2048);
        assert_eq!(l.page_capacity, 2032);
        assert_eq!(l.max_alloc_size, 2032);
        assert!(l.region_offset.is_multiple_of(ALIGNMENT));
    }

    #[test]
    fn test_layout_scales_with_page_size() {
        let l = ArenaLayout::new(16384);
        assert_eq!(l.directory_len, 2048);
        assert_eq!(l.class_count, 1024);
        assert_eq!(l.page_capacity, 16384 - 8 - 8192 - 8);
        assert_eq!(l.max_alloc_size, l.page_capacity);
        assert!((l.page_capacity / 2).is_multiple_of(ALIGNMENT));
    }

    #[test]
    fn test_fresh_page_state() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let l = layout();
        let page = Page::map(&l).unwrap();
        assert_eq!(page.used(), 0);
        assert_eq!(page.capacity(), l.directory_len);
        assert!(!page.is_frozen(&l));
        assert_eq!(page.cursor(), page.base_addr() + l.region_offset);
        assert_eq!(page.remaining(&l), l.page_capacity + ALIGNMENT);
        assert_eq!(page.bumped_bytes(&l), 0);
        page.release(&l).unwrap();
    }

    #[test]
    fn test_bump_records_boundaries() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let l = layout();
        let page = Page::map(&l).unwrap();

        let a = page.try_bump(8, &l).unwrap().as_ptr() as usize;
        let b = page.try_bump(24, &l).unwrap().as_ptr() as usize;
        let c = page.try_bump(16, &l).unwrap().as_ptr() as usize;

        assert_eq!(b, a + 8);
        assert_eq!(c, b + 24);
        assert_eq!(page.used(), 3);
        let bounds: Vec<usize> = page.boundaries().collect();
        assert_eq!(bounds, vec![a, b, c, c + 16]);

        assert_eq!(page.find_allocation(a), Some((0, 8)));
        assert_eq!(page.find_allocation(b), Some((1, 24)));
        assert_eq!(page.find_allocation(c), Some((2, 16)));
        assert_eq!(page.find_allocation(a + 8 + 8), None);
        assert_eq!(page.find_allocation(c + 16), None);

        page.release(&l).unwrap();
    }

    #[test]
    fn test_bump_refuses_to_reach_page_end() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let l = layout();
        let page = Page::map(&l).unwrap();

        let remaining = page.remaining(&l);
        assert!(page.try_bump(remaining, &l).is_none());
        assert_eq!(page.used(), 0, "failed bump must not record a boundary");

        assert!(page.try_bump(remaining - ALIGNMENT, &l).is_some());
        assert_eq!(page.remaining(&l), ALIGNMENT);
        assert!(page.try_bump(ALIGNMENT, &l).is_none());

        page.release(&l).unwrap();
    }

    #[test]
    fn test_freeze_stops_growth() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let l = layout();
        let page = Page::map(&l).unwrap();
        assert!(page.try_bump(8, &l).is_some());

        page.freeze();
        assert!(page.is_frozen(&l));
        assert_eq!(page.capacity(), 1);
        assert!(page.try_bump(8, &l).is_none());

        page.release(&l).unwrap();
    }

    #[test]
    fn test_contains() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let l = layout();
        let page = Page::map(&l).unwrap();
        let base = page.base_addr();
        assert!(!page.contains(base, &l), "header is not part of the byte region");
        assert!(page.contains(base + l.region_offset, &l));
        assert!(page.contains(base + l.page_size - 1, &l));
        assert!(!page.contains(base + l.page_size, &l));
        page.release(&l).unwrap();
    }

    #[test]
    fn test_map_updates_global_stats() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let l = layout();
        let before = stats::TOTAL_MAPPED.load(Ordering::Relaxed);
        let pages_before = stats::ARENA_PAGES_LIVE.load(Ordering::Relaxed);

        let page = Page::map(&l).unwrap();
        assert_eq!(stats::TOTAL_MAPPED.load(Ordering::Relaxed), before + l.page_size);
        assert_eq!(stats::ARENA_PAGES_LIVE.load(Ordering::Relaxed), pages_before + 1);

        page.release(&l).unwrap();
        assert_eq!(stats::TOTAL_MAPPED.load(Ordering::Relaxed), before);
        assert_eq!(stats::ARENA_PAGES_LIVE.load(Ordering::Relaxed), pages_before);
    }
}
