use super::free_list::{self, FreeLists};
use super::page::{ArenaLayout, MAX_PAGE_SIZE, Page};
use super::vm::{PlatformVmOps, VmError, VmOps};
use std::fmt;
use std::ptr::NonNull;
use tracing::{debug, trace, warn};

/// Smallest page size whose directory and byte region are both useful.
const MIN_PAGE_SIZE: usize = 256;

#[derive(Debug)]
pub enum ArenaError {
    /// The OS refused to map a page.
    Vm(VmError),
    /// `allocate(0)`.
    ZeroSize,
    /// The rounded request exceeds the largest size class a page can serve.
    TooLarge { size: usize, max: usize },
    InvalidConfig(String),
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaError::Vm(e) => write!(f, "arena page mapping failed: {e}"),
            ArenaError::ZeroSize => write!(f, "zero-size allocation requested"),
            ArenaError::TooLarge { size, max } => {
                write!(f, "allocation of {size} bytes exceeds arena limit of {max} bytes")
            }
            ArenaError::InvalidConfig(msg) => write!(f, "invalid arena configuration: {msg}"),
        }
    }
}

impl std::error::Error for ArenaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ArenaError::Vm(e) => Some(e),
            ArenaError::ZeroSize | ArenaError::TooLarge { .. } | ArenaError::InvalidConfig(_) => None,
        }
    }
}

impl From<VmError> for ArenaError {
    fn from(e: VmError) -> Self {
        ArenaError::Vm(e)
    }
}

/// Configuration for `Arena`. All fields have sensible defaults.
/// Set at construction via `Arena::with_config()`.
#[derive(Clone, Debug, Default)]
pub struct ArenaConfig {
    /// Bytes per arena page. Must be a power of two and a multiple of the OS
    /// page size. Default: `0` = OS page size.
    pub page_size: usize,
}

impl ArenaConfig {
    fn resolve_layout(&self) -> Result<ArenaLayout, ArenaError> {
        let os_page = PlatformVmOps::page_size();
        let page_size = if self.page_size == 0 { os_page } else { self.page_size };

        if !page_size.is_power_of_two() {
            return Err(ArenaError::InvalidConfig(format!(
                "page size {page_size} is not a power of two"
            )));
        }
        if page_size < MIN_PAGE_SIZE || page_size > MAX_PAGE_SIZE {
            return Err(ArenaError::InvalidConfig(format!(
                "page size {page_size} outside {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}"
            )));
        }
        if !page_size.is_multiple_of(os_page) {
            return Err(ArenaError::InvalidConfig(format!(
                "page size {page_size} is not a multiple of the OS page size {os_page}"
            )));
        }
        Ok(ArenaLayout::new(page_size))
    }
}

/// Per-arena usage numbers, computed on demand from page headers and free lists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Pages currently mapped by this arena.
    pub pages: usize,
    /// Pages that were abandoned when they could no longer satisfy a request.
    pub frozen_pages: usize,
    pub mapped_bytes: usize,
    /// Blocks carved by bump allocation over the arena's lifetime.
    pub bump_allocations: usize,
    pub bump_bytes: usize,
    /// Freed blocks waiting on the free lists.
    pub recycled_blocks: usize,
    pub recycled_bytes: usize,
}

/// Page-backed arena with per-size-class recycling.
///
/// Blocks are rounded up to multiples of 8 bytes. A request is served from
/// the free list of its size class when possible, otherwise bump allocated
/// from the newest page; a page that cannot fit the request is frozen and a
/// fresh one is mapped. Freed blocks go back to their free list and are never
/// returned to the OS before the arena is destroyed.
///
/// An arena has a single owner: every mutating call takes `&mut self`. Share
/// one across threads only behind a lock.
pub struct Arena {
    layout: ArenaLayout,
    /// Oldest first; the last page is the allocation target.
    pages: Vec<Page>,
    free: FreeLists,
}

// Arena owns its pages and every block on its free lists; nothing is shared.
// Safety: the raw pointers it holds are only reachable through `&mut self`.
unsafe impl Send for Arena {}

impl Arena {
    /// Create an arena with one mapped page of the OS page size.
    ///
    /// # Errors
    ///
    /// Returns `ArenaError::Vm` if the first page cannot be mapped.
    pub fn new() -> Result<Self, ArenaError> {
        Self::with_config(ArenaConfig::default())
    }

    /// Create an arena with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns `ArenaError::InvalidConfig` for an unusable page size and
    /// `ArenaError::Vm` if the first page cannot be mapped.
    pub fn with_config(config: ArenaConfig) -> Result<Self, ArenaError> {
        let layout = config.resolve_layout()?;
        let mut arena = Self {
            layout,
            pages: Vec::new(),
            free: FreeLists::new(layout.class_count),
        };
        arena.extend()?;
        Ok(arena)
    }

    /// Allocate `size` bytes, 8-byte aligned.
    ///
    /// The block stays valid until it is passed to
    /// [`deallocate`](Self::deallocate) or the arena is destroyed. Its
    /// contents are only zeroed when it comes fresh from a newly mapped page.
    ///
    /// # Errors
    ///
    /// - `ArenaError::ZeroSize` for `size == 0`.
    /// - `ArenaError::TooLarge` if the rounded size exceeds
    ///   [`ArenaLayout::max_alloc_size`].
    /// - `ArenaError::Vm` if a new page is needed and the OS refuses it; the
    ///   arena is left unchanged.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, ArenaError> {
        let rounded = self.checked_round(size)?;
        let class = free_list::class_index(rounded);

        if let Some(block) = self.free.pop(class) {
            #[cfg(debug_assertions)]
            super::page::debug_mark_reused(&mut self.pages, &self.layout, block.as_ptr() as usize);
            return Ok(block);
        }

        if self.pages.is_empty() {
            self.extend()?;
        }

        loop {
            let current = self.current_page();
            if let Some(block) = current.try_bump(rounded, &self.layout) {
                return Ok(block);
            }
            trace!(
                page = self.pages.len() - 1,
                used = current.used(),
                remaining = current.remaining(&self.layout),
                request = rounded,
                "arena page exhausted"
            );
            self.extend()?;
        }
    }

    /// Return a block to the free list of its size class.
    ///
    /// A null `ptr` or a zero `size` is ignored. Memory is never handed back
    /// to the OS here.
    ///
    /// # Safety
    /// - `ptr` must have been returned by [`allocate`](Self::allocate) on this
    ///   arena and not freed since.
    /// - `size` must be the size passed to that `allocate` call (anything that
    ///   rounds to the same multiple of 8 is equivalent).
    /// - `ptr` must not be used after this call.
    ///
    /// Release builds do not check any of this; a violation silently corrupts
    /// the free list. Debug builds panic on foreign pointers, size mismatches
    /// and double frees.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8, size: usize) {
        let Some(block) = NonNull::new(ptr) else {
            return;
        };
        if size == 0 {
            return;
        }
        let Some(rounded) = free_list::round_up(size) else {
            debug_assert!(false, "pagearena misuse: freeing {ptr:p} with size {size}");
            return;
        };
        let class = free_list::class_index(rounded);
        if class >= self.free.class_count() {
            debug_assert!(false, "pagearena misuse: freeing {ptr:p} with size {size}");
            return;
        }

        #[cfg(debug_assertions)]
        super::page::debug_check_free(&mut self.pages, &self.layout, block.as_ptr() as usize, rounded);

        // Safety: caller guarantees `block` is a live allocation of `rounded` bytes.
        unsafe { self.free.push(class, block) };
    }

    /// Release every page back to the OS.
    ///
    /// All pages are released even if one fails; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns `VmError::ReleaseFailed` if the OS refuses to unmap a page.
    pub fn destroy(mut self) -> Result<(), VmError> {
        self.release_pages()
    }

    /// Page geometry of this arena.
    #[must_use]
    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Bytes between the current page's bump cursor and its end. A request
    /// of this many bytes or more forces a new page, unless it is above
    /// [`ArenaLayout::max_alloc_size`]: on a fresh page this value is larger
    /// than any block a page can hold, and such a request fails with
    /// `ArenaError::TooLarge` instead.
    #[must_use]
    pub fn remaining_in_current_page(&self) -> usize {
        self.pages.last().map_or(0, |page| page.remaining(&self.layout))
    }

    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let mut stats = ArenaStats {
            pages: self.pages.len(),
            mapped_bytes: self.pages.len() * self.layout.page_size,
            recycled_blocks: self.free.total_len(),
            recycled_bytes: self.free.total_bytes(),
            ..ArenaStats::default()
        };
        for page in &self.pages {
            stats.bump_allocations += page.used();
            stats.bump_bytes += page.bumped_bytes(&self.layout);
            if page.is_frozen(&self.layout) {
                stats.frozen_pages += 1;
            }
        }
        stats
    }

    /// Number of freed blocks waiting in the size class serving `size` bytes.
    #[must_use]
    pub fn free_blocks(&self, size: usize) -> usize {
        match free_list::round_up(size) {
            Some(rounded) if rounded != 0 => self.free.len(free_list::class_index(rounded)),
            _ => 0,
        }
    }

    fn checked_round(&self, size: usize) -> Result<usize, ArenaError> {
        if size == 0 {
            return Err(ArenaError::ZeroSize);
        }
        let max = self.layout.max_alloc_size;
        match free_list::round_up(size) {
            Some(rounded) if rounded <= max => Ok(rounded),
            _ => Err(ArenaError::TooLarge { size, max }),
        }
    }

    fn current_page(&self) -> &Page {
        // Every caller runs after `extend` succeeded at least once.
        &self.pages[self.pages.len() - 1]
    }

    /// Map a fresh page and make it the allocation target.
    ///
    /// The page is mapped before the previous one is frozen, so a mapping
    /// failure leaves the arena untouched.
    fn extend(&mut self) -> Result<(), VmError> {
        let page = Page::map(&self.layout)?;
        if let Some(previous) = self.pages.last() {
            previous.freeze();
        }
        debug!(
            page = self.pages.len(),
            page_size = self.layout.page_size,
            "mapped arena page"
        );
        self.pages.push(page);
        Ok(())
    }

    fn release_pages(&mut self) -> Result<(), VmError> {
        let count = self.pages.len();
        let mut first_err = None;
        for page in self.pages.drain(..) {
            if let Err(e) = page.release(&self.layout) {
                first_err.get_or_insert(e);
            }
        }
        // Every block on the free lists pointed into the released pages.
        self.free = FreeLists::new(self.layout.class_count);
        if count > 0 {
            debug!(pages = count, "released arena pages");
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // May run while unwinding; a panic here would abort.
        if let Err(e) = self.release_pages() {
            warn!(error = %e, "arena drop failed to release pages");
        }
    }
}
