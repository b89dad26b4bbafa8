//! Size classes and the intrusive per-class recycling stacks.
//!
//! A freed block becomes a [`FreeBlock`] for as long as it sits on a stack:
//! its first word holds the link to the block freed before it. Popping hands
//! the bytes back as plain memory; the link word is not cleared.

use std::ptr::NonNull;

/// Granularity of every block size and of every block address.
pub const ALIGNMENT: usize = 8;

/// 64-bit canary written into the second word of freed blocks that are large
/// enough to hold it. Checked on pop to catch writes through dangling pointers.
/// Only active when debug assertions are enabled.
#[cfg(debug_assertions)]
const FREE_CANARY: u64 = 0xF4EE_B10C_DEAD_BEEF;

/// Round `size` up to the next multiple of [`ALIGNMENT`].
///
/// Returns `None` on overflow.
#[inline]
#[must_use]
pub fn round_up(size: usize) -> Option<usize> {
    size.checked_next_multiple_of(ALIGNMENT)
}

/// Size class index for an already rounded, non-zero size.
#[inline]
#[must_use]
pub fn class_index(rounded: usize) -> usize {
    debug_assert!(rounded != 0 && rounded.is_multiple_of(ALIGNMENT));
    rounded / ALIGNMENT - 1
}

/// Block size served by class `index`.
#[inline]
#[must_use]
pub fn class_size(index: usize) -> usize {
    (index + 1) * ALIGNMENT
}

#[repr(C)]
struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

/// LIFO stack of freed blocks of one size class.
struct FreeList {
    head: Option<NonNull<FreeBlock>>,
    len: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// # Safety
    /// `block` must be writable for at least one pointer and must not be on
    /// any free list already.
    unsafe fn push(&mut self, block: NonNull<u8>) {
        let node = block.cast::<FreeBlock>();
        // Safety: caller guarantees the first word is writable and aligned.
        unsafe { node.as_ptr().write(FreeBlock { next: self.head }) };
        self.head = Some(node);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let node = self.head?;
        // Safety: every node on the list was written by `push`.
        self.head = unsafe { node.as_ref().next };
        self.len -= 1;
        Some(node.cast())
    }
}

/// One [`FreeList`] per size class; class `k` holds blocks of `(k + 1) * 8`
/// bytes.
pub(crate) struct FreeLists {
    lists: Box<[FreeList]>,
}

impl FreeLists {
    pub(crate) fn new(class_count: usize) -> Self {
        Self {
            lists: (0..class_count).map(|_| FreeList::new()).collect(),
        }
    }

    pub(crate) fn class_count(&self) -> usize {
        self.lists.len()
    }

    /// Pop the most recently freed block of class `index`.
    pub(crate) fn pop(&mut self, index: usize) -> Option<NonNull<u8>> {
        let block = self.lists.get_mut(index)?.pop()?;

        #[cfg(debug_assertions)]
        if class_size(index) >= 2 * size_of::<u64>() {
            // Safety: the block holds at least two words and was stamped in `push`.
            let canary = unsafe { block.as_ptr().cast::<u64>().add(1).read() };
            assert!(
                canary == FREE_CANARY,
                "pagearena corruption: free-block canary at {block:p}+8 was 0x{canary:016x}, \
                 expected 0x{FREE_CANARY:016x} (written after free?)"
            );
        }

        Some(block)
    }

    /// Push `block` onto the stack for class `index`.
    ///
    /// # Safety
    /// `block` must be a live allocation of exactly `class_size(index)` bytes
    /// that is not already on a free list.
    pub(crate) unsafe fn push(&mut self, index: usize, block: NonNull<u8>) {
        debug_assert!(index < self.lists.len(), "size class {index} out of range");

        #[cfg(debug_assertions)]
        if class_size(index) >= 2 * size_of::<u64>() {
            // Safety: the block holds at least two words.
            unsafe { block.as_ptr().cast::<u64>().add(1).write(FREE_CANARY) };
        }

        // Safety: forwarded from the caller.
        unsafe { self.lists[index].push(block) };
    }

    /// Number of blocks waiting on class `index`.
    pub(crate) fn len(&self, index: usize) -> usize {
        self.lists.get(index).map_or(0, |list| list.len)
    }

    /// Blocks waiting across all classes.
    pub(crate) fn total_len(&self) -> usize {
        self.lists.iter().map(|list| list.len).sum()
    }

    /// Bytes held by blocks waiting across all classes.
    pub(crate) fn total_bytes(&self) -> usize {
        self.lists
            .iter()
            .enumerate()
            .map(|(index, list)| list.len * class_size(index))
            .sum()
    }
}
