//! Slot-relative addressing.
//!
//! A relative offset is the distance from the address of the slot that stores
//! it to the address it refers to. Directory entries live inside the page they
//! describe, so every distance is bounded by the page size and fits in a
//! [`RelOffset`] regardless of where the page is mapped.

/// Fixed-width relative offset as stored in a page directory.
pub(crate) type RelOffset = u32;

/// Offset from `slot` to `target`, or `None` when `target` precedes `slot`
/// or lies further away than a [`RelOffset`] can express.
#[inline]
pub(crate) fn encode(slot: usize, target: usize) -> Option<RelOffset> {
    let distance = target.checked_sub(slot)?;
    RelOffset::try_from(distance).ok()
}

/// Absolute address `offset` bytes past `slot`.
#[inline]
pub(crate) fn decode(slot: usize, offset: RelOffset) -> usize {
    slot + offset as usize
}

/// Store `target` in `*slot` relative to the slot's own address.
///
/// # Safety
/// `slot` must be valid for a write of one [`RelOffset`].
///
/// # Panics
///
/// Panics in debug builds if `target` is not encodable from `slot`.
#[inline]
pub(crate) unsafe fn store(slot: *mut RelOffset, target: usize) {
    let encoded = encode(slot as usize, target);
    debug_assert!(
        encoded.is_some(),
        "relative offset out of range: slot {slot:p}, target {target:#x}"
    );
    // Safety: caller guarantees `slot` is writable.
    unsafe { slot.write(encoded.unwrap_or_default()) };
}

/// Read `*slot` and translate it back to an absolute address.
///
/// # Safety
/// `slot` must be valid for a read of one [`RelOffset`].
#[inline]
pub(crate) unsafe fn load(slot: *const RelOffset) -> usize {
    // Safety: caller guarantees `slot` is readable.
    decode(slot as usize, unsafe { slot.read() })
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let slot = 0x7f00_0000_1000usize;
        let target = slot + 2056;
        let r = encode(slot, target).unwrap();
        assert_eq!(r, 2056);
        assert_eq!(decode(slot, r), target);
    }

    #[test]
    fn test_encode_rejects_backwards_and_far_targets() {
        let slot = 0x1000usize;
        assert_eq!(encode(slot, slot - 8), None);
        assert_eq!(encode(slot, slot + (1usize << 33)), None);
        assert_eq!(encode(slot, slot), Some(0));
    }

    #[test]
    fn test_store_load_in_place() {
        let mut words = [0 as RelOffset; 4];
        let slot: *mut RelOffset = &raw mut words[1];
        let target = slot as usize + 40;
        // Safety: Test code, slot points into `words`.
        unsafe {
            store(slot, target);
            assert_eq!(*slot, 40);
            assert_eq!(load(slot), target);
        }
    }

    #[test]
    fn test_same_target_from_different_slots() {
        // Each slot encodes its own distance; decoding recovers the same target.
        let mut words = [0 as RelOffset; 3];
        let base: *mut RelOffset = words.as_mut_ptr();
        let target = base as usize + 64;
        // Safety: Test code.
        unsafe {
            for i in 0..3 {
                store(base.add(i), target);
            }
            assert_eq!(words, [64, 60, 56]);
            for i in 0..3 {
                assert_eq!(load(base.add(i)), target);
            }
        }
    }
}
