use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(std::io::Error),
    CommitFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e) | VmError::CommitFailed(e) | VmError::ReleaseFailed(e) => Some(e),
        }
    }
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Make a reserved range readable and writable.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;

    /// Reserve and commit `size` bytes in one step.
    ///
    /// Fresh anonymous mappings are zero-filled by the OS. On commit failure
    /// the reservation is released again so no address space leaks.
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: forwarded FFI preconditions are the caller's.
        let ptr = unsafe { Self::reserve(size)? };
        // Safety: ptr..ptr+size was just reserved.
        if let Err(e) = unsafe { Self::commit(ptr, size) } {
            // Safety: same reservation, never handed out.
            drop(unsafe { Self::release(ptr, size) });
            return Err(e);
        }
        Ok(ptr)
    }
}

pub(crate) struct PlatformVmOps;

// Test-only fault injection. Each flag fails the next matching call on the
// current thread, then clears itself.
#[cfg(all(test, not(loom)))]
thread_local! {
    static FAIL_NEXT_RESERVE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
    static FAIL_NEXT_RELEASE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Make the next `reserve` on the calling thread fail with `ENOMEM`.
#[cfg(all(test, not(loom)))]
pub(crate) fn fail_next_reserve() {
    FAIL_NEXT_RESERVE.with(|flag| flag.set(true));
}

/// Make the next `release` on the calling thread report failure. The memory
/// is still returned to the OS.
#[cfg(all(test, not(loom)))]
pub(crate) fn fail_next_release() {
    FAIL_NEXT_RELEASE.with(|flag| flag.set(true));
}

#[cfg(all(test, not(loom)))]
fn take_injected_reserve_failure() -> bool {
    FAIL_NEXT_RESERVE.with(|flag| flag.replace(false))
}

#[cfg(all(test, not(loom)))]
fn take_injected_release_failure() -> bool {
    FAIL_NEXT_RELEASE.with(|flag| flag.replace(false))
}

#[cfg(not(any(unix, loom, miri)))]
compile_error!("pagearena maps pages through mmap and supports only unix targets.");

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, VmError, PlatformVmOps, VmOps};
    use libc;
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            #[cfg(test)]
            if super::take_injected_reserve_failure() {
                return Err(VmError::ReservationFailed(io::Error::from_raw_os_error(
                    libc::ENOMEM,
                )));
            }

            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            #[cfg(test)]
            if super::take_injected_release_failure() {
                return Err(VmError::ReleaseFailed(io::Error::from_raw_os_error(
                    libc::EINVAL,
                )));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom / Miri mock: heap-backed VmOps (no real mmap)
//
// Loom runs every model inside one process with its own scheduler and Miri
// cannot execute mmap, so each "reservation" is a zeroed heap block with
// page alignment. `commit` is a no-op because the block is always
// accessible; `release` frees it.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        #[cfg(all(test, not(loom)))]
        if take_injected_reserve_failure() {
            return Err(VmError::ReservationFailed(std::io::Error::from(
                std::io::ErrorKind::OutOfMemory,
            )));
        }
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        #[cfg(all(test, not(loom)))]
        if take_injected_release_failure() {
            return Err(VmError::ReleaseFailed(std::io::Error::other("injected")));
        }
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size).expect("Commit failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            assert_eq!(slice[0], 42);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_reserve_zero_size() {
        // mmap with 0 size fails with EINVAL.
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::reserve(0) };
        assert!(result.is_err(), "Reserving 0 bytes should fail");
        assert!(matches!(result, Err(VmError::ReservationFailed(_))));
    }

    #[test]
    fn test_map_is_zero_filled_and_writable() {
        let size = PlatformVmOps::page_size() * 2;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size).expect("Map failed");
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            assert!(slice.iter().all(|&b| b == 0), "fresh mapping must be zeroed");

            slice[0] = 0xDE;
            slice[size - 1] = 0xAD;
            assert_eq!(slice[0], 0xDE);
            assert_eq!(slice[size - 1], 0xAD);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_map_zero_size_fails() {
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::map(0) };
        assert!(result.is_err());
    }

    #[test]
    fn test_injected_failure_hits_next_reserve_only() {
        let size = PlatformVmOps::page_size();
        fail_next_reserve();
        // Safety: Test code.
        unsafe {
            let err = PlatformVmOps::map(size).unwrap_err();
            assert!(matches!(err, VmError::ReservationFailed(ref e) if e.raw_os_error() == Some(libc::ENOMEM)));

            let ptr = PlatformVmOps::map(size).expect("Map after injected failure failed");
            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert!(size.is_power_of_two(), "Page size {size} is not power of two");
    }

    #[test]
    fn test_multiple_mappings_are_independent() {
        let page_size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr1 = PlatformVmOps::map(page_size).expect("Map 1 failed");
            let ptr2 = PlatformVmOps::map(page_size).expect("Map 2 failed");

            assert_ne!(ptr1, ptr2);

            *(ptr1.as_ptr()) = 1;
            *(ptr2.as_ptr()) = 2;

            PlatformVmOps::release(ptr1, page_size).expect("Release 1 failed");

            // ptr2 should still be valid
            assert_eq!(*(ptr2.as_ptr()), 2);

            PlatformVmOps::release(ptr2, page_size).expect("Release 2 failed");
        }
    }

    #[test]
    fn test_error_display_and_source() {
        let err = VmError::ReservationFailed(std::io::Error::new(
            std::io::ErrorKind::OutOfMemory,
            "no address space",
        ));
        assert!(err.to_string().contains("VM reservation failed"));
        assert!(std::error::Error::source(&err).is_some());

        let err = VmError::ReleaseFailed(std::io::Error::from_raw_os_error(libc::EINVAL));
        assert!(err.to_string().starts_with("VM release failed: "));
    }
}
