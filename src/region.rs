use core::ptr::NonNull;

/// The backing-memory provider: reserves one large contiguous, zero-filled,
/// page-aligned region of virtual memory and releases it wholesale.
///
/// This is the allocator's only boundary crossing. The call is assumed
/// synchronous; the only failure mode is an explicit `None`, which the
/// allocator surfaces as allocation failure.
pub trait RegionProvider {
    /// Reserves a zero-filled, page-aligned region of exactly `size` bytes.
    fn reserve_region(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Releases a region previously returned by [`Self::reserve_region`].
    ///
    /// # Safety
    ///
    /// `base` and `size` must be exactly the values of an earlier
    /// `reserve_region` call on this provider, and the region must not be
    /// accessed afterwards.
    unsafe fn release_region(&mut self, base: NonNull<u8>, size: usize);
}

/// A region provider backed by anonymous private `mmap(2)` mappings, which
/// the kernel hands out page aligned and zero filled.
#[cfg(feature = "use_libc")]
#[derive(Debug, Default)]
pub struct MmapRegionProvider;

#[cfg(feature = "use_libc")]
impl RegionProvider for MmapRegionProvider {
    fn reserve_region(&mut self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: an anonymous mapping with no requested address has no
        // preconditions to uphold.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            log::debug!("mmap of {} bytes failed", size);
            return None;
        }

        log::debug!("reserved {} byte region at {:p}", size, ptr);
        NonNull::new(ptr.cast())
    }

    unsafe fn release_region(&mut self, base: NonNull<u8>, size: usize) {
        log::debug!("releasing {} byte region at {:p}", size, base.as_ptr());
        libc::munmap(base.as_ptr().cast(), size);
    }
}

#[cfg(all(test, feature = "use_libc"))]
mod tests {
    use super::*;
    use crate::{align::is_aligned, PAGE_SIZE};

    #[test]
    fn mmap_regions_are_page_aligned_and_zeroed() {
        let mut provider = MmapRegionProvider;
        let size = 4 * PAGE_SIZE;

        let base = provider.reserve_region(size).unwrap();
        assert!(is_aligned(base.as_ptr() as usize, PAGE_SIZE));

        let bytes = unsafe { core::slice::from_raw_parts(base.as_ptr(), size) };
        assert!(bytes.iter().all(|&b| b == 0));

        unsafe { provider.release_region(base, size) };
    }
}
