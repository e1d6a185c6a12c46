#![no_std]

//! A user-space dynamic memory allocator over a single fixed arena, modeled
//! on glibc malloc's chunk/bin design: boundary-tag chunks, in-place
//! coalescing, and segregated free lists (fast bins, small bins, an unsorted
//! staging list and a large-chunk list).
//!
//! Every block carries a 32-byte header. While a block is allocated only the
//! first 16 header bytes are live; the two intrusive link slots, and the
//! `prev_size` slot of the physically following chunk, are handed to the user
//! as payload. Freed chunks are staged on the unsorted list and lazily
//! re-filed into their bins on the next allocation. Chunks up to the fast-bin
//! ceiling are never coalesced, which keeps small-object churn cheap at the
//! cost of some fragmentation; everything larger merges eagerly with free
//! neighbors through the boundary tags, or back into the wilderness when it
//! touches the top of the arena.
//!
//! ## Usage
//!
//! Create an allocator over a backing-memory provider and allocate from it:
//!
//! ```ignore
//! use afmalloc::{AfMalloc, MmapRegionProvider};
//!
//! let mut allocator = AfMalloc::new(MmapRegionProvider);
//! let ptr = allocator.malloc(100).unwrap();
//! unsafe { allocator.free(ptr) };
//! ```
//!
//! The arena is mapped lazily on the first allocation and released wholesale
//! when the allocator is dropped. There is exactly one region per allocator:
//! requests that cannot be satisfied from it fail with a typed error instead
//! of growing a second region.
//!
//! ## Features
//!
//! - **`spin`** (default): provides the [`SpinLockedAfMalloc`] wrapper which
//!   guards the whole arena with a single spinlock.
//! - **`use_libc`** (default): provides the [`MmapRegionProvider`] backed by
//!   anonymous `mmap(2)` mappings.

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod align;
mod bins;
mod chunks;
mod freelist;
mod region;

#[cfg(test)]
mod tests;

use core::fmt;
use core::ptr::NonNull;

use either::Either;
use static_assertions::const_assert_eq;

use align::{align_up, is_aligned};
use bins::{is_coalescable, Bin, SmallBinBitmap, BIN_SEARCH_WINDOW, FAST_BIN_COUNT, SMALL_BIN_COUNT};
use chunks::{ChunkOffset, HeapView};
use freelist::{FreeLists, LARGE_LIST, UNSORTED_LIST};

pub use bins::{FAST_BIN_RANGE_END, SMALL_BIN_RANGE_END};
#[cfg(feature = "use_libc")]
pub use region::MmapRegionProvider;
pub use region::RegionProvider;

pub(crate) const USIZE_SIZE: usize = core::mem::size_of::<usize>();

/// Every chunk boundary and every user pointer is aligned to this.
pub const ALIGNMENT: usize = 2 * USIZE_SIZE;

/// The size of a chunk header, which is also the smallest chunk size.
pub const HEADER_SIZE: usize = 2 * ALIGNMENT;

/// User data begins this many bytes into a chunk, right after the `prev_size`
/// and size words.
pub const USER_DATA_OFFSET: usize = ALIGNMENT;

pub const PAGE_SIZE: usize = 4096;

/// The fixed size of the single mapped region: 32 pages, or 128 KiB.
pub const MAX_HEAP_SIZE: usize = 32 * PAGE_SIZE;

// the header encoding assumes 64-bit words: 16-byte alignment leaves the top
// bit of the size word free for the boundary-tag flag.
const_assert_eq!(USIZE_SIZE, 8);
const_assert_eq!(HEADER_SIZE, 32);

/// Computes the chunk size needed to satisfy a user request of `user_size`
/// bytes.
///
/// Every allocation reserves one `usize` of header overhead on top of the
/// requested size: its own size word. The `prev_size` slot of the following
/// chunk is borrowed as the tail of the payload, which is why only 8 bytes
/// are added before rounding, and why anything up to 24 bytes fits in the
/// minimal 32-byte chunk.
pub fn required_chunk_size(user_size: usize) -> usize {
    if user_size + USIZE_SIZE <= HEADER_SIZE {
        return HEADER_SIZE;
    }
    align_up(user_size + USIZE_SIZE, ALIGNMENT)
}

/// Why an allocation request could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The request can never fit in the arena's fixed region.
    ArenaExhausted,

    /// The mapped region is exhausted and growing to a second region is
    /// unsupported.
    MultipleRegionsUnsupported,

    /// The backing-memory provider failed to reserve the region.
    BackingAllocationFailed,

    /// The operation is not implemented, by design.
    UnsupportedOperation,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            AllocError::ArenaExhausted => "allocation request exceeds the arena's fixed region size",
            AllocError::MultipleRegionsUnsupported => {
                "arena region is exhausted and a second region is unsupported"
            }
            AllocError::BackingAllocationFailed => {
                "the backing-memory provider failed to reserve a region"
            }
            AllocError::UnsupportedOperation => "the operation is not supported by this allocator",
        };
        f.write_str(message)
    }
}

/// The single heap region and all the bookkeeping that lives alongside it.
#[derive(Debug)]
pub(crate) struct Arena {
    /// The mapped region, `None` until the first allocation needs it.
    pub(crate) view: Option<HeapView>,

    /// The wilderness pointer: the offset where unclaimed memory starts.
    pub(crate) top: ChunkOffset,

    /// Total mapped bytes.
    pub(crate) allocated_size: usize,

    /// Uncarved bytes between `top` and the end of the mapping. Chunks
    /// sitting in free lists are not counted here.
    pub(crate) free_size: usize,

    pub(crate) lists: FreeLists,
    pub(crate) small_bin_bitmap: SmallBinBitmap,
}

/// Unlinks a free chunk that is being absorbed by a neighbor, and re-syncs
/// the small-bin occupancy bit of its size class if its bin is now empty.
fn unlink_absorbed(
    view: &mut HeapView,
    lists: &mut FreeLists,
    bitmap: &mut SmallBinBitmap,
    chunk: ChunkOffset,
) {
    let size = view.chunk_size(chunk);
    lists.unlink(view, chunk);
    if let Some(Bin::Small(index)) = Bin::for_chunk_size(size) {
        if lists.is_empty(FreeLists::small_list(index)) {
            bitmap.unset(index);
        }
    }
}

impl Arena {
    fn new() -> Self {
        Self {
            view: None,
            top: ChunkOffset::zero(),
            allocated_size: 0,
            free_size: 0,
            lists: FreeLists::new(),
            small_bin_bitmap: SmallBinBitmap::new(),
        }
    }

    fn is_mapped(&self) -> bool {
        self.view.is_some()
    }

    fn attach_region(&mut self, view: HeapView) {
        debug_assert!(!self.is_mapped());
        debug_assert!(is_aligned(view.base_addr(), PAGE_SIZE));
        self.allocated_size = view.size();
        self.free_size = view.size();
        self.top = ChunkOffset::zero();
        self.view = Some(view);
    }

    /// Can a chunk of `needed` bytes be carved from the wilderness? One
    /// header of slack is kept beyond `top` so boundary-tag writes at the
    /// edge of the carved area always stay inside the mapping.
    fn has_room_for(&self, needed: usize) -> bool {
        self.free_size >= needed + HEADER_SIZE
    }

    /// Carves a chunk of `needed` bytes from the top of the arena.
    fn carve(&mut self, needed: usize) -> NonNull<u8> {
        debug_assert!(self.has_room_for(needed));
        let view = self.view.as_mut().expect("carving from an unmapped arena");

        let chunk = self.top;
        view.write_fresh_header(chunk, needed);
        self.top = chunk.advance(needed);
        self.free_size -= needed;

        view.user_ptr(chunk)
    }

    /// Drains the unsorted list: takes the first chunk large enough for the
    /// request (first fit), re-filing every chunk walked over into its proper
    /// bin on the way.
    fn take_from_unsorted(&mut self, needed: usize) -> Option<ChunkOffset> {
        let Self {
            view,
            lists,
            small_bin_bitmap,
            ..
        } = self;
        let view = view.as_mut().expect("arena is mapped");

        while let Some(chunk) = lists.first(UNSORTED_LIST) {
            lists.unlink(view, chunk);

            let size = view.chunk_size(chunk);
            if size >= needed {
                return Some(chunk);
            }

            // too small for this request, file it where it belongs
            match Bin::for_chunk_size(size) {
                Some(Bin::Fast(index)) => {
                    lists.push_head(view, FreeLists::fast_list(index), chunk)
                }
                Some(Bin::Small(index)) => {
                    lists.push_head(view, FreeLists::small_list(index), chunk);
                    small_bin_bitmap.set(index);
                }
                None => lists.push_head(view, LARGE_LIST, chunk),
            }
        }

        None
    }

    /// Probes the bin of the exact size class and the next two classes above
    /// it. Fast bins are probed directly and yield their newest chunk; small
    /// bins consult the occupancy bitmap and yield their oldest.
    fn take_from_bin_window(&mut self, bin: Bin) -> Option<ChunkOffset> {
        let bitmap = self.small_bin_bitmap;
        let (lists_to_probe, take_oldest) = match bin {
            Bin::Fast(index) => {
                let end = FAST_BIN_COUNT.min(index + BIN_SEARCH_WINDOW);
                (Either::Left((index..end).map(FreeLists::fast_list)), false)
            }
            Bin::Small(index) => {
                let end = SMALL_BIN_COUNT.min(index + BIN_SEARCH_WINDOW);
                let non_empty = (index..end)
                    .filter(move |&class| bitmap.is_set(class))
                    .map(FreeLists::small_list);
                (Either::Right(non_empty), true)
            }
        };

        for list in lists_to_probe {
            let found = if take_oldest {
                self.lists.last(list)
            } else {
                self.lists.first(list)
            };
            let Some(chunk) = found else { continue };

            let Self {
                view,
                lists,
                small_bin_bitmap,
                ..
            } = self;
            let view = view.as_mut().expect("arena is mapped");

            lists.unlink(view, chunk);
            if let Some(index) = FreeLists::small_bin_index(list) {
                if lists.is_empty(list) {
                    small_bin_bitmap.unset(index);
                }
            }
            return Some(chunk);
        }

        None
    }

    /// Linear first-fit scan of the large-chunk list.
    fn take_from_large_list(&mut self, needed: usize) -> Option<ChunkOffset> {
        let Self { view, lists, .. } = self;
        let view = view.as_mut().expect("arena is mapped");

        let mut cursor = lists.first(LARGE_LIST);
        while let Some(chunk) = cursor {
            if view.chunk_size(chunk) >= needed {
                lists.unlink(view, chunk);
                return Some(chunk);
            }
            cursor = lists.next_in_list(view, chunk);
        }

        None
    }

    /// Hands a chunk taken from a free list over to the user: the `prev_size`
    /// slot of the following chunk now belongs to this allocation as borrowed
    /// payload, so its boundary tag is wiped.
    fn finish_takeover(&mut self, chunk: ChunkOffset) -> NonNull<u8> {
        let top = self.top;
        let view = self.view.as_mut().expect("arena is mapped");

        let next = chunk.advance(view.chunk_size(chunk));
        if next < top {
            view.clear_prev_free(next);
            view.set_prev_size(next, 0);
        }

        view.user_ptr(chunk)
    }

    /// The free path: boundary-tag coalescing, then either top extension or
    /// a LIFO push onto the unsorted list.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this arena and not freed since.
    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let Self {
            view,
            lists,
            small_bin_bitmap,
            top,
            free_size,
            ..
        } = self;
        let view = view.as_mut().expect("free called on an unmapped arena");

        let mut chunk = view.chunk_of_user_ptr(ptr);
        let mut size = view.chunk_size(chunk);
        view.zero_payload(chunk);

        // backward merge: absorb the preceding free chunk. Fast-bin-sized
        // chunks never take part, in either role; the preceding chunk can
        // only have set our flag if it was itself coalescable.
        if view.is_prev_free(chunk) && is_coalescable(size) {
            let prev_size = view.prev_size(chunk);
            let prev = chunk.back(prev_size);
            unlink_absorbed(view, lists, small_bin_bitmap, prev);
            chunk = prev;
            size += prev_size;
            view.set_chunk_size(chunk, size);
            view.zero_payload(chunk);
        }

        // forward merge: the chunk after next records whether next is free.
        let next = chunk.advance(size);
        if next < *top {
            let next_size = view.chunk_size(next);
            let after_next = next.advance(next_size);
            if after_next < *top && view.is_prev_free(after_next) && is_coalescable(size) {
                unlink_absorbed(view, lists, small_bin_bitmap, next);
                size += next_size;
                view.set_chunk_size(chunk, size);
                view.zero_header(next);
                view.set_prev_size(after_next, size);
            }
        }

        let next = chunk.advance(size);
        if next >= *top {
            debug_assert!(next == *top);
            if is_coalescable(size) {
                // the chunk abuts the wilderness: absorb it into the top and
                // drop it from all bookkeeping.
                view.zero_header(chunk);
                *top = chunk;
                *free_size += size;
                return;
            }
            // a fast-bin-sized chunk at the boundary still goes to the
            // unsorted list.
        } else {
            // write the boundary tag into the following chunk. A fast-sized
            // chunk records its size but leaves the flag clear, so a later
            // backward merge can read the size without ever being allowed to
            // merge it.
            view.set_prev_size(next, size);
            if is_coalescable(size) {
                view.set_prev_free(next);
            }
        }

        lists.push_head(view, UNSORTED_LIST, chunk);
    }
}

/// The arena allocator.
///
/// The backing-memory provider is injected through the constructor; the
/// region is reserved lazily on the first allocation that needs it and
/// released when the allocator is dropped.
#[derive(Debug)]
pub struct AfMalloc<P: RegionProvider> {
    pub(crate) arena: Arena,
    provider: P,
}

impl<P: RegionProvider> AfMalloc<P> {
    pub fn new(provider: P) -> Self {
        Self {
            arena: Arena::new(),
            provider,
        }
    }

    /// Allocates at least `size` usable bytes, 16-byte aligned. Returns
    /// `None` on exhaustion.
    pub fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.try_malloc(size).ok()
    }

    /// Like [`Self::malloc`], but reports why the allocation failed.
    pub fn try_malloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size > MAX_HEAP_SIZE {
            return Err(AllocError::ArenaExhausted);
        }
        let needed = required_chunk_size(size);
        if needed + HEADER_SIZE > MAX_HEAP_SIZE {
            return Err(AllocError::ArenaExhausted);
        }

        if self.arena.is_mapped() {
            // first drain the staging area, re-filing whatever is too small
            if let Some(chunk) = self.arena.take_from_unsorted(needed) {
                return Ok(self.arena.finish_takeover(chunk));
            }

            let reused = match Bin::for_chunk_size(needed) {
                Some(bin) => self.arena.take_from_bin_window(bin),
                None => self.arena.take_from_large_list(needed),
            };
            if let Some(chunk) = reused {
                return Ok(self.arena.finish_takeover(chunk));
            }
        }

        if !self.arena.has_room_for(needed) {
            if self.arena.is_mapped() {
                return Err(AllocError::MultipleRegionsUnsupported);
            }

            let base = self
                .provider
                .reserve_region(MAX_HEAP_SIZE)
                .ok_or(AllocError::BackingAllocationFailed)?;
            // SAFETY: the provider contract guarantees a zero-filled,
            // page-aligned region of exactly the requested size, owned by us.
            self.arena
                .attach_region(unsafe { HeapView::new(base, MAX_HEAP_SIZE) });
            log::debug!("mapped {} byte arena region", MAX_HEAP_SIZE);
        }

        Ok(self.arena.carve(needed))
    }

    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// Not implemented: always returns `None`. Callers must treat this as
    /// failure, not as the request being accepted.
    pub fn mem_align(&mut self, alignment: usize, size: usize) -> Option<NonNull<u8>> {
        self.try_mem_align(alignment, size).ok()
    }

    /// Like [`Self::mem_align`]; always `UnsupportedOperation`.
    pub fn try_mem_align(
        &mut self,
        _alignment: usize,
        _size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        Err(AllocError::UnsupportedOperation)
    }

    /// Frees an allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `malloc` on this instance and must
    /// not have been freed since. There is no double-free detection;
    /// violating this is undefined behaviour.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        self.arena.release(ptr);
    }

    /// Uncarved bytes below the end of the mapping. Chunks sitting in free
    /// lists are not part of this.
    pub fn free_size(&self) -> usize {
        self.arena.free_size
    }

    /// Total mapped bytes.
    pub fn allocated_size(&self) -> usize {
        self.arena.allocated_size
    }

    /// The address of the start of the mapped region, if mapped.
    pub fn base_addr(&self) -> Option<usize> {
        self.arena.view.as_ref().map(|view| view.base_addr())
    }

    /// The address of the wilderness pointer, if mapped.
    pub fn top_addr(&self) -> Option<usize> {
        self.arena
            .view
            .as_ref()
            .map(|view| view.base_addr() + self.arena.top.get())
    }
}

impl<P: RegionProvider> Drop for AfMalloc<P> {
    fn drop(&mut self) {
        if let Some(view) = self.arena.view.take() {
            // SAFETY: the view came from this provider and nothing can touch
            // the region after the allocator is gone.
            unsafe { self.provider.release_region(view.base(), view.size()) };
        }
    }
}

// SAFETY: the arena region is exclusively owned by the allocator.
unsafe impl<P: RegionProvider + Send> Send for AfMalloc<P> {}

/// An allocator guarded by a single coarse spinlock, for use from multiple
/// threads. The core stays single-threaded; the lock simply serializes whole
/// operations.
#[cfg(feature = "spin")]
pub struct SpinLockedAfMalloc<P: RegionProvider>(spin::Mutex<AfMalloc<P>>);

#[cfg(feature = "spin")]
impl<P: RegionProvider> SpinLockedAfMalloc<P> {
    pub fn new(provider: P) -> Self {
        Self(spin::Mutex::new(AfMalloc::new(provider)))
    }

    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.0.lock().malloc(size)
    }

    pub fn try_malloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.0.lock().try_malloc(size)
    }

    pub fn mem_align(&self, alignment: usize, size: usize) -> Option<NonNull<u8>> {
        self.0.lock().mem_align(alignment, size)
    }

    /// # Safety
    ///
    /// Same contract as [`AfMalloc::free`].
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.0.lock().free(ptr)
    }

    pub fn free_size(&self) -> usize {
        self.0.lock().free_size()
    }

    pub fn allocated_size(&self) -> usize {
        self.0.lock().allocated_size()
    }
}
