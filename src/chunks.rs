use core::ptr::NonNull;

use crate::{ALIGNMENT, HEADER_SIZE, USER_DATA_OFFSET, USIZE_SIZE};

/// The most significant bit of the size word, repurposed as the "previous
/// chunk is free" flag. Chunk sizes are multiples of 16, so the size bits and
/// the flag bit never collide.
pub const PREV_FREE_FLAG: usize = 1 << (usize::BITS - 1);

/// Byte offset of the size word within a chunk header.
const SIZE_WORD_OFFSET: usize = USIZE_SIZE;

/// Byte offsets of the two intrusive link slots within a chunk header. These
/// slots are only meaningful while the chunk sits in a free list; while the
/// chunk is allocated they are handed to the user as payload.
const PREV_LINK_OFFSET: usize = 2 * USIZE_SIZE;
const NEXT_LINK_OFFSET: usize = 3 * USIZE_SIZE;

/// A typed handle to a chunk: its byte offset from the start of the mapped
/// region. Always a multiple of the chunk alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChunkOffset(usize);

impl ChunkOffset {
    pub fn new(offset: usize) -> Self {
        debug_assert!(offset % ALIGNMENT == 0);
        Self(offset)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    /// The raw byte offset.
    pub fn get(self) -> usize {
        self.0
    }

    /// The offset `bytes` bytes forward of this one.
    pub fn advance(self, bytes: usize) -> Self {
        Self::new(self.0 + bytes)
    }

    /// The offset `bytes` bytes behind this one.
    pub fn back(self, bytes: usize) -> Self {
        debug_assert!(bytes <= self.0);
        Self::new(self.0 - bytes)
    }
}

/// A view of the mapped heap region which decodes chunk headers through
/// fixed-offset reads and writes.
///
/// This is the only type in the crate that touches raw memory. Everything
/// above it manipulates [`ChunkOffset`] handles.
#[derive(Debug)]
pub struct HeapView {
    base: NonNull<u8>,
    size: usize,
}

impl HeapView {
    /// Creates a view over the given memory region.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes for `size` bytes, must
    /// be aligned to at least the chunk alignment, zero-filled, and must not
    /// be accessed by anything else for the lifetime of the view.
    pub unsafe fn new(base: NonNull<u8>, size: usize) -> Self {
        debug_assert!(crate::align::is_aligned(base.as_ptr() as usize, ALIGNMENT));
        Self { base, size }
    }

    /// The address of the start of the region.
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// The size of the mapped region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    fn word_ptr(&self, offset: usize) -> *mut usize {
        debug_assert!(offset % USIZE_SIZE == 0);
        debug_assert!(offset + USIZE_SIZE <= self.size);
        // SAFETY: the offset was just checked to be in bounds and word
        // aligned, and the region is valid per the contract of `new`.
        unsafe { self.base.as_ptr().add(offset).cast::<usize>() }
    }

    fn read_word(&self, offset: usize) -> usize {
        unsafe { self.word_ptr(offset).read() }
    }

    fn write_word(&mut self, offset: usize, value: usize) {
        unsafe { self.word_ptr(offset).write(value) }
    }

    /// The size of the chunk at the given offset, with the flag bit masked
    /// out.
    pub fn chunk_size(&self, chunk: ChunkOffset) -> usize {
        self.read_word(chunk.get() + SIZE_WORD_OFFSET) & !PREV_FREE_FLAG
    }

    /// Sets the size of the chunk at the given offset, preserving the flag
    /// bit. The size must be a multiple of the chunk alignment.
    pub fn set_chunk_size(&mut self, chunk: ChunkOffset, size: usize) {
        debug_assert!(size % ALIGNMENT == 0);
        let flag = self.read_word(chunk.get() + SIZE_WORD_OFFSET) & PREV_FREE_FLAG;
        self.write_word(chunk.get() + SIZE_WORD_OFFSET, size | flag);
    }

    /// Is the chunk physically preceding this one free?
    pub fn is_prev_free(&self, chunk: ChunkOffset) -> bool {
        self.read_word(chunk.get() + SIZE_WORD_OFFSET) & PREV_FREE_FLAG != 0
    }

    pub fn set_prev_free(&mut self, chunk: ChunkOffset) {
        let word = self.read_word(chunk.get() + SIZE_WORD_OFFSET);
        self.write_word(chunk.get() + SIZE_WORD_OFFSET, word | PREV_FREE_FLAG);
    }

    pub fn clear_prev_free(&mut self, chunk: ChunkOffset) {
        let word = self.read_word(chunk.get() + SIZE_WORD_OFFSET);
        self.write_word(chunk.get() + SIZE_WORD_OFFSET, word & !PREV_FREE_FLAG);
    }

    /// The recorded size of the physically preceding chunk. Only meaningful
    /// while that chunk is free.
    pub fn prev_size(&self, chunk: ChunkOffset) -> usize {
        self.read_word(chunk.get())
    }

    pub fn set_prev_size(&mut self, chunk: ChunkOffset, size: usize) {
        self.write_word(chunk.get(), size);
    }

    pub fn raw_prev_link(&self, chunk: ChunkOffset) -> usize {
        self.read_word(chunk.get() + PREV_LINK_OFFSET)
    }

    pub fn set_raw_prev_link(&mut self, chunk: ChunkOffset, raw: usize) {
        self.write_word(chunk.get() + PREV_LINK_OFFSET, raw);
    }

    pub fn raw_next_link(&self, chunk: ChunkOffset) -> usize {
        self.read_word(chunk.get() + NEXT_LINK_OFFSET)
    }

    pub fn set_raw_next_link(&mut self, chunk: ChunkOffset, raw: usize) {
        self.write_word(chunk.get() + NEXT_LINK_OFFSET, raw);
    }

    /// Writes the header of a chunk freshly carved from the wilderness:
    /// `prev_size` of 0 and a clean size word with no flags. The link slots
    /// are left untouched, they belong to the user while the chunk is
    /// allocated.
    pub fn write_fresh_header(&mut self, chunk: ChunkOffset, size: usize) {
        debug_assert!(size % ALIGNMENT == 0);
        self.write_word(chunk.get(), 0);
        self.write_word(chunk.get() + SIZE_WORD_OFFSET, size);
    }

    /// Zeroes the whole header of the chunk at the given offset.
    pub fn zero_header(&mut self, chunk: ChunkOffset) {
        for word in 0..HEADER_SIZE / USIZE_SIZE {
            self.write_word(chunk.get() + word * USIZE_SIZE, 0);
        }
    }

    /// Zeroes the payload region of the chunk: everything past the first 16
    /// header bytes, up to the end of the chunk. The link slots are included,
    /// callers relink the chunk afterwards if it goes back on a list.
    pub fn zero_payload(&mut self, chunk: ChunkOffset) {
        let size = self.chunk_size(chunk);
        debug_assert!(size >= HEADER_SIZE);
        let start = chunk.get() + USER_DATA_OFFSET;
        debug_assert!(chunk.get() + size <= self.size);
        // SAFETY: the range is in bounds, see the assertion above.
        unsafe {
            self.base
                .as_ptr()
                .add(start)
                .write_bytes(0, size - USER_DATA_OFFSET);
        }
    }

    /// The pointer handed to the user for the chunk at the given offset.
    pub fn user_ptr(&self, chunk: ChunkOffset) -> NonNull<u8> {
        debug_assert!(chunk.get() + USER_DATA_OFFSET <= self.size);
        // SAFETY: offsetting within the region keeps the pointer non-null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(chunk.get() + USER_DATA_OFFSET)) }
    }

    /// Recovers the chunk offset from a pointer previously returned by
    /// [`Self::user_ptr`].
    pub fn chunk_of_user_ptr(&self, ptr: NonNull<u8>) -> ChunkOffset {
        let addr = ptr.as_ptr() as usize;
        debug_assert!(addr >= self.base_addr() + USER_DATA_OFFSET);
        debug_assert!(addr < self.base_addr() + self.size);
        ChunkOffset::new(addr - self.base_addr() - USER_DATA_OFFSET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;

    struct TestRegion {
        view: HeapView,
        layout: Layout,
    }

    impl TestRegion {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, ALIGNMENT).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            let base = NonNull::new(ptr).unwrap();
            Self {
                view: unsafe { HeapView::new(base, size) },
                layout,
            }
        }
    }

    impl Drop for TestRegion {
        fn drop(&mut self) {
            unsafe { std::alloc::dealloc(self.view.base().as_ptr(), self.layout) }
        }
    }

    #[test]
    fn size_word_and_flag_do_not_collide() {
        let mut region = TestRegion::new(128);
        let chunk = ChunkOffset::new(0);

        region.view.write_fresh_header(chunk, 48);
        assert_eq!(region.view.chunk_size(chunk), 48);
        assert!(!region.view.is_prev_free(chunk));

        region.view.set_prev_free(chunk);
        assert_eq!(region.view.chunk_size(chunk), 48);
        assert!(region.view.is_prev_free(chunk));

        // resizing must not clobber the flag
        region.view.set_chunk_size(chunk, 96);
        assert_eq!(region.view.chunk_size(chunk), 96);
        assert!(region.view.is_prev_free(chunk));

        region.view.clear_prev_free(chunk);
        assert_eq!(region.view.chunk_size(chunk), 96);
        assert!(!region.view.is_prev_free(chunk));
    }

    #[test]
    fn fresh_header_clears_boundary_tag() {
        let mut region = TestRegion::new(128);
        let chunk = ChunkOffset::new(32);

        region.view.set_prev_size(chunk, 32);
        region.view.set_prev_free(chunk);

        region.view.write_fresh_header(chunk, 64);
        assert_eq!(region.view.prev_size(chunk), 0);
        assert!(!region.view.is_prev_free(chunk));
        assert_eq!(region.view.chunk_size(chunk), 64);
    }

    #[test]
    fn user_ptr_round_trip() {
        let region = TestRegion::new(128);
        let chunk = ChunkOffset::new(32);

        let ptr = region.view.user_ptr(chunk);
        assert_eq!(
            ptr.as_ptr() as usize,
            region.view.base_addr() + 32 + USER_DATA_OFFSET
        );
        assert_eq!(region.view.chunk_of_user_ptr(ptr), chunk);
    }

    #[test]
    fn zero_payload_leaves_first_header_half_intact() {
        let mut region = TestRegion::new(128);
        let chunk = ChunkOffset::new(0);

        region.view.write_fresh_header(chunk, 64);
        region.view.set_raw_prev_link(chunk, 0xdead0);
        region.view.set_raw_next_link(chunk, 0xbeef0);

        region.view.zero_payload(chunk);

        assert_eq!(region.view.chunk_size(chunk), 64);
        assert_eq!(region.view.raw_prev_link(chunk), 0);
        assert_eq!(region.view.raw_next_link(chunk), 0);
    }
}
