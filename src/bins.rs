use static_assertions::const_assert;

use crate::ALIGNMENT;

/// Chunks strictly below this size are fast-binned and are never coalesced.
pub const FAST_BIN_RANGE_END: usize = 160;

/// Chunks in `FAST_BIN_RANGE_END..SMALL_BIN_RANGE_END` are small-binned;
/// everything at or above this goes to the large-chunk list.
pub const SMALL_BIN_RANGE_END: usize = 512;

/// One fast-bin class per 16 bytes of chunk size.
pub const FAST_BIN_COUNT: usize = FAST_BIN_RANGE_END / ALIGNMENT;

/// One small-bin class per 16 bytes of chunk size above the fast-bin ceiling.
pub const SMALL_BIN_COUNT: usize = (SMALL_BIN_RANGE_END - FAST_BIN_RANGE_END) / ALIGNMENT;

/// How many size classes above the exact match a bin probe may drift,
/// bounding the internal fragmentation of a binned reuse.
pub const BIN_SEARCH_WINDOW: usize = 3;

type SmallBinBitmapWord = u32;

// every small-bin class needs a bit in the occupancy bitmap.
const_assert!(core::mem::size_of::<SmallBinBitmapWord>() * 8 >= SMALL_BIN_COUNT);

/// The bin a free chunk of a given size belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bin {
    Fast(usize),
    Small(usize),
}

impl Bin {
    /// Classifies a chunk size into its bin. Returns `None` for sizes that
    /// belong on the large-chunk list.
    ///
    /// The size must be a multiple of the chunk alignment.
    pub fn for_chunk_size(chunk_size: usize) -> Option<Bin> {
        debug_assert!(chunk_size % ALIGNMENT == 0);
        if chunk_size < FAST_BIN_RANGE_END {
            Some(Bin::Fast(chunk_size / ALIGNMENT))
        } else if chunk_size < SMALL_BIN_RANGE_END {
            Some(Bin::Small((chunk_size - FAST_BIN_RANGE_END) / ALIGNMENT))
        } else {
            None
        }
    }
}

/// Fast-bin-sized chunks are never merged with their neighbors, trading
/// fragmentation for O(1) reuse.
pub fn is_coalescable(chunk_size: usize) -> bool {
    chunk_size > FAST_BIN_RANGE_END
}

/// Occupancy bitmap for the small bins, one bit per class, used to skip
/// empty classes during the windowed bin probe. The fast bins have no bitmap,
/// their array is small enough to probe directly.
#[derive(Debug, Clone, Copy)]
pub struct SmallBinBitmap(SmallBinBitmapWord);

impl SmallBinBitmap {
    pub const fn new() -> Self {
        Self(0)
    }

    pub fn set(&mut self, index: usize) {
        debug_assert!(index < SMALL_BIN_COUNT);
        self.0 |= 1 << index;
    }

    pub fn unset(&mut self, index: usize) {
        debug_assert!(index < SMALL_BIN_COUNT);
        self.0 &= !(1 << index);
    }

    pub fn is_set(&self, index: usize) -> bool {
        debug_assert!(index < SMALL_BIN_COUNT);
        self.0 & (1 << index) != 0
    }
}
