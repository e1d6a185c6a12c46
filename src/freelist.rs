use crate::bins::{FAST_BIN_COUNT, SMALL_BIN_COUNT};
use crate::chunks::{ChunkOffset, HeapView};

/// Index of the unsorted list's sentinel, the staging area for freshly freed
/// chunks.
pub const UNSORTED_LIST: usize = 0;

/// Index of the large-chunk list's sentinel, holding every free chunk above
/// the small-bin ceiling.
pub const LARGE_LIST: usize = 1;

const FAST_LISTS_START: usize = 2;
const SMALL_LISTS_START: usize = FAST_LISTS_START + FAST_BIN_COUNT;

/// Total number of sentinel records: unsorted, large, one per fast bin and
/// one per small bin.
pub const LIST_COUNT: usize = SMALL_LISTS_START + SMALL_BIN_COUNT;

/// One endpoint of a list link: either a sentinel record held by the
/// allocator, or a chunk inside the arena.
///
/// Links are stored in chunk headers as a single word. Chunk offsets are
/// multiples of 16, so the lowest bit tags sentinels: `(list << 1) | 1` for a
/// sentinel, the plain offset for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Head(usize),
    Chunk(ChunkOffset),
}

impl Link {
    fn encode(self) -> usize {
        match self {
            Link::Head(list) => (list << 1) | 1,
            Link::Chunk(chunk) => chunk.get(),
        }
    }

    fn decode(raw: usize) -> Self {
        if raw & 1 == 1 {
            Link::Head(raw >> 1)
        } else {
            Link::Chunk(ChunkOffset::new(raw))
        }
    }
}

/// A sentinel record. An empty list is represented by the sentinel linking to
/// itself, so list operations never branch on null.
#[derive(Debug, Clone, Copy)]
struct ListHead {
    prev: usize,
    next: usize,
}

/// The sentinel-headed circular doubly linked lists of free chunks: the
/// unsorted list, the large-chunk list, and one list per fast and small bin
/// class.
///
/// The sentinels live here, in the allocator; the chunks' own links live in
/// their headers inside the arena, so every operation takes the heap view.
#[derive(Debug)]
pub struct FreeLists {
    heads: [ListHead; LIST_COUNT],
}

impl FreeLists {
    pub fn new() -> Self {
        let mut heads = [ListHead { prev: 0, next: 0 }; LIST_COUNT];
        for (list, head) in heads.iter_mut().enumerate() {
            let this = Link::Head(list).encode();
            head.prev = this;
            head.next = this;
        }
        Self { heads }
    }

    /// The sentinel index of the fast bin with the given class index.
    pub fn fast_list(index: usize) -> usize {
        debug_assert!(index < FAST_BIN_COUNT);
        FAST_LISTS_START + index
    }

    /// The sentinel index of the small bin with the given class index.
    pub fn small_list(index: usize) -> usize {
        debug_assert!(index < SMALL_BIN_COUNT);
        SMALL_LISTS_START + index
    }

    /// The small-bin class index of the given sentinel, if it is a small
    /// bin's.
    pub fn small_bin_index(list: usize) -> Option<usize> {
        if (SMALL_LISTS_START..LIST_COUNT).contains(&list) {
            Some(list - SMALL_LISTS_START)
        } else {
            None
        }
    }

    fn next_of(&self, view: &HeapView, of: Link) -> Link {
        match of {
            Link::Head(list) => Link::decode(self.heads[list].next),
            Link::Chunk(chunk) => Link::decode(view.raw_next_link(chunk)),
        }
    }

    fn prev_of(&self, view: &HeapView, of: Link) -> Link {
        match of {
            Link::Head(list) => Link::decode(self.heads[list].prev),
            Link::Chunk(chunk) => Link::decode(view.raw_prev_link(chunk)),
        }
    }

    fn set_next(&mut self, view: &mut HeapView, of: Link, to: Link) {
        match of {
            Link::Head(list) => self.heads[list].next = to.encode(),
            Link::Chunk(chunk) => view.set_raw_next_link(chunk, to.encode()),
        }
    }

    fn set_prev(&mut self, view: &mut HeapView, of: Link, to: Link) {
        match of {
            Link::Head(list) => self.heads[list].prev = to.encode(),
            Link::Chunk(chunk) => view.set_raw_prev_link(chunk, to.encode()),
        }
    }

    pub fn is_empty(&self, list: usize) -> bool {
        Link::decode(self.heads[list].next) == Link::Head(list)
    }

    /// The most recently inserted chunk of the list, if any.
    pub fn first(&self, list: usize) -> Option<ChunkOffset> {
        match Link::decode(self.heads[list].next) {
            Link::Chunk(chunk) => Some(chunk),
            Link::Head(_) => None,
        }
    }

    /// The oldest chunk of the list, if any.
    pub fn last(&self, list: usize) -> Option<ChunkOffset> {
        match Link::decode(self.heads[list].prev) {
            Link::Chunk(chunk) => Some(chunk),
            Link::Head(_) => None,
        }
    }

    /// The chunk after `chunk` in its list, or `None` when `chunk` is the
    /// last one before the sentinel.
    pub fn next_in_list(&self, view: &HeapView, chunk: ChunkOffset) -> Option<ChunkOffset> {
        match self.next_of(view, Link::Chunk(chunk)) {
            Link::Chunk(next) => Some(next),
            Link::Head(_) => None,
        }
    }

    /// Pushes the chunk at the head of the list (LIFO).
    pub fn push_head(&mut self, view: &mut HeapView, list: usize, chunk: ChunkOffset) {
        let head = Link::Head(list);
        let old_first = self.next_of(view, head);
        debug_assert!(old_first != Link::Chunk(chunk));

        view.set_raw_prev_link(chunk, head.encode());
        view.set_raw_next_link(chunk, old_first.encode());
        self.set_prev(view, old_first, Link::Chunk(chunk));
        self.set_next(view, head, Link::Chunk(chunk));
    }

    /// Unlinks the chunk from whatever list it is currently on, using the
    /// links stored in its header.
    pub fn unlink(&mut self, view: &mut HeapView, chunk: ChunkOffset) {
        let prev = self.prev_of(view, Link::Chunk(chunk));
        let next = self.next_of(view, Link::Chunk(chunk));

        // a node linked to itself is a corrupted list, not a valid state
        debug_assert!(prev != Link::Chunk(chunk));
        debug_assert!(next != Link::Chunk(chunk));

        self.set_next(view, prev, next);
        self.set_prev(view, next, prev);
    }
}
