
use core::alloc::Layout;
use core::ptr::NonNull;

use super::*;
use crate::chunks::ChunkOffset;

/// A region provider backed by the test process's own heap, so unit tests do
/// not depend on `mmap`.
pub(crate) struct TestRegionProvider {
    layout: Option<Layout>,
}

impl TestRegionProvider {
    pub(crate) fn new() -> Self {
        Self { layout: None }
    }
}

impl RegionProvider for TestRegionProvider {
    fn reserve_region(&mut self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        self.layout = Some(layout);
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }

    unsafe fn release_region(&mut self, base: NonNull<u8>, _size: usize) {
        std::alloc::dealloc(base.as_ptr(), self.layout.take().unwrap());
    }
}

/// A provider that always fails to reserve, for exercising the failure path.
pub(crate) struct FailingRegionProvider;

impl RegionProvider for FailingRegionProvider {
    fn reserve_region(&mut self, _size: usize) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn release_region(&mut self, _base: NonNull<u8>, _size: usize) {
        unreachable!("nothing was ever reserved");
    }
}

pub(crate) fn new_allocator() -> AfMalloc<TestRegionProvider> {
    AfMalloc::new(TestRegionProvider::new())
}

/// The heap view of a mapped allocator, for white-box header inspection.
pub(crate) fn view_of(allocator: &AfMalloc<TestRegionProvider>) -> &chunks::HeapView {
    allocator.arena.view.as_ref().expect("allocator is mapped")
}

/// The chunk offset behind a user pointer.
pub(crate) fn chunk_of(allocator: &AfMalloc<TestRegionProvider>, ptr: NonNull<u8>) -> ChunkOffset {
    view_of(allocator).chunk_of_user_ptr(ptr)
}
