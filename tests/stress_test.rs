use core::ptr::NonNull;

use afmalloc::{AfMalloc, MmapRegionProvider, ALIGNMENT, MAX_HEAP_SIZE};

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};
use test_env_log::test;

/// A live allocation: the pointer, the requested size and the byte pattern
/// written over it.
#[derive(Clone, Copy)]
struct Slot {
    ptr: NonNull<u8>,
    size: usize,
    fill: u8,
}

fn fill_slot(slot: &Slot) {
    unsafe { core::ptr::write_bytes(slot.ptr.as_ptr(), slot.fill, slot.size) };
}

fn check_slot(slot: &Slot) {
    let bytes = unsafe { core::slice::from_raw_parts(slot.ptr.as_ptr(), slot.size) };
    assert!(
        bytes.iter().all(|&byte| byte == slot.fill),
        "allocation at {:p} of {} bytes lost its fill pattern",
        slot.ptr.as_ptr(),
        slot.size
    );
}

fn check_no_overlap(slots: &[Option<Slot>], candidate: &Slot) {
    let start = candidate.ptr.as_ptr() as usize;
    let end = start + candidate.size;
    for slot in slots.iter().flatten() {
        let other_start = slot.ptr.as_ptr() as usize;
        let other_end = other_start + slot.size;
        assert!(
            end <= other_start || other_end <= start,
            "allocation {:#x}..{:#x} overlaps live allocation {:#x}..{:#x}",
            start,
            end,
            other_start,
            other_end
        );
    }
}

#[test]
fn stress() {
    let mut allocator = AfMalloc::new(MmapRegionProvider);

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let sizes = Uniform::new_inclusive(1usize, 900);
    let mut slots: Vec<Option<Slot>> = vec![None; 64];

    for _ in 0..10_000 {
        let index = rng.gen_range(0..slots.len());
        match slots[index] {
            None => {
                let size = sizes.sample(&mut rng);
                let Some(ptr) = allocator.malloc(size) else {
                    // the fixed arena can genuinely fill up under churn;
                    // release everything and keep going
                    log::info!("arena exhausted, draining all {} live slots", slots.len());
                    for slot in slots.iter_mut() {
                        if let Some(live) = slot.take() {
                            check_slot(&live);
                            unsafe { allocator.free(live.ptr) };
                        }
                    }
                    continue;
                };

                assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
                let slot = Slot {
                    ptr,
                    size,
                    fill: (rng.next_u32() % 256) as u8,
                };
                check_no_overlap(&slots, &slot);
                fill_slot(&slot);
                slots[index] = Some(slot);
            }
            Some(live) => {
                check_slot(&live);
                unsafe { allocator.free(live.ptr) };
                slots[index] = None;
            }
        }
    }

    for slot in slots.iter_mut() {
        if let Some(live) = slot.take() {
            check_slot(&live);
            unsafe { allocator.free(live.ptr) };
        }
    }

    // a single region for the whole run, and it still serves requests
    assert_eq!(allocator.allocated_size(), MAX_HEAP_SIZE);
    assert!(allocator.malloc(100).is_some());
}
