//! The allocator on top of real kernel mappings.

use std::{ptr::NonNull, thread};

use memalloc::{Kernel, MemAlloc, PageSource, ProtocolViolation};

fn usable(allocator: &MemAlloc, ptr: *mut u8) -> usize {
    unsafe { allocator.usable_size(NonNull::new(ptr).unwrap()) }.unwrap()
}

#[test]
fn written_bytes_survive_other_allocations() {
    let allocator = MemAlloc::new();
    let page_size = Kernel.page_size();
    let sizes = [1, 3, 8, 24, 100, 1000, page_size / 2, page_size, 5 * page_size];

    let ptrs: Vec<*mut u8> = sizes
        .iter()
        .enumerate()
        .map(|(i, size)| {
            let ptr = allocator.allocate(*size);
            assert!(!ptr.is_null());
            unsafe { ptr.write_bytes(i as u8 + 1, *size) };
            ptr
        })
        .collect();

    for (i, (ptr, size)) in ptrs.iter().zip(sizes).enumerate() {
        let bytes = unsafe { std::slice::from_raw_parts(*ptr, size) };
        assert!(bytes.iter().all(|b| *b == i as u8 + 1));
    }

    for ptr in ptrs {
        unsafe { allocator.release(ptr) };
    }
    assert!(allocator.stats().idle_pages <= 2);
}

#[test]
fn adjacent_blocks_merge_without_mapping_more() {
    let allocator = MemAlloc::new();

    let a = allocator.allocate(120);
    let b = allocator.allocate(250);
    let _tail = allocator.allocate(16);

    let size_a = usable(&allocator, a);
    let size_b = usable(&allocator, b);
    let header = b as usize - a as usize - size_a;

    unsafe {
        allocator.release(b);
        allocator.release(a);
    }

    let before = allocator.stats().pages_acquired;
    let merged = allocator.allocate(size_a + header + size_b);

    assert_eq!(merged, a);
    assert_eq!(allocator.stats().pages_acquired, before);
}

#[test]
fn idle_pages_never_exceed_two() {
    let allocator = MemAlloc::new();
    let page_size = Kernel.page_size();

    for _ in 0..10 {
        let ptrs: Vec<*mut u8> = (0..6).map(|_| allocator.allocate(page_size / 2 + 1)).collect();
        for ptr in ptrs {
            unsafe { allocator.release(ptr) };
            assert!(allocator.stats().idle_pages <= 2);
        }
    }

    let stats = allocator.stats();
    assert_eq!(stats.mapped_bytes, stats.idle_pages * page_size);
}

#[test]
fn zeroed_allocation_and_overflow() {
    let allocator = MemAlloc::new();

    assert!(allocator.allocate_zeroed(usize::MAX / 3, 4).is_null());
    assert_eq!(allocator.stats().pages_acquired, 0);

    let ptr = allocator.allocate_zeroed(100, 12);
    let bytes = unsafe { std::slice::from_raw_parts(ptr, 1200) };
    assert!(bytes.iter().all(|b| *b == 0));
    unsafe { allocator.release(ptr) };
}

#[test]
fn large_zeroed_allocation_is_zero() {
    let allocator = MemAlloc::new();
    let len = 4 * Kernel.page_size();

    let ptr = allocator.allocate_zeroed(len / 8, 8);
    let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
    assert!(bytes.iter().all(|b| *b == 0));
    unsafe { allocator.release(ptr) };
}

#[test]
fn pointers_into_the_null_page_are_invalid() {
    let allocator = MemAlloc::new();

    for addr in [0x40, Kernel.page_size()] {
        let result = unsafe { allocator.try_release(addr as *mut u8) };
        assert_eq!(result, Err(ProtocolViolation::InvalidPointer(addr)));
    }
}

#[test]
fn double_free_is_reported() {
    let allocator = MemAlloc::new();
    let ptr = allocator.allocate(40);
    let _busy = allocator.allocate(40);

    unsafe {
        assert_eq!(allocator.try_release(ptr), Ok(()));
        assert_eq!(allocator.try_release(ptr), Err(ProtocolViolation::DoubleFree(ptr as usize)));
    }
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_panics() {
    let allocator = MemAlloc::new();
    let ptr = allocator.allocate(40);
    let _busy = allocator.allocate(40);

    unsafe {
        allocator.release(ptr);
        allocator.release(ptr);
    }
}

#[test]
fn threads_keep_their_regions_to_themselves() {
    const THREADS: usize = 6;
    const ROUNDS: usize = 300;

    let allocator = MemAlloc::new();

    let outstanding: usize = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|id| {
                let allocator = &allocator;
                scope.spawn(move || {
                    let size = 16 * (id + 1) + 1;
                    let fill = 0xA0 + id as u8;
                    let mut live: Vec<*mut u8> = Vec::new();
                    let mut allocated = 0usize;
                    let mut released = 0usize;

                    for round in 0..ROUNDS {
                        let ptr = allocator.allocate(size);
                        assert!(!ptr.is_null());
                        allocated += 1;
                        unsafe { ptr.write_bytes(fill, size) };
                        live.push(ptr);

                        if round % 2 == 1 {
                            let ptr = live.remove(0);
                            let bytes = unsafe { std::slice::from_raw_parts(ptr, size) };
                            assert!(bytes.iter().all(|b| *b == fill));
                            unsafe { allocator.release(ptr) };
                            released += 1;
                        }
                    }

                    for ptr in &live {
                        let bytes = unsafe { std::slice::from_raw_parts(*ptr, size) };
                        assert!(bytes.iter().all(|b| *b == fill));
                    }
                    assert_eq!(allocated - released, live.len());

                    let outstanding = live.len();
                    for ptr in live {
                        unsafe { allocator.release(ptr) };
                    }
                    outstanding
                })
            })
            .collect();

        handles.into_iter().map(|handle| handle.join().unwrap()).sum()
    });

    assert_eq!(outstanding, THREADS * ROUNDS / 2);
    assert!(allocator.stats().idle_pages <= 2);
}
