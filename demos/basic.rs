//! Walks through the allocator's public API. Run with `RUST_LOG=memalloc=trace`
//! to see every split, merge and page mapping as it happens.

use memalloc::MemAlloc;

fn log_alloc(addr: *mut u8, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() {
    env_logger::init();

    let allocator = MemAlloc::new();

    let addr1 = allocator.allocate(8);
    log_alloc(addr1, 8);

    let addr2 = allocator.allocate(64);
    log_alloc(addr2, 64);

    let addr3 = allocator.allocate_zeroed(16, 4);
    log_alloc(addr3, 64);

    // Bigger than a page, gets its own mapping.
    let big = allocator.allocate(64 * 1024);
    log_alloc(big, 64 * 1024);

    println!("{:#?}", allocator.stats());

    unsafe {
        allocator.release(addr1);
        allocator.release(addr2);
        allocator.release(addr3);
        allocator.release(big);
    }

    // Everything merged back into a single idle page.
    println!("{:#?}", allocator.stats());
}
