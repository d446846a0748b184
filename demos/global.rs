//! Runs a program on top of [`MemAlloc`] as its `#[global_allocator]` and
//! prints what the allocator did with the mappings behind it.

use memalloc::MemAlloc;

#[global_allocator]
static ALLOCATOR: MemAlloc = MemAlloc::new();

fn main() {
    // Two neighbours released together merge into one block that serves a
    // request neither could hold on its own.
    let a = Box::new([1u8; 64]);
    let b = Box::new([2u8; 64]);
    let at = a.as_ptr();
    drop(a);
    drop(b);

    let merged = Box::new([3u8; 128]);
    println!("freed {at:p} and its neighbour, 128 bytes now at {:p} (reused: {})", merged.as_ptr(), at == merged.as_ptr());

    // A buffer larger than a page is mapped on its own and unmapped on drop.
    let before = ALLOCATOR.stats().mapped_bytes;
    let large = vec![7u8; 1 << 20];
    let during = ALLOCATOR.stats().mapped_bytes;
    drop(large);
    let after = ALLOCATOR.stats().mapped_bytes;
    println!("mapped bytes: {before} -> {during} while the 1 MiB buffer lived -> {after}");

    // Lots of short lived pages, of which at most two stay mapped.
    let pages: Vec<Vec<u8>> = (0..16).map(|_| Vec::with_capacity(3000)).collect();
    drop(pages);

    println!("{:#?}", ALLOCATOR.stats());
}
