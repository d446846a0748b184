//! # memalloc
//!
//! A general purpose memory allocator that takes its memory straight from
//! the kernel in page sized units and can be used from any number of
//! threads, either through its own `allocate` / `allocate_zeroed` /
//! `release` functions or as the `#[global_allocator]`.
//!
//! ## How it works
//!
//! Every region handed out is preceded by a block header recording its size
//! and state:
//!
//! ```text
//!   +--------------+--------------------------------+
//!   | Block header |           User data            |
//!   +--------------+--------------------------------+
//!                  ^
//!                  +-- pointer returned to the user
//! ```
//!
//! Requests are either *small* (they fit in one page minus a header) or
//! *large*:
//!
//! - Small requests are served first-fit from a free list sorted by address.
//!   When nothing fits, a fresh page is mapped. Whatever is left over after
//!   carving out the request becomes a new free block.
//! - Large requests get a mapping of their own, sized to whole pages, which
//!   is unmapped as soon as it is released.
//!
//! Released small blocks are merged with their free neighbours. At most two
//! completely idle pages are kept around, any further ones go back to the
//! kernel.
//!
//! ```text
//!          Free list (address ordered)
//!
//!   head --------------+                 +----------------------+
//!                      |                 |                      |
//!   +--------+-------+-|------+-------+--|-----+   +---------+--|-----+
//!   | Used   | Used  | Free   | Used  | Free   |   | Used    | Free   |
//!   +--------+-------+--------+-------+--------+   +---------+--------+
//!                 page                                   page
//! ```
//!
//! ## Concurrency
//!
//! A single lock guards the free list and every header mutation. Unmapping a
//! large block is the only kernel call made without it.
//!
//! ## Errors
//!
//! Running out of memory, zero sized requests and size overflows are
//! reported as null pointers (or as [`AllocError`] through the `try_*`
//! functions). Releasing a pointer twice, or releasing something that never
//! came from the allocator, is a [`ProtocolViolation`]: [`MemAlloc::release`]
//! panics and the [`GlobalAlloc`] implementation aborts the process.
//!
//! ## Diagnostics
//!
//! Every operation emits `trace` records under the `memalloc` target through
//! the [`log`] facade, once the lock has been dropped.

mod block;
mod error;
mod freelist;
mod heap;
mod kernel;
mod trace;
pub mod utils;

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::{Mutex, MutexGuard, PoisonError},
};

use block::{BlockRef, State};
use heap::{Heap, Released};
use trace::TraceBuf;

pub use error::{AllocError, ProtocolViolation};
pub use heap::HeapStats;
pub use kernel::{Kernel, PageSource};

/// The allocator. See the [crate level documentation](crate) for an
/// overview.
///
/// ```
/// use memalloc::MemAlloc;
///
/// let allocator = MemAlloc::new();
///
/// let ptr = allocator.allocate(64);
/// assert!(!ptr.is_null());
///
/// unsafe {
///     ptr.write_bytes(0xAB, 64);
///     allocator.release(ptr);
/// }
/// ```
pub struct MemAlloc<S: PageSource = Kernel> {
    source: S,
    heap: Mutex<Heap>,
}

impl MemAlloc<Kernel> {
    /// Creates an allocator getting its pages from the operating system.
    pub const fn new() -> Self {
        Self::with_source(Kernel)
    }
}

impl Default for MemAlloc<Kernel> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: PageSource> MemAlloc<S> {
    /// Creates an allocator getting its pages from `source`.
    pub const fn with_source(source: S) -> Self {
        Self {
            source,
            heap: Mutex::new(Heap::new()),
        }
    }

    /// Nothing panics while the lock is held, so a poisoned lock still
    /// guards consistent state.
    fn lock(&self) -> MutexGuard<'_, Heap> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_block(&self, size: usize) -> Result<BlockRef, AllocError> {
        let mut trace = TraceBuf::new();
        let result = self.lock().allocate(&self.source, size, &mut trace);
        trace.emit();

        if let Err(AllocError::OutOfMemory(len)) = result {
            trace::warn(format_args!("kernel refused to map {len} bytes for a {size} byte request"));
        }
        result
    }

    /// Allocates at least `size` bytes.
    pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_block(size).map(BlockRef::user_ptr)
    }

    /// Allocates at least `size` bytes, returning null when `size` is zero or
    /// the kernel has no memory left.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        self.try_allocate(size).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Allocates room for `count` elements of `size` bytes each, all zeroed.
    pub fn try_allocate_zeroed(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = count.checked_mul(size).ok_or(AllocError::Overflow)?;
        let block = self.allocate_block(total)?;

        // Large blocks always sit in a fresh mapping, which the kernel hands
        // out zeroed. Small blocks may be reused and dirty.
        if block.state() != Some(State::Large) {
            unsafe { block.user_ptr().as_ptr().write_bytes(0, total) };
        }

        Ok(block.user_ptr())
    }

    /// Same as [`MemAlloc::try_allocate_zeroed`], returning null on failure.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        self.try_allocate_zeroed(count, size).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Gives `ptr` back to the allocator. Null pointers are ignored.
    ///
    /// Double frees and foreign pointers are reported instead of corrupting
    /// the heap, as long as the header in front of `ptr` is still readable.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by this allocator. Passing
    /// any other pointer, or a pointer released before, is detected on a
    /// best effort basis only: the memory in front of it may be unmapped.
    pub unsafe fn try_release(&self, ptr: *mut u8) -> Result<(), ProtocolViolation> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };

        let mut trace = TraceBuf::new();
        let released = {
            let mut heap = self.lock();
            heap.locate(&self.source, ptr)
                .and_then(|block| heap.release(&self.source, block, &mut trace))
        };

        if let Ok(Released::Unmap { addr, len }) = released {
            unsafe { self.source.release(addr, len) };
        }
        trace.emit();

        released.map(|_| ())
    }

    /// Gives `ptr` back to the allocator. Null pointers are ignored.
    ///
    /// # Safety
    ///
    /// See [`MemAlloc::try_release`].
    ///
    /// # Panics
    ///
    /// On a double free or a pointer that was not returned by this
    /// allocator. The heap lock is not held at that point.
    pub unsafe fn release(&self, ptr: *mut u8) {
        if let Err(violation) = unsafe { self.try_release(ptr) } {
            trace::error(format_args!("{violation}"));
            panic!("{violation}");
        }
    }

    /// Number of bytes that can be used through `ptr`, at least what was
    /// requested.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live pointer returned by this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, ProtocolViolation> {
        let mut heap = self.lock();
        let block = heap.locate(&self.source, ptr)?;
        heap.usable_size(block)
    }

    /// Snapshot of the allocator's counters and free list.
    pub fn stats(&self) -> HeapStats {
        self.lock().stats(&self.source)
    }
}

/// Requests aligned to more than [`utils::ALIGNMENT`] can not be served and
/// get a null pointer. Unwinding out of a global allocator is not allowed,
/// so protocol violations abort the process.
unsafe impl<S: PageSource + Sync> GlobalAlloc for MemAlloc<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > utils::ALIGNMENT {
            return ptr::null_mut();
        }
        self.allocate(layout.size())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > utils::ALIGNMENT {
            return ptr::null_mut();
        }
        self.allocate_zeroed(1, layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Err(violation) = unsafe { self.try_release(ptr) } {
            trace::error(format_args!("{violation}"));
            std::process::abort();
        }
    }
}
