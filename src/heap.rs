use std::ptr::NonNull;

use crate::{
    block::{BLOCK_HEADER_SIZE, BlockRef, State},
    error::{AllocError, ProtocolViolation},
    freelist::FreeList,
    kernel::PageSource,
    trace::{Event, TraceBuf},
    utils::{ALIGNMENT, align, checked_align},
};

/// A free block is only split when what remains can hold a header and
/// another header's worth of content. Smaller leftovers stay attached to
/// the allocation.
const SPLIT_THRESHOLD: usize = 2 * BLOCK_HEADER_SIZE;

/// Point in time view of the allocator, see [`crate::MemAlloc::stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Mappings requested from the page source so far.
    pub pages_acquired: usize,
    /// Mappings given back to the page source so far.
    pub pages_released: usize,
    /// Bytes currently mapped, headers included.
    pub mapped_bytes: usize,
    /// Blocks in the free list.
    pub free_blocks: usize,
    /// Content bytes of all blocks in the free list.
    pub free_bytes: usize,
    /// Free blocks spanning exactly one whole page.
    pub idle_pages: usize,
}

/// What the caller has to do once the lock is dropped after a release.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Released {
    /// The block went back to the free list.
    Retained,
    /// The block had its own mapping, which must be handed back to the
    /// page source.
    Unmap { addr: NonNull<u8>, len: usize },
}

/// Everything behind the allocator lock: the free list and the lazily
/// queried page size.
pub(crate) struct Heap {
    free_list: FreeList,
    /// Zero until the first operation asks the page source for it.
    page_size: usize,
    stats: HeapStats,
}

// The raw pointers in here all point into mappings owned by the heap
// itself, so the heap can move between threads together with them.
unsafe impl Send for Heap {}

impl Heap {
    pub const fn new() -> Self {
        Self {
            free_list: FreeList::new(),
            page_size: 0,
            stats: HeapStats {
                pages_acquired: 0,
                pages_released: 0,
                mapped_bytes: 0,
                free_blocks: 0,
                free_bytes: 0,
                idle_pages: 0,
            },
        }
    }

    fn page_size(&mut self, source: &impl PageSource) -> usize {
        if self.page_size == 0 {
            self.page_size = source.page_size();
            debug_assert!(self.page_size.is_power_of_two() && self.page_size > SPLIT_THRESHOLD);
        }
        self.page_size
    }

    /// Content bytes of a block spanning a whole page.
    fn page_capacity(&mut self, source: &impl PageSource) -> usize {
        self.page_size(source) - BLOCK_HEADER_SIZE
    }

    /// Returns an allocated block of at least `size` content bytes. On
    /// failure the heap is left untouched.
    pub fn allocate(
        &mut self,
        source: &impl PageSource,
        size: usize,
        trace: &mut TraceBuf,
    ) -> Result<BlockRef, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }

        if size < self.page_capacity(source) {
            self.allocate_small(source, size, trace)
        } else {
            self.allocate_large(source, size, trace)
        }
    }

    fn allocate_small(
        &mut self,
        source: &impl PageSource,
        size: usize,
        trace: &mut TraceBuf,
    ) -> Result<BlockRef, AllocError> {
        // Page capacity is a multiple of the alignment, so this still fits.
        let size = align(size, ALIGNMENT);
        let page_size = self.page_size(source);

        let block = match self.free_list.find_and_remove(size) {
            Some(block) => block,
            None => {
                let addr = self.map(source, page_size, trace)?;
                unsafe { BlockRef::init(addr, page_size - BLOCK_HEADER_SIZE, State::Free) }
            }
        };

        if block.size() - size >= SPLIT_THRESHOLD {
            let rest = block.split(size);
            trace.push(Event::Split, rest.size());
            self.free_list.insert(rest, page_size, trace);
        }

        block.set_state(State::Small);
        trace.push(Event::Allocate, block.size());

        Ok(block)
    }

    /// Large blocks get a mapping of their own, never shared with anything.
    fn allocate_large(
        &mut self,
        source: &impl PageSource,
        size: usize,
        trace: &mut TraceBuf,
    ) -> Result<BlockRef, AllocError> {
        let page_size = self.page_size(source);
        let len = size
            .checked_add(BLOCK_HEADER_SIZE)
            .and_then(|needed| checked_align(needed, page_size))
            .ok_or(AllocError::Overflow)?;

        let addr = self.map(source, len, trace)?;
        let block = unsafe { BlockRef::init(addr, len - BLOCK_HEADER_SIZE, State::Large) };
        trace.push(Event::Allocate, block.size());

        Ok(block)
    }

    fn map(&mut self, source: &impl PageSource, len: usize, trace: &mut TraceBuf) -> Result<NonNull<u8>, AllocError> {
        let addr = source.acquire(len).ok_or(AllocError::OutOfMemory(len))?;

        self.stats.pages_acquired += 1;
        self.stats.mapped_bytes += len;
        trace.push(Event::PageAcquire, len);

        Ok(addr)
    }

    /// Finds the header in front of a user pointer without touching memory
    /// that can not be ours. Nothing is ever mapped in the first page, so a
    /// header there means a corrupted or made up pointer.
    pub fn locate(&mut self, source: &impl PageSource, ptr: NonNull<u8>) -> Result<BlockRef, ProtocolViolation> {
        let invalid = ProtocolViolation::InvalidPointer(ptr.as_ptr() as usize);
        let block = unsafe { BlockRef::from_user(ptr) }.ok_or(invalid)?;

        if block.addr() < self.page_size(source) {
            return Err(invalid);
        }
        Ok(block)
    }

    /// Takes back an allocated block.
    ///
    /// Small blocks are merged into the free list right away, which may give
    /// surplus idle pages back to `source`. Large blocks are only validated
    /// and accounted for here; unmapping them is left to the caller so that
    /// it can happen without the lock.
    pub fn release(
        &mut self,
        source: &impl PageSource,
        block: BlockRef,
        trace: &mut TraceBuf,
    ) -> Result<Released, ProtocolViolation> {
        let user = block.user_ptr().as_ptr() as usize;

        match block.state() {
            None => Err(ProtocolViolation::InvalidPointer(user)),
            Some(State::Free) => Err(ProtocolViolation::DoubleFree(user)),
            Some(State::Large) => {
                let len = block.size() + BLOCK_HEADER_SIZE;
                // The header goes away with the mapping, but until then a
                // concurrent second release must not pass validation.
                block.set_state(State::Free);

                trace.push(Event::Free, block.size());
                trace.push(Event::PageRelease, len);
                self.stats.pages_released += 1;
                self.stats.mapped_bytes -= len;

                Ok(Released::Unmap { addr: block.as_ptr(), len })
            }
            Some(State::Small) => {
                let page_size = self.page_size(source);
                trace.push(Event::Free, block.size());
                self.free_list.insert(block, page_size, trace);
                self.trim(source, trace);

                Ok(Released::Retained)
            }
        }
    }

    /// Gives idle whole pages past the retention cap back to `source`.
    fn trim(&mut self, source: &impl PageSource, trace: &mut TraceBuf) {
        let page_size = self.page_size(source);
        let page_capacity = page_size - BLOCK_HEADER_SIZE;
        let stats = &mut self.stats;

        self.free_list.trim(page_size, page_capacity, |block| {
            unsafe { source.release(block.as_ptr(), page_size) };
            stats.pages_released += 1;
            stats.mapped_bytes -= page_size;
            trace.push(Event::PageRelease, page_size);
        });
    }

    /// Content bytes of an allocated block.
    pub fn usable_size(&self, block: BlockRef) -> Result<usize, ProtocolViolation> {
        let user = block.user_ptr().as_ptr() as usize;

        match block.state() {
            Some(State::Small | State::Large) => Ok(block.size()),
            Some(State::Free) => Err(ProtocolViolation::DoubleFree(user)),
            None => Err(ProtocolViolation::InvalidPointer(user)),
        }
    }

    pub fn stats(&mut self, source: &impl PageSource) -> HeapStats {
        let page_capacity = self.page_capacity(source);
        let mut stats = self.stats;
        if self.free_list.is_empty() {
            return stats;
        }

        for block in self.free_list.iter() {
            stats.free_blocks += 1;
            stats.free_bytes += block.size();
            if block.size() == page_capacity {
                stats.idle_pages += 1;
            }
        }

        stats
    }
}
