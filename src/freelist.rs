use crate::{
    block::{BlockRef, State},
    trace::{Event, TraceBuf},
    utils::is_aligned,
};

/// Number of idle whole pages the free list keeps around before handing
/// them back to the kernel.
pub(crate) const RETAINED_PAGES: usize = 2;

/// Linked list to keep track of free [`Block`](crate::block::Block)s.
///
/// The list is intrusive: the `next` link lives in the header of every free
/// block, so keeping track of free memory never needs memory of its own.
///
/// ```text
///       head
///        |
/// +------|-------+     +--------------+     +--------------+
/// |  Block(free) | --> |  Block(free) | --> |  Block(free) | --> None
/// +--------------+     +--------------+     +--------------+
///    0x1000               0x1400               0x7000
/// ```
///
/// Blocks are kept sorted by address and no two consecutive blocks are
/// mergeable. Because of that, merging a newly freed block only ever has to
/// look at its left and right neighbours.
///
/// Two blocks are mergeable when they are adjacent in memory and the right
/// one does not start on a page boundary. Separate mappings may well be
/// adjacent too, but every free block must stay inside the page it was
/// carved from so that whole pages can be handed back one by one.
pub(crate) struct FreeList {
    head: Option<BlockRef>,
}

pub(crate) struct Iter {
    current: Option<BlockRef>,
}

impl FreeList {
    /// Creates a new empty list.
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// It tells whether the FreeList is empty or not.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn iter(&self) -> Iter {
        Iter { current: self.head }
    }

    /// Marks `block` as free and splices it into the list, merging it with
    /// the neighbours it touches. Returns the block that finally holds the
    /// freed memory, which is `block` itself or its left neighbour.
    pub fn insert(&mut self, block: BlockRef, page_size: usize, trace: &mut TraceBuf) -> BlockRef {
        block.set_state(State::Free);

        // Find the last block below `block`.
        let mut prev: Option<BlockRef> = None;
        let mut current = self.head;

        while let Some(node) = current {
            debug_assert_ne!(node, block, "block inserted twice");
            if node.addr() > block.addr() {
                break;
            }
            prev = Some(node);
            current = node.next();
        }

        block.set_next(current);
        match prev {
            Some(prev) => prev.set_next(Some(block)),
            None => self.head = Some(block),
        }

        if let Some(next) = current {
            if mergeable(block, next, page_size) {
                block.absorb(next);
                block.set_next(next.next());
                trace.push(Event::Coalesce, block.size());
            }
        }

        if let Some(prev) = prev {
            if mergeable(prev, block, page_size) {
                prev.absorb(block);
                prev.set_next(block.next());
                trace.push(Event::Coalesce, prev.size());
                return prev;
            }
        }

        block
    }

    /// Returns the first block, in address order, that can hold `size`
    /// bytes and unlinks it. This is the first-fit algorithm.
    pub fn find_and_remove(&mut self, size: usize) -> Option<BlockRef> {
        let mut prev: Option<BlockRef> = None;
        let mut current = self.head;

        while let Some(node) = current {
            if node.size() >= size {
                self.unlink(prev, node);
                return Some(node);
            }
            prev = Some(node);
            current = node.next();
        }

        // There is no free block we can use
        None
    }

    /// Unlinks every free block spanning exactly one whole page past the
    /// first [`RETAINED_PAGES`] of them and hands it to `release`.
    pub fn trim(&mut self, page_size: usize, page_capacity: usize, mut release: impl FnMut(BlockRef)) {
        let mut seen = 0;
        let mut prev: Option<BlockRef> = None;
        let mut current = self.head;

        while let Some(node) = current {
            let next = node.next();

            if node.size() == page_capacity && is_aligned(node.addr(), page_size) {
                seen += 1;
                if seen > RETAINED_PAGES {
                    self.unlink(prev, node);
                    release(node);
                    current = next;
                    continue;
                }
            }

            prev = Some(node);
            current = next;
        }
    }

    fn unlink(&mut self, prev: Option<BlockRef>, node: BlockRef) {
        match prev {
            Some(prev) => prev.set_next(node.next()),
            None => self.head = node.next(),
        }
        node.set_next(None);
    }
}

fn mergeable(left: BlockRef, right: BlockRef, page_size: usize) -> bool {
    left.is_adjacent_to(right) && !is_aligned(right.addr(), page_size)
}

impl Iterator for Iter {
    type Item = BlockRef;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;
        self.current = node.next();
        Some(node)
    }
}
