use std::{mem, ptr::NonNull};

use crate::utils::{ALIGNMENT, is_aligned};

/// Header size of a block. User pointers are always this many bytes past
/// the start of their block.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<Block>();

const FREE_TAG: usize = 0xF4EE_B10C;
const SMALL_TAG: usize = 0x5A11_B10C;
const LARGE_TAG: usize = 0x1A46_B10C;

/// This is the structure of a block header. The fields of the block are its
/// metadata, content is placed after this header.
///
/// ```text
/// +---------------------+ <------+
/// |        size         |        |
/// +---------------------+        |
/// |         tag         |        | -> Header
/// +---------------------+        |
/// |        next         |        |
/// +---------------------+ <------+ <- pointer returned to the user
/// |       Content       |        |
/// |         ...         |        | -> `size` bytes of addressable content
/// |         ...         |        |
/// +---------------------+ <------+
/// ```
///
/// The header is padded to [`ALIGNMENT`], so as long as `size` stays a
/// multiple of it, both the content and the header that follows a block are
/// aligned too.
#[repr(C, align(16))]
pub(crate) struct Block {
    /// Usable bytes after the header.
    size: usize,
    /// One of the state tags. Anything else means the header was never
    /// written by us.
    tag: usize,
    /// Next free block. Only meaningful while the block is in the free list.
    next: Option<NonNull<Block>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Free,
    /// Allocated and carved out of a page owned by the free list machinery.
    Small,
    /// Allocated and backed by its own dedicated mapping.
    Large,
}

impl State {
    fn tag(self) -> usize {
        match self {
            State::Free => FREE_TAG,
            State::Small => SMALL_TAG,
            State::Large => LARGE_TAG,
        }
    }

    fn from_tag(tag: usize) -> Option<Self> {
        match tag {
            FREE_TAG => Some(State::Free),
            SMALL_TAG => Some(State::Small),
            LARGE_TAG => Some(State::Large),
            _ => None,
        }
    }
}

/// Handle to a block header living somewhere in memory we mapped.
///
/// All pointer arithmetic of the allocator is confined to this type. The
/// constructors are `unsafe` and establish the invariant every accessor
/// relies on: the handle points to a readable and writable, aligned
/// [`Block`] header inside a live mapping. A handle must not be used once
/// the mapping backing it has been returned to the [`crate::PageSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockRef(NonNull<Block>);

impl BlockRef {
    /// Writes a fresh header at `addr` and returns a handle to it.
    ///
    /// # Safety
    ///
    /// `addr` must be aligned to [`ALIGNMENT`] and valid for writes of
    /// `BLOCK_HEADER_SIZE + size` bytes.
    pub unsafe fn init(addr: NonNull<u8>, size: usize, state: State) -> Self {
        let block = addr.cast::<Block>();
        unsafe {
            block.as_ptr().write(Block {
                size,
                tag: state.tag(),
                next: None,
            });
        }
        Self(block)
    }

    /// Recovers the block of a pointer handed out to the user.
    ///
    /// Returns `None` when `ptr` can not be one of ours because of its
    /// alignment. Whether the header really belongs to us is up to the caller
    /// to check through [`BlockRef::state`].
    ///
    /// # Safety
    ///
    /// The `BLOCK_HEADER_SIZE` bytes before `ptr` must be readable.
    pub unsafe fn from_user(ptr: NonNull<u8>) -> Option<Self> {
        let addr = ptr.as_ptr() as usize;
        if !is_aligned(addr, ALIGNMENT) || addr < BLOCK_HEADER_SIZE {
            return None;
        }
        let header = unsafe { ptr.as_ptr().sub(BLOCK_HEADER_SIZE) };
        NonNull::new(header.cast::<Block>()).map(Self)
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub fn as_ptr(self) -> NonNull<u8> {
        self.0.cast()
    }

    /// Pointer to the first byte after the header.
    #[inline]
    pub fn user_ptr(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.as_ptr().as_ptr().add(BLOCK_HEADER_SIZE)) }
    }

    #[inline]
    pub fn size(self) -> usize {
        unsafe { (*self.0.as_ptr()).size }
    }

    #[inline]
    pub fn set_size(self, size: usize) {
        unsafe { (*self.0.as_ptr()).size = size }
    }

    #[inline]
    pub fn state(self) -> Option<State> {
        State::from_tag(unsafe { (*self.0.as_ptr()).tag })
    }

    #[inline]
    pub fn set_state(self, state: State) {
        unsafe { (*self.0.as_ptr()).tag = state.tag() }
    }

    #[inline]
    pub fn next(self) -> Option<BlockRef> {
        unsafe { (*self.0.as_ptr()).next.map(BlockRef) }
    }

    #[inline]
    pub fn set_next(self, next: Option<BlockRef>) {
        unsafe { (*self.0.as_ptr()).next = next.map(|block| block.0) }
    }

    /// Address one past the last content byte.
    #[inline]
    pub fn end(self) -> usize {
        self.addr() + BLOCK_HEADER_SIZE + self.size()
    }

    /// Whether `other` starts exactly where `self` ends.
    #[inline]
    pub fn is_adjacent_to(self, other: BlockRef) -> bool {
        self.end() == other.addr()
    }

    /// Absorbs `other`, which must follow `self` in memory, header included.
    pub fn absorb(self, other: BlockRef) {
        debug_assert!(self.is_adjacent_to(other));
        self.set_size(self.size() + BLOCK_HEADER_SIZE + other.size());
    }

    /// Shrinks this block to `size` content bytes and turns the rest into a
    /// new free block, which is returned. The caller checks that the rest is
    /// big enough to hold a header.
    pub fn split(self, size: usize) -> BlockRef {
        let remaining = self.size() - size - BLOCK_HEADER_SIZE;
        self.set_size(size);

        unsafe {
            let addr = NonNull::new_unchecked(self.user_ptr().as_ptr().add(size));
            BlockRef::init(addr, remaining, State::Free)
        }
    }
}
