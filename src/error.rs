/// Recoverable allocation failures. The null-returning entry points of
/// [`crate::MemAlloc`] turn every one of these into a null pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("zero sized allocation requested")]
    ZeroSize,
    #[error("requested size overflows usize")]
    Overflow,
    #[error("the kernel refused to map {0} bytes")]
    OutOfMemory(usize),
}

/// Misuse of the allocator by its caller. These are never recoverable: once
/// one is detected the heap metadata can no longer be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("double free of {0:#x}")]
    DoubleFree(usize),
    #[error("{0:#x} was not returned by this allocator")]
    InvalidPointer(usize),
}
