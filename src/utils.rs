//! Alignment arithmetic shared by the allocator modules.

/// Every block header and every user pointer handed out by the allocator is
/// aligned to this, the same guarantee `malloc` gives on 64 bit targets.
pub const ALIGNMENT: usize = 16;

/// It aligns `to_be_aligned` using `alignment`, which must be a power of two.
///
/// This is used to round user sizes up to a multiple of [`ALIGNMENT`] and mapping
/// lengths up to a multiple of the page size.
#[inline]
pub fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Same as [`align`] but returns `None` instead of wrapping around when
/// `to_be_aligned` is close to `usize::MAX`.
#[inline]
pub fn checked_align(to_be_aligned: usize, alignment: usize) -> Option<usize> {
    to_be_aligned
        .checked_add(alignment - 1)
        .map(|value| value & !(alignment - 1))
}

#[inline]
pub fn is_aligned(addr: usize, alignment: usize) -> bool {
    addr & (alignment - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    const WORD: usize = mem::size_of::<usize>();

    #[test]
    fn align_pointer_size() {
        for i in 0..10 {
            let sizes = (WORD * i + 1)..=(WORD * (i + 1));
            for size in sizes {
                assert_eq!(WORD * (i + 1), align(size, WORD));
            }
        }
    }

    #[test]
    fn align_page_size() {
        // For testing purposes we are assuming the page size is 4096
        let alignments = vec![(1..4096, 4096), (4097..8192, 8192)];

        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(expected, align(size, 4096))
            }
        }
    }

    #[test]
    fn checked_align_detects_wraparound() {
        assert_eq!(Some(8192), checked_align(4097, 4096));
        assert_eq!(None, checked_align(usize::MAX - 10, 4096));
    }

    #[test]
    fn align_to_block_alignment() {
        assert_eq!(16, align(1, ALIGNMENT));
        assert_eq!(16, align(16, ALIGNMENT));
        assert_eq!(32, align(17, ALIGNMENT));
    }

    #[test]
    fn aligned_addresses() {
        assert!(is_aligned(0x1000, 4096));
        assert!(!is_aligned(0x1008, 4096));
        assert!(is_aligned(0x1008, WORD));
    }
}
