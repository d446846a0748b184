//! Page Source: the only place where memory is requested from or returned to
//! the operating system.

use std::ptr::NonNull;

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The allocator has nothing to do with the concrete
/// implementations / APIs offered by each kernel, it only needs page sized
/// chunks of zeroed, read-write memory.
///
/// # Safety
///
/// Implementors must hand out regions that are valid for reads and writes
/// of `len` bytes, aligned to [`PageSource::page_size`], zero-initialized, and
/// disjoint from every other region that has been acquired and not yet
/// released.
pub unsafe trait PageSource {
    /// Returns the virtual memory page size in bytes. Must be a power of two
    /// and must not change during the lifetime of the source.
    fn page_size(&self) -> usize;

    /// Request a memory region of size `len`, a multiple of the page size.
    /// Returns `None` if the underlying syscall fails.
    fn acquire(&self, len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    ///
    /// # Safety
    ///
    /// `addr` and `len` must describe exactly one region previously obtained
    /// from [`PageSource::acquire`] and not released since.
    unsafe fn release(&self, addr: NonNull<u8>, len: usize);
}

/// The operating system as a [`PageSource`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Kernel;

#[cfg(unix)]
mod unix {
    use super::{Kernel, PageSource};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    unsafe impl PageSource for Kernel {
        fn page_size(&self) -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }

        fn acquire(&self, len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                match mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn release(&self, addr: NonNull<u8>, len: usize) {
            let result = unsafe { munmap(addr.as_ptr().cast::<c_void>(), len as size_t) };
            debug_assert_eq!(result, 0, "munmap rejected a region we mapped");
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{Kernel, PageSource};

    use windows::Win32::System::{Memory, SystemInformation};

    unsafe impl PageSource for Kernel {
        fn page_size(&self) -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }

        fn acquire(&self, len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn release(&self, addr: NonNull<u8>, _len: usize) {
            // MEM_RELEASE frees the whole reservation, which always matches
            // one earlier `acquire`.
            unsafe {
                let _ = Memory::VirtualFree(addr.as_ptr().cast::<c_void>(), 0, Memory::MEM_RELEASE);
            }
        }
    }
}
