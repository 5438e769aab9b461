use std::ptr::NonNull;

/// This trait provides an abstraction over the raw memory source the pool
/// carves its blocks out of. The pool only ever asks for whole blocks, so the
/// backend sees one request per block and never per object.
///
/// Implementations are stateless: both operations are associated functions,
/// which lets a [`crate::Pool`] be parameterized by the backend type alone.
pub trait RawMemory {
    /// Request `len` bytes aligned to `align`. `align` is always a power of
    /// two and at least the pointer size. Returns `None` when the memory
    /// cannot be obtained.
    ///
    /// # Safety
    ///
    /// `len` must be non zero.
    unsafe fn request_memory(len: usize, align: usize) -> Option<NonNull<u8>>;

    /// Returns memory obtained from [`RawMemory::request_memory`] with the
    /// same `len` and `align`.
    ///
    /// # Safety
    ///
    /// `addr` must come from `request_memory` of the same implementation and
    /// must not be used afterwards.
    unsafe fn return_memory(addr: NonNull<u8>, len: usize, align: usize);
}

/// The platform memory backend.
///
/// On unix it goes through `posix_memalign` / `free`. On windows blocks are
/// requested with `VirtualAlloc`, whose results are aligned to the
/// allocation granularity (64 KiB), so bigger alignments are refused.
pub struct Kernel;

#[cfg(unix)]
mod unix {
    use super::{Kernel, RawMemory};

    use libc::{c_void, free, posix_memalign};

    use std::ptr::{self, NonNull};

    impl RawMemory for Kernel {
        unsafe fn request_memory(len: usize, align: usize) -> Option<NonNull<u8>> {
            let mut addr: *mut c_void = ptr::null_mut();

            unsafe {
                match posix_memalign(&mut addr, align, len) {
                    0 => NonNull::new(addr.cast::<u8>()),
                    _ => None,
                }
            }
        }

        unsafe fn return_memory(addr: NonNull<u8>, _len: usize, _align: usize) {
            unsafe { free(addr.as_ptr().cast::<c_void>()) }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{os::raw::c_void, ptr::NonNull};

    use super::{Kernel, RawMemory};

    use windows::Win32::System::Memory;

    /// `VirtualAlloc` hands out addresses aligned to the allocation granularity.
    const ALLOCATION_GRANULARITY: usize = 64 * 1024;

    impl RawMemory for Kernel {
        unsafe fn request_memory(len: usize, align: usize) -> Option<NonNull<u8>> {
            if align > ALLOCATION_GRANULARITY {
                return None;
            }

            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: NonNull<u8>, _len: usize, _align: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr.as_ptr() as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }
    }
}
