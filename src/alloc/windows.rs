use core::ptr::NonNull;
use std::io;

use super::{ffi::windows as ffi, PageAllocator};

/// [`PageAllocator`] for Windows.
///
/// Pages are committed with `VirtualAlloc` and pinned into the working set
/// with `VirtualLock`.
#[derive(Debug, Default)]
pub struct WindowsPages(());

impl WindowsPages {
    pub fn new() -> Self {
        Self(())
    }
}

impl PageAllocator for WindowsPages {
    fn map(&self, len: usize) -> io::Result<NonNull<u8>> {
        ffi::virtual_alloc(len)
    }

    fn lock(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::virtual_lock(ptr, len)
    }

    fn unlock(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::virtual_unlock(ptr, len)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        ffi::virtual_free(ptr)
    }
}
