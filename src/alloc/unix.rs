use core::ptr::NonNull;
use std::io;

use super::{ffi::unix as ffi, PageAllocator};

/// [`PageAllocator`] for Unix-based systems.
///
/// Pages come from anonymous private `mmap`s, are excluded from core dumps
/// where the platform supports it, and are pinned with `mlock`.
#[derive(Debug, Default)]
pub struct UnixPages(());

impl UnixPages {
    pub fn new() -> Self {
        Self(())
    }
}

impl PageAllocator for UnixPages {
    fn map(&self, len: usize) -> io::Result<NonNull<u8>> {
        let ptr = ffi::mmap_anonymous(len)?;

        if let Err(err) = ffi::exclude_from_dump(ptr, len) {
            // May fail (unchecked)
            let _ = ffi::munmap(ptr, len);
            return Err(err);
        }

        Ok(ptr)
    }

    fn lock(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::mlock(ptr, len)
    }

    fn unlock(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::munlock(ptr, len)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::munmap(ptr, len)
    }
}
