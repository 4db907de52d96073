use core::{
    mem::MaybeUninit,
    ptr::{self, NonNull},
};
use std::io;

use windows_sys::Win32::System::{Memory as win, SystemInformation as win_info};

/// Reserves and commits `len` bytes of read-write memory.
///
/// Committed pages are zero-filled by the system.
pub fn virtual_alloc(len: usize) -> io::Result<NonNull<u8>> {
    let ptr = unsafe {
        win::VirtualAlloc(
            ptr::null_mut(),
            len,
            win::MEM_COMMIT | win::MEM_RESERVE,
            win::PAGE_READWRITE,
        )
    };

    match NonNull::new(ptr as *mut u8) {
        Some(ptr) => Ok(ptr),
        None => Err(io::Error::last_os_error()),
    }
}

/// Locks a region into the working set so it is never paged out.
pub fn virtual_lock(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { win::VirtualLock(ptr.as_ptr() as _, len) } {
        0 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Unlocks a region previously locked with [`virtual_lock`].
pub fn virtual_unlock(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { win::VirtualUnlock(ptr.as_ptr() as _, len) } {
        0 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Releases a whole reservation made by [`virtual_alloc`].
// MEM_RELEASE requires a size of zero.
pub fn virtual_free(ptr: NonNull<u8>) -> io::Result<()> {
    match unsafe { win::VirtualFree(ptr.as_ptr() as _, 0, win::MEM_RELEASE) } {
        0 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

#[inline]
pub(super) fn page_size() -> usize {
    let sys_info = {
        let mut sys_info = MaybeUninit::<win_info::SYSTEM_INFO>::uninit();
        unsafe {
            win_info::GetSystemInfo(sys_info.as_mut_ptr());
            sys_info.assume_init()
        }
    };

    sys_info.dwPageSize as usize
}
