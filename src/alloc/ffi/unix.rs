use core::ptr::{self, NonNull};
use std::io;

/// Maps `len` bytes of private, anonymous, read-write memory.
///
/// Anonymous mappings are zero-filled by the kernel, so the returned region
/// needs no further initialization.
///
/// # Returns
///
/// * The start of the mapping, or the OS error from `mmap`.
pub fn mmap_anonymous(len: usize) -> io::Result<NonNull<u8>> {
    let mmap = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };

    match mmap {
        libc::MAP_FAILED => Err(io::Error::last_os_error()),
        ptr => Ok(unsafe { NonNull::new_unchecked(ptr as *mut u8) }),
    }
}

/// Excludes a region from core dumps (`MADV_DONTDUMP`, or `MADV_NOCORE` on
/// the BSDs that spell it that way).
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
pub fn exclude_from_dump(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    #[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
    let advice = libc::MADV_NOCORE;
    #[cfg(not(any(target_os = "freebsd", target_os = "dragonfly")))]
    let advice = libc::MADV_DONTDUMP;

    match unsafe { libc::madvise(ptr.as_ptr() as _, len, advice) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// No dump-exclusion advice exists on this platform.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly"
)))]
pub fn exclude_from_dump(_ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
    Ok(())
}

/// Locks a region in RAM so it is never written to swap.
///
/// Fails with `ENOMEM`/`EPERM` once `RLIMIT_MEMLOCK` is exhausted.
pub fn mlock(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { libc::mlock(ptr.as_ptr() as _, len) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Unlocks a region previously locked with [`mlock`].
pub fn munlock(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { libc::munlock(ptr.as_ptr() as _, len) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Unmaps a region obtained from [`mmap_anonymous`].
pub fn munmap(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { libc::munmap(ptr.as_ptr() as _, len) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

#[inline]
pub(super) fn page_size() -> usize {
    #[cfg(target_os = "macos")]
    unsafe {
        libc::vm_page_size as usize
    }
    #[cfg(not(target_os = "macos"))]
    unsafe {
        libc::sysconf(libc::_SC_PAGESIZE) as usize
    }
}
