use std::sync::OnceLock;

#[cfg(target_family = "unix")]
pub mod unix;
#[cfg(target_family = "windows")]
pub mod windows;

/// Returns the size of one OS memory page, queried once per process.
///
/// # Platform-specific behavior
/// - **Unix:** `vm_page_size` on macOS, `sysconf(_SC_PAGESIZE)` elsewhere.
/// - **Windows:** `dwPageSize` from `GetSystemInfo`.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    #[cfg(target_family = "unix")]
    {
        *PAGE_SIZE.get_or_init(self::unix::page_size)
    }
    #[cfg(target_family = "windows")]
    {
        *PAGE_SIZE.get_or_init(self::windows::page_size)
    }
}

/// Rounds `len` up to a whole number of pages.
///
/// Returns `None` when the rounded length would overflow `usize`.
#[inline]
pub fn round_to_pages(len: usize) -> Option<usize> {
    let page = page_size();
    len.checked_add(page - 1).map(|n| n & !(page - 1))
}
