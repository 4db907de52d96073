//! Locked, zero-on-release memory.
//!
//! [`PageAllocator`] is the platform seam: it maps, locks, unlocks and unmaps
//! whole pages. [`SecurePool`] sits on top of it and hands out
//! [`Allocation`]s rounded to [`GRANULE`] bytes.

use core::ptr::NonNull;
use std::io;

use serde::{Deserialize, Serialize};

pub(crate) mod ffi;
mod pool;
#[cfg(target_family = "unix")]
mod unix;
#[cfg(target_family = "windows")]
mod windows;

#[cfg(not(any(target_family = "unix", target_family = "windows")))]
compile_error!("secure_chat supports only unix and windows targets");

pub use pool::{Allocation, PoolStats, SecurePool};
#[cfg(target_family = "unix")]
pub use unix::UnixPages as SystemPages;
#[cfg(target_family = "windows")]
pub use windows::WindowsPages as SystemPages;

/// Allocation granularity in bytes. Every allocation's capacity is a
/// multiple of this.
pub const GRANULE: usize = 64;

/// What the pool does when the OS refuses to lock a fresh page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Fail the allocation with [`AllocError::Lock`](crate::AllocError::Lock).
    #[default]
    Required,
    /// Log a warning and hand out unlocked (still zeroed-on-release) memory.
    BestEffort,
}

/// Page-level memory provider used by [`SecurePool`].
///
/// Implementors work on whole pages only; `len` is always a multiple of
/// [`PageAllocator::page_size`].
pub trait PageAllocator: Send + Sync {
    /// Size of one page in bytes.
    fn page_size(&self) -> usize {
        ffi::page_size()
    }

    /// Maps `len` bytes of zero-filled, read-write memory.
    fn map(&self, len: usize) -> io::Result<NonNull<u8>>;

    /// Pins a mapped region so it is never swapped out.
    fn lock(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Reverses [`PageAllocator::lock`].
    fn unlock(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Returns a region to the OS.
    ///
    /// # Safety
    /// `ptr` and `len` must describe exactly one region returned by
    /// [`PageAllocator::map`], and the region must not be accessed afterwards.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_policy_defaults_to_required() {
        assert_eq!(LockPolicy::default(), LockPolicy::Required);
    }

    #[test]
    fn test_lock_policy_json_names() {
        assert_eq!(
            serde_json::to_value(LockPolicy::BestEffort).expect("Failed to serialize"),
            serde_json::json!("best_effort")
        );

        let policies: Vec<LockPolicy> =
            serde_json::from_str(r#"["required", "best_effort"]"#).expect("Failed to parse");
        assert_eq!(policies, [LockPolicy::Required, LockPolicy::BestEffort]);

        assert!(serde_json::from_str::<LockPolicy>(r#""BestEffort""#).is_err());
    }
}
