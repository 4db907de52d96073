use core::{fmt, ops::Deref};

use subtle::ConstantTimeEq;

use crate::alloc::{Allocation, SecurePool};
use crate::error::AllocError;

/// A secret byte string stored in locked memory.
///
/// The content is copied in once, is never mutated, and can only be read
/// through a scoped [`ReadView`]. Dropping the value wipes the whole
/// capacity (not just `len` bytes) and releases the allocation.
///
/// `SecureBytes` is neither `Clone` nor `PartialEq`; use
/// [`SecureBytes::ct_eq`] for comparisons.
pub struct SecureBytes {
    allocation: Allocation,
    len: usize,
}

impl SecureBytes {
    /// Copies `data` into a fresh allocation from the global pool.
    pub fn from_bytes(data: &[u8]) -> Result<Self, AllocError> {
        Self::from_bytes_in(data, SecurePool::global())
    }

    /// Copies `data` into a fresh allocation from `pool`.
    ///
    /// # Arguments
    ///
    /// * `data` - Bytes to copy. The slice itself is left untouched.
    /// * `pool` - Pool to allocate from.
    ///
    /// # Returns
    ///
    /// * The new buffer, or the pool's [`AllocError`].
    pub fn from_bytes_in(data: &[u8], pool: &'static SecurePool) -> Result<Self, AllocError> {
        let mut allocation = pool.allocate(data.len())?;
        allocation.as_mut_slice()[..data.len()].copy_from_slice(data);

        Ok(Self {
            allocation,
            len: data.len(),
        })
    }

    /// Takes over an allocation whose first `len` bytes are initialized.
    pub(crate) fn from_allocation(allocation: Allocation, len: usize) -> Self {
        debug_assert!(len <= allocation.capacity());
        Self { allocation, len }
    }

    /// Borrows the logical bytes.
    ///
    /// Consumers of the view (serializers, transports) must not copy it into
    /// memory this crate does not manage.
    #[inline]
    pub fn borrow(&self) -> ReadView<'_> {
        ReadView::new(&self.allocation.as_slice()[..self.len])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated bytes, rounded up to the allocator granularity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.allocation.capacity()
    }

    /// Whether the backing memory is pinned against swapping.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.allocation.is_locked()
    }

    /// Lossy UTF-8 rendering for diagnostics only.
    ///
    /// Never use this for protocol data: whatever the caller formats it into
    /// is ordinary memory.
    pub fn as_utf8_display(&self) -> Utf8Display<'_> {
        Utf8Display(self.borrow())
    }

    /// Constant-time comparison of the contents.
    ///
    /// Only the byte comparison is constant-time; a length mismatch returns
    /// early.
    pub fn ct_eq(&self, other: &SecureBytes) -> bool {
        self.borrow().ct_eq(&other.borrow()).into()
    }
}

impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBytes")
            .field("len", &self.len)
            .field("locked", &self.is_locked())
            .field("content", &"[REDACTED]")
            .finish()
    }
}

/// Scoped, read-only view over the bytes of a [`SecureBytes`] (or of an
/// outbound buffer). It cannot outlive its owner and cannot be cloned.
pub struct ReadView<'a> {
    bytes: &'a [u8],
}

impl<'a> ReadView<'a> {
    #[inline]
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }
}

impl Deref for ReadView<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl AsRef<[u8]> for ReadView<'_> {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.bytes
    }
}

impl fmt::Debug for ReadView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadView")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

/// [`fmt::Display`] adapter returned by [`SecureBytes::as_utf8_display`].
///
/// Invalid sequences are rendered as U+FFFD without building an
/// intermediate `String`.
pub struct Utf8Display<'a>(ReadView<'a>);

impl fmt::Display for Utf8Display<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for chunk in self.0.utf8_chunks() {
            f.write_str(chunk.valid())?;
            if !chunk.invalid().is_empty() {
                f.write_str("\u{FFFD}")?;
            }
        }
        Ok(())
    }
}
