use core::{fmt, ops::Range};
use std::io;

use serde::Serialize;
use tracing::debug;
use zeroize::Zeroize;

use crate::alloc::{Allocation, SecurePool};
use crate::bytes::{ReadView, SecureBytes};
use crate::error::{AllocError, Result, ValidationError};

/// Growable byte buffer that lives entirely in secure memory.
///
/// Growing allocates a larger region, copies the contents across and drops
/// the old region, which wipes it. No byte ever passes through ordinary heap
/// memory.
pub struct SecureOutboundBuffer {
    allocation: Allocation,
    len: usize,
    // Set when an `io::Write` call could not grow the buffer.
    write_error: Option<AllocError>,
}

impl SecureOutboundBuffer {
    /// Allocates an empty buffer from `pool`.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Initial capacity in bytes; rounded up to the pool granule.
    /// * `pool` - Pool every region of this buffer is taken from, including
    ///   the larger ones allocated while growing.
    ///
    /// # Returns
    ///
    /// * The empty buffer, or the [`AllocError`] of the first allocation.
    pub fn with_capacity_in(capacity: usize, pool: &'static SecurePool) -> Result<Self, AllocError> {
        Ok(Self {
            allocation: pool.allocate(capacity)?,
            len: 0,
            write_error: None,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.allocation.capacity()
    }

    /// Appends `data`, growing the secure region if needed.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<(), AllocError> {
        self.reserve(data.len())?;
        self.allocation.as_mut_slice()[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    /// Borrows everything written so far.
    #[inline]
    pub fn borrow(&self) -> ReadView<'_> {
        ReadView::new(&self.allocation.as_slice()[..self.len])
    }

    /// Borrows a sub-range of what has been written.
    #[inline]
    pub fn borrow_range(&self, range: Range<usize>) -> ReadView<'_> {
        ReadView::new(&self.allocation.as_slice()[..self.len][range])
    }

    /// Converts the buffer into an immutable [`SecureBytes`] without copying.
    pub fn into_secure_bytes(self) -> SecureBytes {
        SecureBytes::from_allocation(self.allocation, self.len)
    }

    /// Appends the JSON encoding of `value`.
    ///
    /// On failure the buffer is cut back (and the cut bytes wiped) to its
    /// length before the call.
    pub(crate) fn write_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let start = self.len;
        if let Err(err) = serde_json::to_writer(&mut *self, value) {
            self.truncate(start);
            return Err(match self.take_write_error() {
                Some(alloc) => alloc.into(),
                None => {
                    debug!(error = %err, "json serialization failed");
                    ValidationError::InvalidUtf8("message").into()
                }
            });
        }
        Ok(())
    }

    /// Returns the allocation failure hit by a previous `io::Write` call.
    fn take_write_error(&mut self) -> Option<AllocError> {
        self.write_error.take()
    }

    fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.allocation.as_mut_slice()[len..self.len].zeroize();
            self.len = len;
        }
    }

    fn reserve(&mut self, additional: usize) -> Result<(), AllocError> {
        let required = self
            .len
            .checked_add(additional)
            .ok_or(AllocError::TooLarge { len: usize::MAX })?;
        if required <= self.capacity() {
            return Ok(());
        }

        let target = required.max(self.capacity().saturating_mul(2));
        let mut grown = self.allocation.pool().allocate(target)?;
        grown.as_mut_slice()[..self.len].copy_from_slice(&self.allocation.as_slice()[..self.len]);

        // The previous region is wiped as it drops here.
        self.allocation = grown;
        Ok(())
    }
}

impl io::Write for SecureOutboundBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.extend_from_slice(buf) {
            Ok(()) => Ok(buf.len()),
            Err(err) => {
                self.write_error = Some(err);
                Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "secure outbound buffer could not grow",
                ))
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for SecureOutboundBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureOutboundBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}
