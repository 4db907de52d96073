use core::{fmt, ptr::NonNull, slice};
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Mutex, MutexGuard, OnceLock, PoisonError,
};

use tracing::{debug, trace, warn};
use zeroize::Zeroize;

use super::{ffi, LockPolicy, PageAllocator, SystemPages, GRANULE};
use crate::error::AllocError;

/// Process-wide pool of locked memory.
///
/// Small requests (up to a quarter of a page) are carved out of shared
/// locked pages ("slabs") in [`GRANULE`]-sized slots; larger requests get a
/// dedicated page-rounded region. Every slot or region is zeroed when its
/// [`Allocation`] is dropped, before the pool reuses or unmaps it.
///
/// A single mutex guards the slab list. Zeroing, mapping and unmapping all
/// happen outside of it.
pub struct SecurePool {
    backend: Box<dyn PageAllocator>,
    policy: LockPolicy,
    page_size: usize,
    slabs: Mutex<Vec<Slab>>,
    counters: Counters,
}

/// Point-in-time view of a pool's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Allocations handed out and not yet dropped.
    pub live_allocations: usize,
    /// Sum of the capacities of live allocations.
    pub live_bytes: usize,
    /// Slabs plus dedicated regions currently mapped.
    pub mapped_regions: usize,
    /// How many of the mapped regions are locked.
    pub locked_regions: usize,
    pub total_allocations: u64,
    pub total_releases: u64,
    /// Releases whose region read back as all zero after wiping.
    pub verified_zero_releases: u64,
}

#[derive(Default)]
struct Counters {
    live_allocations: AtomicUsize,
    live_bytes: AtomicUsize,
    mapped_regions: AtomicUsize,
    locked_regions: AtomicUsize,
    total_allocations: AtomicU64,
    total_releases: AtomicU64,
    verified_zero_releases: AtomicU64,
}

/// One locked page shared by several small allocations.
struct Slab {
    base: NonNull<u8>,
    locked: bool,
    used: Vec<u64>,
    slots: usize,
    live: usize,
}

// Safety: the base pointer is only dereferenced by the owner of a slot; the
// slab itself only stores bookkeeping and is always accessed under the mutex.
unsafe impl Send for Slab {}

impl Slab {
    fn new(base: NonNull<u8>, locked: bool, slots: usize) -> Self {
        Self {
            base,
            locked,
            used: vec![0; slots.div_ceil(64)],
            slots,
            live: 0,
        }
    }

    #[inline]
    fn is_used(&self, slot: usize) -> bool {
        self.used[slot / 64] & (1 << (slot % 64)) != 0
    }

    #[inline]
    fn set(&mut self, slot: usize, used: bool) {
        let bit = 1 << (slot % 64);
        if used {
            self.used[slot / 64] |= bit;
        } else {
            self.used[slot / 64] &= !bit;
        }
    }

    /// First-fit search for `count` contiguous free slots.
    fn find_free(&self, count: usize) -> Option<usize> {
        let mut run = 0;
        for slot in 0..self.slots {
            if self.is_used(slot) {
                run = 0;
                continue;
            }

            run += 1;
            if run == count {
                return Some(slot + 1 - count);
            }
        }

        None
    }

    fn claim(&mut self, first: usize, count: usize) -> NonNull<u8> {
        for slot in first..first + count {
            debug_assert!(!self.is_used(slot), "slot {slot} handed out twice");
            self.set(slot, true);
        }
        self.live += 1;

        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(first * GRANULE)) }
    }

    fn free(&mut self, first: usize, count: usize) {
        for slot in first..first + count {
            debug_assert!(self.is_used(slot), "slot {slot} released twice");
            self.set(slot, false);
        }
        self.live -= 1;
    }
}

/// Where an allocation's memory lives, so release knows what to give back.
#[derive(Debug, Clone, Copy)]
enum Origin {
    Slab { base: NonNull<u8>, first: usize },
    Region { len: usize },
}

/// Exclusive handle to one zero-initialized secure region.
///
/// Dropping it wipes the whole capacity and returns the memory to its
/// pool, so a handle can be released at most once and never used after.
pub struct Allocation {
    ptr: NonNull<u8>,
    capacity: usize,
    locked: bool,
    origin: Origin,
    pool: &'static SecurePool,
}

// Safety: an Allocation owns its region exclusively; shared references only
// ever hand out `&[u8]`.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    /// Usable bytes, always a multiple of [`GRANULE`].
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the backing pages are pinned against swapping.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    #[inline]
    pub fn pool(&self) -> &'static SecurePool {
        self.pool
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.pool.release(self);
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("capacity", &self.capacity)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl SecurePool {
    /// Creates a pool over the platform's page allocator.
    ///
    /// Allocating requires a `'static` pool: use [`SecurePool::global`] or
    /// [`SecurePool::leak`].
    pub fn new(policy: LockPolicy) -> Self {
        Self::with_backend(Box::new(SystemPages::new()), policy)
    }

    /// Creates a pool over a custom page provider.
    ///
    /// # Panics
    ///
    /// * If the backend's page size is not a power of two of at least four
    ///   granules.
    pub fn with_backend(backend: Box<dyn PageAllocator>, policy: LockPolicy) -> Self {
        let page_size = backend.page_size();
        assert!(
            page_size.is_power_of_two() && page_size >= GRANULE * 4,
            "unsupported page size {page_size}"
        );

        Self {
            backend,
            policy,
            page_size,
            slabs: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    /// The lazily created process-wide pool, with [`LockPolicy::Required`].
    pub fn global() -> &'static SecurePool {
        static GLOBAL: OnceLock<SecurePool> = OnceLock::new();
        GLOBAL.get_or_init(|| SecurePool::new(LockPolicy::Required))
    }

    /// Moves the pool to the heap for the rest of the process.
    pub fn leak(self) -> &'static SecurePool {
        Box::leak(Box::new(self))
    }

    #[inline]
    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Reserves at least `len` zeroed, locked bytes.
    ///
    /// Zero-length requests still receive one granule.
    ///
    /// # Arguments
    ///
    /// * `len` - Minimum usable size in bytes.
    ///
    /// # Returns
    ///
    /// * An [`Allocation`] whose capacity is `len` rounded up to [`GRANULE`].
    /// * [`AllocError::TooLarge`] when the rounded size overflows `isize`.
    /// * [`AllocError::Map`] when the OS refuses fresh pages.
    /// * [`AllocError::Lock`] when locking fails under [`LockPolicy::Required`].
    pub fn allocate(&'static self, len: usize) -> Result<Allocation, AllocError> {
        let capacity = len
            .max(1)
            .checked_next_multiple_of(GRANULE)
            .filter(|cap| *cap <= isize::MAX as usize)
            .ok_or(AllocError::TooLarge { len })?;

        let allocation = if capacity <= self.page_size / 4 {
            self.allocate_slot(capacity)?
        } else {
            self.allocate_region(capacity)?
        };

        self.counters.live_allocations.fetch_add(1, Ordering::Relaxed);
        self.counters.live_bytes.fetch_add(capacity, Ordering::Relaxed);
        self.counters.total_allocations.fetch_add(1, Ordering::Relaxed);
        trace!(capacity, locked = allocation.locked, "secure allocation");

        Ok(allocation)
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            live_allocations: c.live_allocations.load(Ordering::Relaxed),
            live_bytes: c.live_bytes.load(Ordering::Relaxed),
            mapped_regions: c.mapped_regions.load(Ordering::Relaxed),
            locked_regions: c.locked_regions.load(Ordering::Relaxed),
            total_allocations: c.total_allocations.load(Ordering::Relaxed),
            total_releases: c.total_releases.load(Ordering::Relaxed),
            verified_zero_releases: c.verified_zero_releases.load(Ordering::Relaxed),
        }
    }

    fn allocate_slot(&'static self, capacity: usize) -> Result<Allocation, AllocError> {
        let count = capacity / GRANULE;

        {
            let mut slabs = self.lock_slabs();
            for slab in slabs.iter_mut() {
                if let Some(first) = slab.find_free(count) {
                    return Ok(self.slot_allocation(slab, first, capacity));
                }
            }
        }

        // No room anywhere: map a fresh page without holding the lock.
        let (base, locked) = self.map_region(self.page_size)?;
        let mut slab = Slab::new(base, locked, self.page_size / GRANULE);
        let allocation = self.slot_allocation(&mut slab, 0, capacity);
        self.lock_slabs().push(slab);

        Ok(allocation)
    }

    fn slot_allocation(&'static self, slab: &mut Slab, first: usize, capacity: usize) -> Allocation {
        let ptr = slab.claim(first, capacity / GRANULE);
        Allocation {
            ptr,
            capacity,
            locked: slab.locked,
            origin: Origin::Slab {
                base: slab.base,
                first,
            },
            pool: self,
        }
    }

    fn allocate_region(&'static self, capacity: usize) -> Result<Allocation, AllocError> {
        let len = ffi::round_to_pages(capacity).ok_or(AllocError::TooLarge { len: capacity })?;
        let (ptr, locked) = self.map_region(len)?;

        Ok(Allocation {
            ptr,
            capacity: len,
            locked,
            origin: Origin::Region { len },
            pool: self,
        })
    }

    /// Maps and locks `len` bytes according to the pool's [`LockPolicy`].
    fn map_region(&self, len: usize) -> Result<(NonNull<u8>, bool), AllocError> {
        let ptr = self
            .backend
            .map(len)
            .map_err(|source| AllocError::Map { len, source })?;

        let locked = match self.backend.lock(ptr, len) {
            Ok(()) => true,
            Err(source) => match self.policy {
                LockPolicy::Required => {
                    // May fail (unchecked)
                    let _ = unsafe { self.backend.unmap(ptr, len) };
                    return Err(AllocError::Lock { len, source });
                }
                LockPolicy::BestEffort => {
                    warn!(len, error = %source, "could not lock secure memory, continuing unlocked");
                    false
                }
            },
        };

        self.counters.mapped_regions.fetch_add(1, Ordering::Relaxed);
        if locked {
            self.counters.locked_regions.fetch_add(1, Ordering::Relaxed);
        }
        debug!(len, locked, "mapped secure region");

        Ok((ptr, locked))
    }

    fn unmap_region(&self, ptr: NonNull<u8>, len: usize, locked: bool) {
        if locked {
            if let Err(err) = self.backend.unlock(ptr, len) {
                warn!(len, error = %err, "failed to unlock secure region");
            }
            self.counters.locked_regions.fetch_sub(1, Ordering::Relaxed);
        }

        if let Err(err) = unsafe { self.backend.unmap(ptr, len) } {
            warn!(len, error = %err, "failed to unmap secure region");
        }
        self.counters.mapped_regions.fetch_sub(1, Ordering::Relaxed);
        debug!(len, "unmapped secure region");
    }

    fn release(&self, allocation: &mut Allocation) {
        let capacity = allocation.capacity;
        let region = allocation.as_mut_slice();
        region.zeroize();

        let zeroed = region.iter().all(|b| *b == 0);
        debug_assert!(zeroed, "secure region not zero after wipe");

        match allocation.origin {
            Origin::Region { len } => {
                self.unmap_region(allocation.ptr, len, allocation.locked);
            }
            Origin::Slab { base, first } => {
                let emptied = {
                    let mut slabs = self.lock_slabs();
                    match slabs.iter().position(|slab| slab.base == base) {
                        Some(index) => {
                            slabs[index].free(first, capacity / GRANULE);
                            (slabs[index].live == 0).then(|| slabs.swap_remove(index))
                        }
                        None => {
                            debug_assert!(false, "released slot of an unknown slab");
                            None
                        }
                    }
                };

                if let Some(slab) = emptied {
                    self.unmap_region(slab.base, self.page_size, slab.locked);
                }
            }
        }

        self.counters.live_allocations.fetch_sub(1, Ordering::Relaxed);
        self.counters.live_bytes.fetch_sub(capacity, Ordering::Relaxed);
        self.counters.total_releases.fetch_add(1, Ordering::Relaxed);
        if zeroed {
            self.counters
                .verified_zero_releases
                .fetch_add(1, Ordering::Relaxed);
        }
        trace!(capacity, "secure release");
    }

    fn lock_slabs(&self) -> MutexGuard<'_, Vec<Slab>> {
        // Slab bookkeeping is never left half-updated, so a poisoned lock is still usable.
        self.slabs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SecurePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurePool")
            .field("policy", &self.policy)
            .field("page_size", &self.page_size)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
