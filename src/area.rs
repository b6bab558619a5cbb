//! Per-CPU trace area descriptors.
//!
//! Each execution unit of the hypervisor owns one [`TraceArea`] describing
//! where coverage samples go while a trace session is pinned to it. The
//! area is a list of page frame numbers (shared by the host) plus the
//! number of 64-bit words the buffer holds.
//!
//! Descriptors are only written by the hypercall handler running on the
//! owning CPU and only read by the sample writer on that same CPU, so no
//! lock is taken. Fields are atomics so the table can be shared as `&self`.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crate::platform::PlatformOps;

/// Page frame number.
pub type Pfn = u64;

/// Page shift (4KB pages)
pub const PAGE_SHIFT: usize = 12;
/// Page size (4KB)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Size of one trace buffer slot in bytes.
pub const WORD_SIZE: usize = core::mem::size_of::<u64>();

/// Number of pages backing a buffer of `capacity` 64-bit words.
pub const fn pages_for(capacity: usize) -> usize {
    capacity.saturating_mul(WORD_SIZE).div_ceil(PAGE_SIZE)
}

/// Trace area descriptor of a single execution unit.
#[derive(Debug)]
pub struct TraceArea {
    /// Page frame table, indexed by buffer page. Null when disabled.
    pfns: AtomicPtr<Pfn>,
    /// Buffer capacity in 64-bit words (slot 0 included).
    size: AtomicUsize,
}

impl TraceArea {
    /// Create an empty (disabled) descriptor.
    pub const fn new() -> Self {
        Self {
            pfns: AtomicPtr::new(ptr::null_mut()),
            size: AtomicUsize::new(0),
        }
    }

    /// Install a new area, overwriting whatever was there.
    ///
    /// A null `pfns` or zero `size` leaves the descriptor disabled.
    ///
    /// # Safety
    /// `pfns` must be null or point to at least `pages_for(size)` readable
    /// page frame numbers, each naming a page the hypervisor may write, and
    /// must stay valid until the area is replaced. Must be called on the
    /// owning CPU with preemption disabled.
    pub unsafe fn set(&self, pfns: *const Pfn, size: usize) {
        // Tear down first so a sample taken in between never pairs the old
        // table with the new size.
        self.pfns.store(ptr::null_mut(), Ordering::Relaxed);
        if pfns.is_null() || size == 0 {
            self.size.store(0, Ordering::Relaxed);
            return;
        }
        self.size.store(size, Ordering::Relaxed);
        self.pfns.store(pfns as *mut Pfn, Ordering::Release);
    }

    /// Disable the area.
    pub fn clear(&self) {
        self.pfns.store(ptr::null_mut(), Ordering::Relaxed);
        self.size.store(0, Ordering::Relaxed);
    }

    /// Whether a buffer is currently installed.
    pub fn is_active(&self) -> bool {
        !self.pfns.load(Ordering::Relaxed).is_null()
    }

    /// Buffer capacity in words, 0 when disabled.
    pub fn size(&self) -> usize {
        if self.is_active() {
            self.size.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// Resolve slot `idx` of the buffer to the word backing it.
    ///
    /// Returns `None` when the area is disabled or `idx` is out of range.
    #[inline(always)]
    pub fn slot<M: PlatformOps>(&self, idx: usize) -> Option<&AtomicU64> {
        let pfns = self.pfns.load(Ordering::Acquire);
        let size = self.size.load(Ordering::Relaxed);
        if pfns.is_null() || idx >= size {
            return None;
        }

        let off = idx * WORD_SIZE;
        // SAFETY: `set` guarantees the table covers `size` words.
        let pfn = unsafe { pfns.add(off / PAGE_SIZE).read_volatile() };
        let addr = M::phys_to_virt(pfn << PAGE_SHIFT) + off % PAGE_SIZE;

        // SAFETY: the page was shared with us for the lifetime of the
        // session and `addr` is 8-byte aligned within it.
        Some(unsafe { AtomicU64::from_ptr(addr as *mut u64) })
    }
}

impl Default for TraceArea {
    fn default() -> Self {
        Self::new()
    }
}

/// Trace area descriptors of every execution unit, indexed by CPU ID.
#[derive(Debug)]
pub struct AreaTable {
    areas: Box<[TraceArea]>,
}

impl AreaTable {
    /// Create a table with one disabled descriptor per CPU.
    pub fn new(nr_cpus: usize) -> Self {
        let areas: Vec<TraceArea> = (0..nr_cpus).map(|_| TraceArea::new()).collect();
        Self {
            areas: areas.into_boxed_slice(),
        }
    }

    /// Descriptor of `cpu`, if such a CPU exists.
    #[inline(always)]
    pub fn get(&self, cpu: u32) -> Option<&TraceArea> {
        self.areas.get(cpu as usize)
    }

    /// Number of execution units covered.
    pub fn nr_cpus(&self) -> usize {
        self.areas.len()
    }

    /// Number of execution units with an installed buffer.
    pub fn active_count(&self) -> usize {
        self.areas.iter().filter(|a| a.is_active()).count()
    }
}
