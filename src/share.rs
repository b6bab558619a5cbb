//! Exposing a host trace buffer to the hypervisor.
//!
//! The host-side KCOV buffer is virtually contiguous but physically
//! scattered. To let the hypervisor write it without host involvement, the
//! host builds a table holding the page frame number of every buffer page,
//! shares each page and the table itself with the hypervisor, and passes
//! the table's physical address across the boundary.
//!
//! Sharing a well-formed, already allocated buffer is not expected to
//! fail; if it does, ownership between host and hypervisor is no longer
//! consistent and we panic.

use alloc::boxed::Box;
use alloc::vec::Vec;

use axerrno::AxResult;

use crate::area::{PAGE_SIZE, Pfn, WORD_SIZE, pages_for};

/// Host memory primitives needed to share a buffer with the hypervisor.
pub trait HostMemoryOps {
    /// Page frame number backing the (possibly vmalloc'ed) address `vaddr`.
    fn virt_to_pfn(&self, vaddr: usize) -> Pfn;

    /// Physical address of a linearly mapped address.
    fn virt_to_phys(&self, vaddr: usize) -> u64;

    /// Grant the hypervisor read/write access to the pages spanning `[start, end)`.
    fn share_hyp(&self, start: usize, end: usize) -> AxResult<()>;

    /// Revoke access granted by [`HostMemoryOps::share_hyp`].
    fn unshare_hyp(&self, start: usize, end: usize) -> AxResult<()>;
}

impl<T: HostMemoryOps + ?Sized> HostMemoryOps for &T {
    fn virt_to_pfn(&self, vaddr: usize) -> Pfn {
        (**self).virt_to_pfn(vaddr)
    }

    fn virt_to_phys(&self, vaddr: usize) -> u64 {
        (**self).virt_to_phys(vaddr)
    }

    fn share_hyp(&self, start: usize, end: usize) -> AxResult<()> {
        (**self).share_hyp(start, end)
    }

    fn unshare_hyp(&self, start: usize, end: usize) -> AxResult<()> {
        (**self).unshare_hyp(start, end)
    }
}

/// Page frame table of a shared trace buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct PfnTable {
    pfns: Box<[Pfn]>,
}

impl PfnTable {
    /// Page frame numbers, one per buffer page.
    pub fn pfns(&self) -> &[Pfn] {
        &self.pfns
    }

    /// Number of buffer pages.
    pub fn len(&self) -> usize {
        self.pfns.len()
    }

    /// Whether the table describes no pages.
    pub fn is_empty(&self) -> bool {
        self.pfns.is_empty()
    }

    /// Host virtual address of the table.
    pub fn addr(&self) -> usize {
        self.pfns.as_ptr() as usize
    }

    /// Host virtual range `[start, end)` occupied by the table.
    fn range(&self) -> (usize, usize) {
        let start = self.addr();
        (start, start + self.pfns.len() * WORD_SIZE)
    }
}

/// Share the `size`-word buffer at `start` with the hypervisor.
///
/// Returns the page frame table, itself shared, to hand to
/// `HVC_KCOV_SET_AREA`.
///
/// # Panics
/// Panics if `start` is not page aligned or if any share fails.
pub fn expose<H: HostMemoryOps>(mem: &H, start: usize, size: usize) -> PfnTable {
    // The hypervisor resolves slots as (pfn, offset within page); a buffer
    // starting mid-page would shift every sample.
    assert!(
        start % PAGE_SIZE == 0,
        "kcov: trace buffer {:#x} is not page aligned",
        start
    );

    let nr_pages = pages_for(size);
    let mut pfns = Vec::with_capacity(nr_pages);

    for idx in 0..nr_pages {
        let cur = start + idx * PAGE_SIZE;
        let pfn = mem.virt_to_pfn(cur);
        if let Err(e) = mem.share_hyp(cur, cur + PAGE_SIZE) {
            panic!("kcov: failed to share buffer page {:#x} with hyp: {:?}", cur, e);
        }
        log::trace!("kcov: shared page {} at {:#x} (pfn={:#x})", idx, cur, pfn);
        pfns.push(pfn);
    }

    let table = PfnTable {
        pfns: pfns.into_boxed_slice(),
    };

    if !table.is_empty() {
        let (table_start, table_end) = table.range();
        if let Err(e) = mem.share_hyp(table_start, table_end) {
            panic!("kcov: failed to share pfn table {:#x} with hyp: {:?}", table_start, e);
        }
    }

    log::debug!(
        "kcov: exposed {} words at {:#x} ({} pages, table at {:#x})",
        size,
        start,
        nr_pages,
        table.addr()
    );
    table
}

/// Undo [`expose`]: unshare every buffer page, then unshare and free the table.
///
/// Must be called exactly once per table returned by [`expose`], with the
/// same `start` and `size`.
pub fn revoke<H: HostMemoryOps>(mem: &H, table: PfnTable, start: usize, size: usize) {
    let nr_pages = pages_for(size);
    if nr_pages != table.len() {
        log::warn!(
            "kcov: revoking {} pages but table holds {}",
            nr_pages,
            table.len()
        );
    }

    for idx in 0..nr_pages {
        let cur = start + idx * PAGE_SIZE;
        if let Err(e) = mem.unshare_hyp(cur, cur + PAGE_SIZE) {
            log::warn!("kcov: failed to unshare buffer page {:#x}: {:?}", cur, e);
        }
    }

    if !table.is_empty() {
        let (table_start, table_end) = table.range();
        if let Err(e) = mem.unshare_hyp(table_start, table_end) {
            log::warn!("kcov: failed to unshare pfn table {:#x}: {:?}", table_start, e);
        }
    }

    log::debug!("kcov: revoked {} pages at {:#x}", nr_pages, start);
}
