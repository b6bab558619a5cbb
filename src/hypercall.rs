//! Host -> hypervisor call transport.
//!
//! The host only ever issues one call for coverage, `HVC_KCOV_SET_AREA`.
//! How it crosses the privilege boundary is up to the [`HypCall`]
//! implementation: a real `hvc` on AArch64, or a direct call into a
//! [`HypCoverage`] living in the same address space.

use crate::hyp::{Error, HVC_KCOV_SET_AREA, HypCoverage};
use crate::platform::{Platform, PlatformOps};

/// Synchronous call into the hypervisor.
pub trait HypCall {
    /// Install (or with `(0, 0)`, remove) the trace area of the calling CPU.
    fn kcov_set_area(&self, table_pa: u64, size: usize) -> Result<(), Error>;
}

impl<T: HypCall + ?Sized> HypCall for &T {
    fn kcov_set_area(&self, table_pa: u64, size: usize) -> Result<(), Error> {
        (**self).kcov_set_area(table_pa, size)
    }
}

/// Transport that runs the hypervisor handler in-process.
pub struct DirectHypCall<'a, M: PlatformOps = Platform> {
    cov: &'a HypCoverage<M>,
}

impl<'a, M: PlatformOps> DirectHypCall<'a, M> {
    /// Transport delivering calls to `cov`.
    pub fn new(cov: &'a HypCoverage<M>) -> Self {
        Self { cov }
    }
}

impl<M: PlatformOps> HypCall for DirectHypCall<'_, M> {
    fn kcov_set_area(&self, table_pa: u64, size: usize) -> Result<(), Error> {
        Error::from_code(self.cov.handle_hvc(HVC_KCOV_SET_AREA, table_pa, size as u64))
    }
}

/// Transport issuing an SMCCC `hvc #0` from EL1.
#[cfg(target_arch = "aarch64")]
pub struct HvcHypCall;

#[cfg(target_arch = "aarch64")]
impl HypCall for HvcHypCall {
    fn kcov_set_area(&self, table_pa: u64, size: usize) -> Result<(), Error> {
        let ret: u64;
        unsafe {
            core::arch::asm!(
                "hvc #0",
                inout("x0") HVC_KCOV_SET_AREA as u64 => ret,
                inout("x1") table_pa => _,
                inout("x2") size as u64 => _,
                lateout("x3") _,
                options(nostack)
            );
        }
        Error::from_code(ret as i64)
    }
}
