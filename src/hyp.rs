//! Hypervisor-side coverage state.
//!
//! [`HypCoverage`] owns the per-CPU trace areas and the image layout used
//! to canonicalize sampled addresses. The host reaches it through a single
//! hypercall, `HVC_KCOV_SET_AREA(table_pa, size)`, handled by
//! [`HypCoverage::set_area`]; a null table with zero size disables tracing
//! on the calling CPU.

use core::marker::PhantomData;

use crate::area::{AreaTable, Pfn, TraceArea, WORD_SIZE};
use crate::canonical::ImageLayout;
use crate::platform::{Platform, PlatformOps};
use crate::writer;

/// SMCCC vendor-hyp fast call ID of the set-area hypercall.
pub const HVC_KCOV_SET_AREA: u32 = 0xc600_0040;

/// Largest accepted buffer, in words. Matches the KCOV ioctl limit.
pub const MAX_AREA_WORDS: usize = i32::MAX as usize / WORD_SIZE;

/// Error types for hypercall handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed table address or size.
    InvalidArgument,
    /// The calling CPU has no trace area.
    NoSuchCpu(u32),
}

impl Error {
    /// Negative errno-style result code returned across the boundary.
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidArgument => -22,
            Self::NoSuchCpu(_) => -19,
        }
    }

    /// Decode a hypercall result code. `0` means success.
    pub fn from_code(code: i64) -> Result<(), Error> {
        match code {
            0 => Ok(()),
            -19 => Err(Self::NoSuchCpu(u32::MAX)),
            _ => Err(Self::InvalidArgument),
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "Invalid trace area"),
            Self::NoSuchCpu(cpu) => write!(f, "No trace area for CPU {}", cpu),
        }
    }
}

impl core::error::Error for Error {}

/// Coverage state living in the isolated hypervisor domain.
pub struct HypCoverage<M: PlatformOps = Platform> {
    areas: AreaTable,
    layout: ImageLayout,
    _platform: PhantomData<M>,
}

impl<M: PlatformOps> HypCoverage<M> {
    /// Create the state for `nr_cpus` execution units, all disabled.
    pub fn new(nr_cpus: usize, layout: ImageLayout) -> Self {
        Self {
            areas: AreaTable::new(nr_cpus),
            layout,
            _platform: PhantomData,
        }
    }

    /// Image layout used for canonicalization.
    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// Trace area of `cpu`.
    pub fn area(&self, cpu: u32) -> Option<&TraceArea> {
        self.areas.get(cpu)
    }

    /// All trace areas.
    pub fn areas(&self) -> &AreaTable {
        &self.areas
    }

    /// Handle `HVC_KCOV_SET_AREA` for the calling CPU.
    ///
    /// `table_pa` is the physical address of the host's page frame table
    /// for a buffer of `size` words. The host must have shared the table
    /// and every page it names before issuing the call, and must keep them
    /// shared until it disables the area again.
    pub fn set_area(&self, table_pa: u64, size: usize) -> Result<(), Error> {
        let cpu = M::cpu_id();
        let area = self.areas.get(cpu).ok_or(Error::NoSuchCpu(cpu))?;

        match (table_pa, size) {
            (0, 0) => {
                area.clear();
                Ok(())
            }
            (0, _) | (_, 0) => Err(Error::InvalidArgument),
            _ if size > MAX_AREA_WORDS => Err(Error::InvalidArgument),
            _ if table_pa % WORD_SIZE as u64 != 0 => Err(Error::InvalidArgument),
            _ => {
                let pfns = M::phys_to_virt(table_pa) as *const Pfn;
                // SAFETY: the host shared a table covering `size` words and
                // we are in the hypercall handler of the owning CPU.
                unsafe { area.set(pfns, size) };
                Ok(())
            }
        }
    }

    /// Dispatch a raw hypercall, returning the ABI result code.
    pub fn handle_hvc(&self, func_id: u32, table_pa: u64, size: u64) -> i64 {
        if func_id != HVC_KCOV_SET_AREA {
            return Error::InvalidArgument.code();
        }
        let Ok(size) = usize::try_from(size) else {
            return Error::InvalidArgument.code();
        };
        match self.set_area(table_pa, size) {
            Ok(()) => 0,
            Err(e) => e.code(),
        }
    }

    /// Record a coverage sample for the instrumented point returning to `ret_ip`.
    #[inline(always)]
    pub fn trace_pc(&self, ret_ip: u64) {
        let ip = self.layout.canonicalize(ret_ip);
        if let Some(area) = self.areas.get(M::cpu_id()) {
            writer::record_pc::<M>(area, ip);
        }
    }
}
