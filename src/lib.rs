//! AxVisor hypervisor KCOV bridge
//!
//! Lets the host collect `KCOV_TRACE_PC` coverage of code running in the
//! isolated hypervisor core, which the host cannot inspect directly.
//!
//! # Components
//!
//! - Host side: [`session::KcovController`] shares a task's KCOV buffer
//!   with the hypervisor ([`share`]), pins the task to its CPU and tells the
//!   hypervisor where to write through [`hypercall::HypCall`].
//! - Hypervisor side: [`hyp::HypCoverage`] keeps one [`area::TraceArea`]
//!   per CPU; every instrumented point appends its canonical PC through
//!   [`writer::record_pc`].
//!
//! # Features
//!
//! - `axhal` - Real platform operations through axhal
//! - `sanitizer-hook` - Export `__sanitizer_cov_trace_pc` (AArch64 only)
//!
//! # Quick Start
//!
//! ```ignore
//! // Hypervisor, during boot
//! let cov = axkcov::init_hyp(nr_cpus, layout);
//!
//! // Host, around every hypervisor entry of a traced task
//! let ctl = KcovController::new(&host_mem, DirectHypCall::new(cov));
//! let status = ctl.start(task);
//! run_vcpu();
//! ctl.stop(task, status);
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

// =============================================================================
// Platform Abstraction (for testing support)
// =============================================================================

pub mod platform;

// =============================================================================
// Hypervisor Side
// =============================================================================

pub mod area;
pub mod canonical;
pub mod hyp;
pub mod writer;

// =============================================================================
// Host Side
// =============================================================================

pub mod cover;
pub mod hypercall;
pub mod session;
pub mod share;

// Re-export key types for convenience
pub use area::{AreaTable, PAGE_SIZE, Pfn, TraceArea};
pub use canonical::ImageLayout;
pub use cover::CoverView;
pub use hyp::{Error as HypError, HVC_KCOV_SET_AREA, HypCoverage};
pub use hypercall::{DirectHypCall, HypCall};
pub use session::{KcovController, KcovMode, KcovStatus, KcovTask, SessionState};
pub use share::{HostMemoryOps, PfnTable};

// =============================================================================
// Initialization
// =============================================================================

/// Coverage state of the running hypervisor.
static HYP_COVERAGE: spin::Once<HypCoverage> = spin::Once::new();

/// Initialize the hypervisor coverage state.
///
/// Call once during hypervisor boot, before any instrumented code may run
/// with a trace area installed. Later calls return the existing state.
pub fn init_hyp(nr_cpus: usize, layout: ImageLayout) -> &'static HypCoverage {
    if let Some(cov) = HYP_COVERAGE.get() {
        warn!("axkcov already initialized");
        return cov;
    }

    let cov = HYP_COVERAGE.call_once(|| HypCoverage::new(nr_cpus, layout));
    info!("Initializing axkcov...");
    info!("  - {} trace areas", cov.areas().nr_cpus());
    info!("  - kaslr offset {:#x}", layout.kaslr_offset);
    cov
}

/// The hypervisor coverage state, if [`init_hyp`] has run.
#[inline(always)]
pub fn hyp_coverage() -> Option<&'static HypCoverage> {
    HYP_COVERAGE.get()
}
