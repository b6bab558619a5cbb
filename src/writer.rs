//! Coverage sample writer.
//!
//! Runs at every instrumented point of the hypervisor, so it must not
//! allocate, block, take locks or log. The buffer layout is the one KCOV
//! uses for `KCOV_TRACE_PC`:
//!
//! ```text
//! word 0        number of recorded PCs (n)
//! word 1..=n    canonical PCs in arrival order
//! ```
//!
//! Once full, further samples are dropped and the count stops advancing.

use core::sync::atomic::Ordering;

use crate::area::TraceArea;
use crate::platform::PlatformOps;

/// Append `ip` to the buffer described by `area`.
///
/// The sample is stored before the count is published with release
/// ordering, so a reader that observes count `n` (with acquire) also
/// observes slots `1..=n`.
#[inline(always)]
pub fn record_pc<M: PlatformOps>(area: &TraceArea, ip: u64) {
    let Some(count) = area.slot::<M>(0) else {
        return;
    };

    let Some(pos) = count.load(Ordering::Acquire).checked_add(1) else {
        return;
    };
    let Ok(idx) = usize::try_from(pos) else {
        return;
    };

    // Bounds are checked against the area size, not the count, so a
    // corrupted count cannot push the write outside the buffer.
    if let Some(slot) = area.slot::<M>(idx) {
        slot.store(ip, Ordering::Relaxed);
        count.store(pos, Ordering::Release);
    }
}

/// Instrumentation entry point emitted by `-fsanitize-coverage=trace-pc`.
///
/// Records the caller's return address on the current CPU's trace area.
#[cfg(all(feature = "sanitizer-hook", target_arch = "aarch64"))]
#[unsafe(no_mangle)]
#[inline(never)]
pub extern "C" fn __sanitizer_cov_trace_pc() {
    let ip: u64;
    // SAFETY: only reads the link register; x30 is restored after the
    // pointer authentication code is stripped (`hint #7` is XPACLRI).
    // Operands are pinned to scratch registers so neither can alias x30.
    unsafe {
        core::arch::asm!(
            "mov {saved}, x30",
            "hint #7",
            "mov {ip}, x30",
            "mov x30, {saved}",
            saved = out("x9") _,
            ip = out("x10") ip,
            options(nomem, nostack, preserves_flags)
        );
    }

    if let Some(cov) = crate::hyp_coverage() {
        cov.trace_pc(ip);
    }
}
