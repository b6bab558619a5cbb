//! Platform abstraction layer for kernel operations.
//!
//! This module provides an abstraction over platform-specific operations
//! (CPU ID, physical address translation, preemption control) to allow
//! testing in user space.

#[cfg(any(test, not(feature = "axhal")))]
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Operations the isolated domain needs from its platform.
///
/// Abstracts over kernel-specific operations to enable mock testing.
pub trait PlatformOps {
    /// Get the ID of the execution unit we are running on.
    fn cpu_id() -> u32;

    /// Translate a physical address into an address the caller can dereference.
    fn phys_to_virt(paddr: u64) -> usize;
}

/// Preemption control used by the host to pin a trace session to one core.
pub trait PreemptOps {
    /// Whether we are running in task context (not an interrupt handler).
    fn in_task() -> bool;

    /// Whether the current execution unit may be preempted.
    fn preemptible() -> bool;

    /// Disable preemption on the current execution unit.
    fn preempt_disable();

    /// Re-enable preemption on the current execution unit.
    fn preempt_enable();
}

// =============================================================================
// Real Implementation (kernel environment with axhal)
// =============================================================================

/// Real platform operations using axhal.
#[cfg(all(not(test), feature = "axhal"))]
pub struct RealPlatform;

#[cfg(all(not(test), feature = "axhal"))]
impl PlatformOps for RealPlatform {
    fn cpu_id() -> u32 {
        axhal::percpu::this_cpu_id() as u32
    }

    fn phys_to_virt(paddr: u64) -> usize {
        axhal::mem::phys_to_virt((paddr as usize).into()).as_usize()
    }
}

#[cfg(all(not(test), feature = "axhal"))]
impl PreemptOps for RealPlatform {
    fn in_task() -> bool {
        // axhal has no interrupt-context query; callers run from task context.
        true
    }

    fn preemptible() -> bool {
        axhal::asm::irqs_enabled()
    }

    fn preempt_disable() {
        axhal::asm::disable_irqs();
    }

    fn preempt_enable() {
        axhal::asm::enable_irqs();
    }
}

// =============================================================================
// Mock Implementation (test environment or no axhal)
// =============================================================================

/// Mock CPU ID for testing.
#[cfg(any(test, not(feature = "axhal")))]
static MOCK_CPU_ID: AtomicU32 = AtomicU32::new(0);

/// Mock preemption-disable depth.
#[cfg(any(test, not(feature = "axhal")))]
static MOCK_PREEMPT_DEPTH: AtomicU32 = AtomicU32::new(0);

/// Mock task-context flag.
#[cfg(any(test, not(feature = "axhal")))]
static MOCK_IN_TASK: AtomicBool = AtomicBool::new(true);

/// Mock platform operations for testing.
///
/// Physical memory is identity mapped.
#[cfg(any(test, not(feature = "axhal")))]
pub struct MockPlatform;

#[cfg(any(test, not(feature = "axhal")))]
impl PlatformOps for MockPlatform {
    fn cpu_id() -> u32 {
        MOCK_CPU_ID.load(Ordering::Relaxed)
    }

    fn phys_to_virt(paddr: u64) -> usize {
        paddr as usize
    }
}

#[cfg(any(test, not(feature = "axhal")))]
impl PreemptOps for MockPlatform {
    fn in_task() -> bool {
        MOCK_IN_TASK.load(Ordering::Relaxed)
    }

    fn preemptible() -> bool {
        MOCK_PREEMPT_DEPTH.load(Ordering::Relaxed) == 0
    }

    fn preempt_disable() {
        MOCK_PREEMPT_DEPTH.fetch_add(1, Ordering::Relaxed);
    }

    fn preempt_enable() {
        MOCK_PREEMPT_DEPTH.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Set mock CPU ID for testing.
#[cfg(any(test, not(feature = "axhal")))]
pub fn set_mock_cpu_id(id: u32) {
    MOCK_CPU_ID.store(id, Ordering::Relaxed);
}

/// Set whether the mock platform reports task context.
#[cfg(any(test, not(feature = "axhal")))]
pub fn set_mock_in_task(in_task: bool) {
    MOCK_IN_TASK.store(in_task, Ordering::Relaxed);
}

/// Current mock preemption-disable depth.
#[cfg(any(test, not(feature = "axhal")))]
pub fn mock_preempt_depth() -> u32 {
    MOCK_PREEMPT_DEPTH.load(Ordering::Relaxed)
}

// =============================================================================
// Platform Type Alias
// =============================================================================

/// The active platform implementation.
///
/// In kernel environment with axhal: RealPlatform (uses axhal)
/// In test environment or without axhal: MockPlatform (uses atomic counters)
#[cfg(all(not(test), feature = "axhal"))]
pub type Platform = RealPlatform;

#[cfg(any(test, not(feature = "axhal")))]
pub type Platform = MockPlatform;

// =============================================================================
// Convenience Functions
// =============================================================================

/// Get current CPU ID.
#[inline]
pub fn cpu_id() -> u32 {
    Platform::cpu_id()
}

/// Translate a physical address with the active platform.
#[inline]
pub fn phys_to_virt(paddr: u64) -> usize {
    Platform::phys_to_virt(paddr)
}

// =============================================================================
// Tests
// =============================================================================
