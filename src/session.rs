//! Host-side trace session control.
//!
//! Wraps every host -> hypervisor run of a KCOV-traced task:
//!
//! ```ignore
//! let status = ctl.start(task);
//! // ... enter the hypervisor ...
//! ctl.stop(task, status);
//! ```
//!
//! On the first start the task's buffer is shared with the hypervisor and
//! our stop hook is installed in the task; both are reused by every later
//! start/stop pair and only released by [`KcovController::teardown`], which
//! the KCOV framework invokes when the task's coverage is torn down.
//!
//! A session pins the task to its CPU: the hypervisor keeps one trace area
//! per CPU, so the task must neither migrate nor be preempted by another
//! traced task until the area is removed again.

use core::marker::PhantomData;

use crate::hypercall::HypCall;
use crate::platform::{Platform, PlatformOps, PreemptOps};
use crate::share::{self, HostMemoryOps, PfnTable};

/// Raw status: tracing is off for this run.
pub const KVM_KCOV_DISABLED: u32 = 0;
/// Raw status bit: the hypervisor trace area was installed.
pub const KVM_KCOV_ENABLED: u32 = 1 << 0;
/// Raw status bit: start disabled preemption and stop must re-enable it.
pub const KVM_KCOV_PREEMPT: u32 = 1 << 1;

/// KCOV mode of a task, as tracked by the coverage framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KcovMode {
    /// Coverage is off.
    Disabled,
    /// Buffer allocated, tracing not started.
    Init,
    /// Tracing program counters.
    TracePc,
    /// Tracing comparison operands.
    TraceCmp,
}

/// Identity of whoever installed a task's stop hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookOwner(pub &'static str);

/// Owner tag of the hook installed by [`KcovController`].
pub const HYP_KCOV_HOOK: HookOwner = HookOwner("kvm-hyp-kcov");

/// Session state kept in the task's stop-hook argument.
#[derive(Debug)]
pub struct SessionRecord {
    table: PfnTable,
    active: Option<u32>,
}

impl SessionRecord {
    /// The shared page frame table of the task's buffer.
    pub fn table(&self) -> &PfnTable {
        &self.table
    }

    /// CPU the session is pinned to, if one is open.
    pub fn active_cpu(&self) -> Option<u32> {
        self.active
    }
}

/// A task's stop hook.
///
/// Other coverage consumers install hooks with their own [`HookOwner`] and
/// no record; we never touch those.
#[derive(Debug)]
pub struct StopHook {
    pub owner: HookOwner,
    pub record: Option<SessionRecord>,
}

/// Capability interface onto a task's KCOV state.
pub trait KcovTask {
    /// Current KCOV mode.
    fn mode(&self) -> KcovMode;

    /// Whether the task is inside a trace section (entered and not left).
    fn in_section(&self) -> bool;

    /// Virtual address of the task's coverage buffer.
    fn area(&self) -> usize;

    /// Capacity of the coverage buffer in 64-bit words.
    fn size(&self) -> usize;

    /// The installed stop hook, if any.
    fn stop_hook(&self) -> Option<&StopHook>;

    /// Mutable access to the installed stop hook.
    fn stop_hook_mut(&mut self) -> Option<&mut StopHook>;

    /// Replace the stop hook, returning the previous one.
    fn set_stop_hook(&mut self, hook: Option<StopHook>) -> Option<StopHook>;

    /// Enter the trace section (suspends the task's own tracing).
    fn enter_section(&mut self);

    /// Leave the trace section.
    fn leave_section(&mut self);
}

/// Where a task stands with respect to hypervisor tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Buffer not shared, no hook installed by us.
    Unregistered,
    /// Buffer shared, no session open.
    Idle,
    /// Session open on the given CPU.
    Active(u32),
}

/// Keeps preemption disabled while alive.
///
/// Not `Send`: it must be dropped on the CPU that created it.
pub struct PinGuard<P: PreemptOps> {
    _marker: PhantomData<(P, *const ())>,
}

impl<P: PreemptOps> PinGuard<P> {
    /// Disable preemption unless it already is.
    ///
    /// Returns `None` when the caller already runs non-preemptible, in which
    /// case there is nothing to undo.
    pub fn pin() -> Option<Self> {
        if !P::preemptible() {
            return None;
        }
        P::preempt_disable();
        Some(Self {
            _marker: PhantomData,
        })
    }
}

impl<P: PreemptOps> Drop for PinGuard<P> {
    fn drop(&mut self) {
        P::preempt_enable();
    }
}

/// Result of [`KcovController::start`], to be handed back to `stop`.
#[must_use = "the status must be passed to KcovController::stop"]
pub enum KcovStatus<P: PreemptOps = Platform> {
    /// Tracing is off for this run.
    Disabled,
    /// Tracing is on; holds the pin if start had to disable preemption.
    Enabled(Option<PinGuard<P>>),
}

impl<P: PreemptOps> KcovStatus<P> {
    /// Whether the hypervisor trace area was installed.
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled(_))
    }

    /// Raw `KVM_KCOV_*` bits.
    pub fn raw(&self) -> u32 {
        match self {
            Self::Disabled => KVM_KCOV_DISABLED,
            Self::Enabled(None) => KVM_KCOV_ENABLED,
            Self::Enabled(Some(_)) => KVM_KCOV_ENABLED | KVM_KCOV_PREEMPT,
        }
    }
}

impl<P: PreemptOps> core::fmt::Debug for KcovStatus<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "KcovStatus({:#x})", self.raw())
    }
}

fn record<T: KcovTask + ?Sized>(task: &T) -> Option<&SessionRecord> {
    task.stop_hook()
        .filter(|h| h.owner == HYP_KCOV_HOOK)
        .and_then(|h| h.record.as_ref())
}

fn record_mut<T: KcovTask + ?Sized>(task: &mut T) -> Option<&mut SessionRecord> {
    task.stop_hook_mut()
        .filter(|h| h.owner == HYP_KCOV_HOOK)
        .and_then(|h| h.record.as_mut())
}

/// Drives hypervisor trace sessions for host tasks.
pub struct KcovController<H, C, P = Platform>
where
    H: HostMemoryOps,
    C: HypCall,
    P: PlatformOps + PreemptOps,
{
    mem: H,
    hyp: C,
    _platform: PhantomData<P>,
}

impl<H, C, P> KcovController<H, C, P>
where
    H: HostMemoryOps,
    C: HypCall,
    P: PlatformOps + PreemptOps,
{
    /// Create a controller sharing memory through `mem` and calling the
    /// hypervisor through `hyp`.
    pub fn new(mem: H, hyp: C) -> Self {
        Self {
            mem,
            hyp,
            _platform: PhantomData,
        }
    }

    /// Where `task` stands with respect to hypervisor tracing.
    pub fn session_state<T: KcovTask + ?Sized>(&self, task: &T) -> SessionState {
        match record(task) {
            None => SessionState::Unregistered,
            Some(rec) => match rec.active {
                Some(cpu) => SessionState::Active(cpu),
                None => SessionState::Idle,
            },
        }
    }

    /// Start tracing the hypervisor into `task`'s buffer.
    ///
    /// Returns [`KcovStatus::Disabled`] without side effects when the task
    /// is not tracing PCs, is already inside a trace section, has its stop
    /// hook owned by another consumer, or we are not in task context.
    ///
    /// # Panics
    /// Panics if the buffer cannot be shared or the hypervisor rejects the
    /// area.
    pub fn start<T: KcovTask + ?Sized>(&self, task: &mut T) -> KcovStatus<P> {
        if !P::in_task() {
            return KcovStatus::Disabled;
        }
        if task.mode() != KcovMode::TracePc || task.in_section() || task.size() == 0 {
            return KcovStatus::Disabled;
        }

        match task.stop_hook().map(|h| h.owner) {
            None => {
                let table = share::expose(&self.mem, task.area(), task.size());
                task.set_stop_hook(Some(StopHook {
                    owner: HYP_KCOV_HOOK,
                    record: Some(SessionRecord {
                        table,
                        active: None,
                    }),
                }));
            }
            Some(owner) if owner != HYP_KCOV_HOOK => return KcovStatus::Disabled,
            Some(_) => {}
        }

        let table_pa = match record(task) {
            Some(rec) if rec.active.is_none() => self.mem.virt_to_phys(rec.table.addr()),
            _ => return KcovStatus::Disabled,
        };
        let size = task.size();

        task.enter_section();
        let pin = PinGuard::<P>::pin();
        let cpu = P::cpu_id();

        if let Err(e) = self.hyp.kcov_set_area(table_pa, size) {
            panic!("kcov: hyp rejected trace area {:#x} ({} words): {}", table_pa, size, e);
        }
        if let Some(rec) = record_mut(task) {
            rec.active = Some(cpu);
        }

        log::debug!(
            "kcov: session started on cpu {} ({} words, pinned={})",
            cpu,
            size,
            pin.is_some()
        );
        KcovStatus::Enabled(pin)
    }

    /// Stop the session opened by [`KcovController::start`].
    ///
    /// A disabled status is a no-op. The buffer stays shared for the next
    /// start.
    pub fn stop<T: KcovTask + ?Sized>(&self, task: &mut T, status: KcovStatus<P>) {
        let KcovStatus::Enabled(pin) = status else {
            return;
        };

        // Teardown may already have closed the session; then only the pin
        // is left to release.
        let was_active = record_mut(task)
            .and_then(|rec| rec.active.take())
            .is_some();

        if was_active {
            if let Err(e) = self.hyp.kcov_set_area(0, 0) {
                log::warn!("kcov: failed to remove hyp trace area: {}", e);
            }
        }

        drop(pin);

        if was_active {
            task.leave_section();
            log::debug!("kcov: session stopped");
        }
    }

    /// Stop hook body: release everything [`KcovController::start`] set up.
    ///
    /// Closes a still-open session first, then unshares the buffer and the
    /// page frame table and uninstalls the hook. Hooks owned by other
    /// consumers are left alone.
    ///
    /// # Panics
    /// Panics if the task is inside a trace section we did not open, or if
    /// its session is still open on another CPU.
    pub fn teardown<T: KcovTask + ?Sized>(&self, task: &mut T) {
        if task.stop_hook().map(|h| h.owner) != Some(HYP_KCOV_HOOK) {
            return;
        }

        // The disable hypercall only reaches the calling CPU's descriptor.
        // Revoking while another CPU still points at the table would let the
        // hypervisor write through freed, unshared memory.
        if let Some(cpu) = record(task).and_then(|rec| rec.active) {
            let this_cpu = P::cpu_id();
            assert!(
                cpu == this_cpu,
                "kcov: session open on cpu {} torn down from cpu {}",
                cpu,
                this_cpu
            );
        }

        if let Some(cpu) = record_mut(task).and_then(|rec| rec.active.take()) {
            log::warn!("kcov: tearing down a session still open on cpu {}", cpu);
            if let Err(e) = self.hyp.kcov_set_area(0, 0) {
                log::warn!("kcov: failed to remove hyp trace area: {}", e);
            }
            task.leave_section();
        }

        assert!(
            !task.in_section(),
            "kcov: trace section unexpectedly open at teardown"
        );

        task.enter_section();
        if let Some(StopHook {
            record: Some(rec), ..
        }) = task.set_stop_hook(None)
        {
            share::revoke(&self.mem, rec.table, task.area(), task.size());
        }
        task.leave_section();

        log::debug!("kcov: torn down buffer at {:#x}", task.area());
    }
}
