//! Shared mocks for the integration tests.
//!
//! Everything runs in user space: "physical" memory is identity mapped,
//! so a page frame number is simply `vaddr >> PAGE_SHIFT`.

#![allow(dead_code)]

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;

use axkcov::area::{PAGE_SHIFT, PAGE_SIZE, Pfn, pages_for};
use axkcov::hyp::Error as HypError;
use axkcov::hypercall::HypCall;
use axkcov::platform::{PlatformOps, PreemptOps};
use axkcov::session::{KcovMode, KcovTask, StopHook};
use axkcov::share::HostMemoryOps;

// =============================================================================
// Test Platform (per test thread)
// =============================================================================

thread_local! {
    static CPU: Cell<u32> = const { Cell::new(0) };
    static PREEMPT_DEPTH: Cell<u32> = const { Cell::new(0) };
    static IN_TASK: Cell<bool> = const { Cell::new(true) };
}

/// Platform whose CPU ID and preemption state are private to the test thread.
pub struct TestPlatform;

impl PlatformOps for TestPlatform {
    fn cpu_id() -> u32 {
        CPU.with(|c| c.get())
    }

    fn phys_to_virt(paddr: u64) -> usize {
        paddr as usize
    }
}

impl PreemptOps for TestPlatform {
    fn in_task() -> bool {
        IN_TASK.with(|c| c.get())
    }

    fn preemptible() -> bool {
        PREEMPT_DEPTH.with(|c| c.get()) == 0
    }

    fn preempt_disable() {
        PREEMPT_DEPTH.with(|c| c.set(c.get() + 1));
    }

    fn preempt_enable() {
        PREEMPT_DEPTH.with(|c| {
            assert!(c.get() > 0, "preempt_enable without preempt_disable");
            c.set(c.get() - 1)
        });
    }
}

pub fn set_cpu(id: u32) {
    CPU.with(|c| c.set(id));
}

pub fn preempt_depth() -> u32 {
    PREEMPT_DEPTH.with(|c| c.get())
}

pub fn set_in_task(in_task: bool) {
    IN_TASK.with(|c| c.set(in_task));
}

// =============================================================================
// Page-aligned buffers
// =============================================================================

/// Zeroed, page-aligned trace buffer of `size` words followed by one guard page.
pub struct PageBuffer {
    ptr: *mut u8,
    layout: Layout,
    size: usize,
}

impl PageBuffer {
    pub fn new(size: usize) -> Self {
        let nr_pages = pages_for(size).max(1) + 1;
        let layout = Layout::from_size_align(nr_pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout, size }
    }

    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Read word `idx`; may point past `size` into the guard page.
    pub fn word(&self, idx: usize) -> u64 {
        assert!(idx * 8 < self.layout.size());
        unsafe { (self.ptr as *const u64).add(idx).read_volatile() }
    }

    pub fn set_word(&self, idx: usize, val: u64) {
        assert!(idx * 8 < self.layout.size());
        unsafe { (self.ptr as *mut u64).add(idx).write_volatile(val) }
    }

    /// The buffer's words as the hypervisor sees them.
    pub fn words(&self) -> &[AtomicU64] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const AtomicU64, self.size) }
    }

    /// Page frame numbers of the pages covering `size` words.
    pub fn pfns(&self) -> Vec<Pfn> {
        (0..pages_for(self.size))
            .map(|i| ((self.addr() + i * PAGE_SIZE) >> PAGE_SHIFT) as Pfn)
            .collect()
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

// =============================================================================
// Fake host memory
// =============================================================================

/// Host memory that records every share with a per-page refcount.
#[derive(Default)]
pub struct FakeHostMem {
    refs: RefCell<BTreeMap<usize, usize>>,
    pub share_calls: Cell<usize>,
    pub unshare_calls: Cell<usize>,
    pub fail_share: Cell<bool>,
}

impl FakeHostMem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages currently shared with the hypervisor.
    pub fn shared_pages(&self) -> usize {
        self.refs.borrow().len()
    }

    /// Whether the page containing `vaddr` is shared.
    pub fn is_shared(&self, vaddr: usize) -> bool {
        self.refs.borrow().contains_key(&(vaddr & !(PAGE_SIZE - 1)))
    }

    fn pages(start: usize, end: usize) -> impl Iterator<Item = usize> {
        ((start & !(PAGE_SIZE - 1))..end).step_by(PAGE_SIZE)
    }
}

impl HostMemoryOps for FakeHostMem {
    fn virt_to_pfn(&self, vaddr: usize) -> Pfn {
        (vaddr >> PAGE_SHIFT) as Pfn
    }

    fn virt_to_phys(&self, vaddr: usize) -> u64 {
        vaddr as u64
    }

    fn share_hyp(&self, start: usize, end: usize) -> axerrno::AxResult<()> {
        self.share_calls.set(self.share_calls.get() + 1);
        if self.fail_share.get() {
            return Err(axerrno::ax_err_type!(Unsupported, "share refused"));
        }
        let mut refs = self.refs.borrow_mut();
        for page in Self::pages(start, end) {
            *refs.entry(page).or_insert(0) += 1;
        }
        Ok(())
    }

    fn unshare_hyp(&self, start: usize, end: usize) -> axerrno::AxResult<()> {
        self.unshare_calls.set(self.unshare_calls.get() + 1);
        let mut refs = self.refs.borrow_mut();
        for page in Self::pages(start, end) {
            match refs.get(&page).copied() {
                Some(1) => {
                    refs.remove(&page);
                }
                Some(n) => {
                    refs.insert(page, n - 1);
                }
                None => return Err(axerrno::ax_err_type!(NotFound, "page not shared")),
            }
        }
        Ok(())
    }
}

// =============================================================================
// Hypercall transports
// =============================================================================

/// Transport that accepts every call without a hypervisor behind it.
pub struct NullHyp;

impl HypCall for NullHyp {
    fn kcov_set_area(&self, _table_pa: u64, _size: usize) -> Result<(), HypError> {
        Ok(())
    }
}

/// Wraps a transport, recording calls and optionally failing them.
pub struct RecordingHyp<C> {
    inner: C,
    pub calls: RefCell<Vec<(u64, usize)>>,
    pub fail_enable: Cell<bool>,
    pub fail_disable: Cell<bool>,
}

impl<C: HypCall> RecordingHyp<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            calls: RefCell::new(Vec::new()),
            fail_enable: Cell::new(false),
            fail_disable: Cell::new(false),
        }
    }

    pub fn enables(&self) -> usize {
        self.calls.borrow().iter().filter(|(_, s)| *s != 0).count()
    }

    pub fn disables(&self) -> usize {
        self.calls.borrow().iter().filter(|(_, s)| *s == 0).count()
    }
}

impl<C: HypCall> HypCall for RecordingHyp<C> {
    fn kcov_set_area(&self, table_pa: u64, size: usize) -> Result<(), HypError> {
        self.calls.borrow_mut().push((table_pa, size));
        let fail = if size == 0 {
            self.fail_disable.get()
        } else {
            self.fail_enable.get()
        };
        if fail {
            return Err(HypError::InvalidArgument);
        }
        self.inner.kcov_set_area(table_pa, size)
    }
}

// =============================================================================
// Fake task
// =============================================================================

/// A task as the KCOV framework would present it.
pub struct FakeTask {
    pub mode: KcovMode,
    pub section_depth: i32,
    pub enters: usize,
    pub leaves: usize,
    pub buffer: PageBuffer,
    pub hook: Option<StopHook>,
}

impl FakeTask {
    pub fn new(mode: KcovMode, size: usize) -> Self {
        Self {
            mode,
            section_depth: 0,
            enters: 0,
            leaves: 0,
            buffer: PageBuffer::new(size),
            hook: None,
        }
    }
}

impl KcovTask for FakeTask {
    fn mode(&self) -> KcovMode {
        self.mode
    }

    fn in_section(&self) -> bool {
        self.section_depth > 0
    }

    fn area(&self) -> usize {
        self.buffer.addr()
    }

    fn size(&self) -> usize {
        self.buffer.size()
    }

    fn stop_hook(&self) -> Option<&StopHook> {
        self.hook.as_ref()
    }

    fn stop_hook_mut(&mut self) -> Option<&mut StopHook> {
        self.hook.as_mut()
    }

    fn set_stop_hook(&mut self, hook: Option<StopHook>) -> Option<StopHook> {
        std::mem::replace(&mut self.hook, hook)
    }

    fn enter_section(&mut self) {
        self.enters += 1;
        self.section_depth += 1;
    }

    fn leave_section(&mut self) {
        self.leaves += 1;
        self.section_depth -= 1;
    }
}
