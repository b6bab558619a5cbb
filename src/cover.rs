//! Host-side view of a KCOV trace buffer.
//!
//! Only meant to be read once the session that fills it has stopped.

use core::sync::atomic::{AtomicU64, Ordering};

/// Read-only view over the words of a trace buffer.
pub struct CoverView<'a> {
    words: &'a [AtomicU64],
}

impl<'a> CoverView<'a> {
    /// View over `words`, slot 0 being the count.
    pub fn new(words: &'a [AtomicU64]) -> Self {
        Self { words }
    }

    /// View the `size`-word buffer at `start`.
    ///
    /// # Safety
    /// `start` must be 8-byte aligned and point to `size` words that stay
    /// valid for `'a`.
    pub unsafe fn from_raw(start: usize, size: usize) -> Self {
        let words = unsafe { core::slice::from_raw_parts(start as *const AtomicU64, size) };
        Self { words }
    }

    /// Number of recorded PCs, clamped to what the buffer can hold.
    pub fn count(&self) -> usize {
        let Some(head) = self.words.first() else {
            return 0;
        };
        let n = head.load(Ordering::Acquire);
        usize::try_from(n)
            .unwrap_or(usize::MAX)
            .min(self.words.len() - 1)
    }

    /// Recorded PCs in arrival order.
    pub fn pcs(&self) -> impl Iterator<Item = u64> + '_ {
        let n = self.count();
        self.words
            .iter()
            .skip(1)
            .take(n)
            .map(|w| w.load(Ordering::Relaxed))
    }

    /// Whether the buffer has no room left.
    pub fn is_full(&self) -> bool {
        !self.words.is_empty() && self.count() == self.words.len() - 1
    }

    /// Forget all recorded PCs.
    pub fn reset(&self) {
        if let Some(head) = self.words.first() {
            head.store(0, Ordering::Relaxed);
        }
    }
}
