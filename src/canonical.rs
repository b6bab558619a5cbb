//! Instruction address canonicalization.
//!
//! Coverage samples are recorded as link-time kernel image addresses so
//! that traces from different boots can be compared. An address captured
//! in the hypervisor goes through two steps:
//!
//! 1. hyp VA -> kernel image VA (via the physical address of the text)
//! 2. subtract the KASLR offset the image was loaded with

/// Offsets describing where the hypervisor image lives at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageLayout {
    /// Added to a hyp VA to obtain the physical address (two's complement).
    pub hyp_physvirt_offset: u64,
    /// Added to a physical address to obtain the kernel image VA.
    pub kimage_voffset: u64,
    /// Randomized load offset of the kernel image (0 without KASLR).
    pub kaslr_offset: u64,
}

impl ImageLayout {
    /// A layout where hyp VAs already are link-time image addresses.
    pub const fn identity() -> Self {
        Self {
            hyp_physvirt_offset: 0,
            kimage_voffset: 0,
            kaslr_offset: 0,
        }
    }

    /// Translate a hyp VA into the kernel image VA of the same byte.
    #[inline(always)]
    pub const fn hyp_kimg_va(&self, ip: u64) -> u64 {
        ip.wrapping_add(self.hyp_physvirt_offset)
            .wrapping_add(self.kimage_voffset)
    }

    /// Canonicalize a raw return address captured in the hypervisor.
    #[inline(always)]
    pub const fn canonicalize(&self, ip: u64) -> u64 {
        self.hyp_kimg_va(ip).wrapping_sub(self.kaslr_offset)
    }
}
