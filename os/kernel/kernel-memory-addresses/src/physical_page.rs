use crate::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use core::fmt;

/// Base address of one 4 KiB physical frame.
///
/// ### Invariants
/// - The low [`PAGE_SHIFT`] bits of the base are always zero.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let frame = PhysicalAddress::new(0x0000_0008_1234_5678).page();
/// assert_eq!(frame.base().as_u64(), 0x0000_0008_1234_5000);
/// assert_eq!(frame.frame_number(), 0x0000_0008_1234_5000 >> 12);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u64);

impl PhysicalPage {
    /// The frame containing `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: PhysicalAddress) -> Self {
        Self(addr.as_u64() & !(PAGE_SIZE - 1))
    }

    #[inline]
    #[must_use]
    pub const fn from_frame_number(pfn: u64) -> Self {
        Self(pfn << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn frame_number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0)
    }

    /// Combine with an in-frame offset. Debug-asserts `off < PAGE_SIZE`.
    #[inline]
    #[must_use]
    pub const fn join(self, off: u64) -> PhysicalAddress {
        debug_assert!(off < PAGE_SIZE);
        PhysicalAddress::new(self.0 + off)
    }

    /// The frame `n` frames after this one.
    #[inline]
    #[must_use]
    pub const fn add_frames(self, n: u64) -> Self {
        Self(self.0 + n * PAGE_SIZE)
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/4K", self.0)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage(0x{:016X})", self.0)
    }
}
