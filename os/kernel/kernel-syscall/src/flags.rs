use bitfield_struct::bitfield;

/// `AllocateMemory`: leave pages unbacked until first touched.
pub const ALLOC_ON_DEMAND: u64 = 1 << 0;

/// `MapMemory` flag bits.
pub const MAP_FIXED: u64 = 1 << 0;
pub const MAP_PREFER_TOP: u64 = 1 << 1;
pub const MAP_READ_WRITE: u64 = 1 << 2;
pub const MAP_READ_EXECUTE: u64 = 1 << 3;
pub const MAP_SHARE_ON_FORK: u64 = 1 << 4;

/// Message direction for pipe sends and receives. Exactly one bit is set.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct MsgFlags {
    pub request: bool,
    pub response: bool,
    #[bits(30)]
    __: u32,
}

impl MsgFlags {
    /// `true` if exactly one direction is selected and no unknown bit is set.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.into_bits() == 0b01 || self.into_bits() == 0b10
    }
}

/// `CreateThread` flags.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ThreadFlags {
    /// The thread does not share its CPU with the thread group.
    pub exclusive: bool,
    /// Unexpected faults exit the thread instead of stopping it for an observer.
    pub traps_are_fatal: bool,
    /// Create without enqueueing; `Resume` starts it.
    pub stopped: bool,
    #[bits(29)]
    __: u32,
}
