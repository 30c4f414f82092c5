//! # Reaching physical frames from kernel code
//!
//! Code can only dereference virtual addresses. A [`PhysMapper`] turns a
//! physical frame into a pointer the kernel can use.
//!
//! - [`HhdmPhysMapper`]: with a higher-half direct map every frame is visible
//!   at `HHDM_BASE + pa`.
//! - [`RamPhysMapper`]: a heap arena of 4 KiB-aligned frames that stands in
//!   for RAM when the kernel runs hosted (tests, tooling).

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};

/// Base of the higher-half direct map.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Physical bytes the direct map covers.
pub const HHDM_SIZE: u64 = 1 << 46;

/// Converts a physical frame into a kernel-usable pointer.
///
/// # Contract
/// A returned pointer addresses `PAGE_SIZE` bytes that stay valid for the
/// lifetime of the mapper. The mapper performs no synchronization; callers
/// coordinate access to frame contents through frame ownership.
pub trait PhysMapper: Send + Sync {
    /// `None` if the mapper cannot reach `frame`.
    fn frame_ptr(&self, frame: PhysicalPage) -> Option<NonNull<u8>>;

    /// Whether every one of the `frames` frames from `first` on is reachable.
    fn covers(&self, first: PhysicalPage, frames: u64) -> bool;
}

/// [`PhysMapper`] for kernels with a higher-half direct map (HHDM).
///
/// # Safety
/// The HHDM must be present and cover every frame handed to
/// [`frame_ptr`](PhysMapper::frame_ptr).
#[derive(Debug, Clone, Copy)]
pub struct HhdmPhysMapper {
    base: u64,
}

impl HhdmPhysMapper {
    #[must_use]
    pub const fn new(base: u64) -> Self {
        Self { base }
    }
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::new(HHDM_BASE)
    }
}

impl PhysMapper for HhdmPhysMapper {
    fn frame_ptr(&self, frame: PhysicalPage) -> Option<NonNull<u8>> {
        if !self.covers(frame, 1) {
            return None;
        }
        NonNull::new(self.base.wrapping_add(frame.base().as_u64()) as *mut u8)
    }

    fn covers(&self, first: PhysicalPage, frames: u64) -> bool {
        frames
            .checked_mul(PAGE_SIZE)
            .and_then(|len| first.base().as_u64().checked_add(len))
            .is_some_and(|end| end <= HHDM_SIZE)
    }
}

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE as usize]);

/// Hosted stand-in for RAM: `frames` zeroed frames starting at `base`.
pub struct RamPhysMapper {
    base: PhysicalPage,
    frames: Box<[UnsafeCell<Frame>]>,
}

// Safety: the arena never moves; concurrent access to one frame's bytes is
// ruled out by frame ownership, as with real RAM.
unsafe impl Sync for RamPhysMapper {}
unsafe impl Send for RamPhysMapper {}

impl RamPhysMapper {
    #[must_use]
    pub fn new(base: PhysicalAddress, frames: usize) -> Self {
        let frames = (0..frames)
            .map(|_| UnsafeCell::new(Frame([0; PAGE_SIZE as usize])))
            .collect();
        Self {
            base: base.page(),
            frames,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn index_of(&self, frame: PhysicalPage) -> Option<usize> {
        frame
            .frame_number()
            .checked_sub(self.base.frame_number())
            .and_then(|i| usize::try_from(i).ok())
            .filter(|&i| i < self.frames.len())
    }
}

impl PhysMapper for RamPhysMapper {
    fn frame_ptr(&self, frame: PhysicalPage) -> Option<NonNull<u8>> {
        let index = self.index_of(frame)?;
        NonNull::new(self.frames[index].get().cast::<u8>())
    }

    fn covers(&self, first: PhysicalPage, frames: u64) -> bool {
        let Some(start) = self.index_of(first) else {
            return frames == 0;
        };
        usize::try_from(frames).is_ok_and(|n| n <= self.frames.len() - start)
    }
}
