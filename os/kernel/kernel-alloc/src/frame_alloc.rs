//! Bitmap-based frame bookkeeping.
//!
//! Each bit tracks one 4 KiB frame of a contiguous physical range:
//! `1` = allocated, `0` = free. This type does no locking; the shared
//! [`PhysicalAllocator`](crate::PhysicalAllocator) wraps it in a spin lock.

use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, pages_for};

const BITS: usize = u64::BITS as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("alignment {0:#x} is not a power-of-two multiple of the page size")]
    InvalidAlignment(u64),
    #[error("frame {0} is outside the managed pool")]
    OutOfPool(PhysicalPage),
    #[error("frame {0} is already free")]
    DoubleFree(PhysicalPage),
    #[error("frame {0} is in use")]
    InUse(PhysicalPage),
    #[error("frame {0} is not backed by physical memory")]
    NotBacked(PhysicalPage),
}

/// Tracks free/used state for `frames` frames starting at `base`.
///
/// ### Invariants
/// - `free` equals the number of zero bits among the first `frames` bits.
/// - Bits past `frames` in the last word are permanently set.
pub struct BitmapFrameAlloc {
    base: PhysicalPage,
    frames: usize,
    bitmap: Vec<u64>,
    free: usize,
    /// Index where the next unaligned search starts.
    hint: usize,
}

impl BitmapFrameAlloc {
    /// A pool of `frames` free frames starting at `base` (aligned down).
    #[must_use]
    pub fn new(base: PhysicalAddress, frames: usize) -> Self {
        let words = frames.div_ceil(BITS);
        let mut bitmap = vec![0u64; words];
        let tail = frames % BITS;
        if tail != 0 {
            bitmap[words - 1] = !0u64 << tail;
        }
        Self {
            base: base.page(),
            frames,
            bitmap,
            free: frames,
            hint: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalPage {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.frames
    }

    #[inline]
    #[must_use]
    pub const fn num_free(&self) -> usize {
        self.free
    }

    #[inline]
    #[must_use]
    pub const fn num_used(&self) -> usize {
        self.frames - self.free
    }

    /// Whether `page` lies inside the managed range.
    #[must_use]
    pub fn contains(&self, page: PhysicalPage) -> bool {
        self.index_of(page).is_some()
    }

    /// Whether `page` is currently allocated. `false` outside the pool.
    #[must_use]
    pub fn is_allocated(&self, page: PhysicalPage) -> bool {
        self.index_of(page).is_some_and(|i| self.bit(i))
    }

    /// Take one free frame whose address is a multiple of `align`.
    ///
    /// # Errors
    /// [`FrameAllocError::InvalidAlignment`] for a bad alignment,
    /// [`FrameAllocError::OutOfMemory`] if no suitable frame is free.
    pub fn allocate(&mut self, align: u64) -> Result<PhysicalPage, FrameAllocError> {
        if align < PAGE_SIZE || !align.is_power_of_two() {
            return Err(FrameAllocError::InvalidAlignment(align));
        }
        if self.free == 0 {
            return Err(FrameAllocError::OutOfMemory);
        }

        let index = if align == PAGE_SIZE {
            self.find_any()
        } else {
            self.find_aligned(align / PAGE_SIZE)
        }
        .ok_or(FrameAllocError::OutOfMemory)?;

        self.set(index, true);
        self.free -= 1;
        self.hint = index + 1;
        Ok(self.page_at(index))
    }

    /// Return a frame to the pool.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfPool`] or [`FrameAllocError::DoubleFree`].
    pub fn free(&mut self, page: PhysicalPage) -> Result<(), FrameAllocError> {
        let index = self.index_of(page).ok_or(FrameAllocError::OutOfPool(page))?;
        if !self.bit(index) {
            return Err(FrameAllocError::DoubleFree(page));
        }
        self.set(index, false);
        self.free += 1;
        if index < self.hint {
            self.hint = index;
        }
        Ok(())
    }

    /// Mark every frame overlapping `[start, start + len)` as used.
    ///
    /// Frames outside the pool and frames already used are skipped. Returns the
    /// number of frames newly reserved.
    pub fn reserve_range(&mut self, start: PhysicalAddress, len: u64) -> usize {
        let mut reserved = 0;
        for i in self.pool_indices(start, len) {
            if !self.bit(i) {
                self.set(i, true);
                self.free -= 1;
                reserved += 1;
            }
        }
        reserved
    }

    /// Take every pool frame overlapping `[start, start + len)`, all or
    /// nothing. Frames outside the pool are left alone. Returns the number
    /// of frames taken.
    ///
    /// # Errors
    /// [`FrameAllocError::InUse`] for the first frame that is already used.
    pub fn claim_range(&mut self, start: PhysicalAddress, len: u64) -> Result<usize, FrameAllocError> {
        let indices = self.pool_indices(start, len);
        if let Some(i) = indices.clone().find(|&i| self.bit(i)) {
            return Err(FrameAllocError::InUse(self.page_at(i)));
        }
        for i in indices.clone() {
            self.set(i, true);
        }
        self.free -= indices.len();
        Ok(indices.len())
    }

    /// Undo [`claim_range`](Self::claim_range).
    ///
    /// # Errors
    /// [`FrameAllocError::DoubleFree`] if a pool frame in the range is free;
    /// the frames before it are released.
    pub fn release_range(&mut self, start: PhysicalAddress, len: u64) -> Result<usize, FrameAllocError> {
        let mut released = 0;
        for i in self.pool_indices(start, len) {
            self.free(self.page_at(i))?;
            released += 1;
        }
        Ok(released)
    }

    /// Indices of the pool frames overlapping `[start, start + len)`.
    fn pool_indices(&self, start: PhysicalAddress, len: u64) -> Range<usize> {
        let base = self.base.frame_number();
        let first = start.page().frame_number();
        let end = first.saturating_add(pages_for(start.offset().saturating_add(len)));
        let clamp = |pfn: u64| usize::try_from(pfn.saturating_sub(base)).map_or(self.frames, |i| i.min(self.frames));
        clamp(first)..clamp(end)
    }

    fn find_any(&self) -> Option<usize> {
        let words = self.bitmap.len();
        let start = (self.hint / BITS).min(words);
        (start..words)
            .chain(0..start)
            .find(|&w| self.bitmap[w] != u64::MAX)
            .map(|w| w * BITS + self.bitmap[w].trailing_ones() as usize)
    }

    fn find_aligned(&self, step: u64) -> Option<usize> {
        let base_pfn = self.base.frame_number();
        // first index whose absolute frame number is a multiple of `step`
        let first = usize::try_from(base_pfn.next_multiple_of(step) - base_pfn).ok()?;
        let step = usize::try_from(step).ok()?;
        (first..self.frames).step_by(step).find(|&i| !self.bit(i))
    }

    fn index_of(&self, page: PhysicalPage) -> Option<usize> {
        let rel = page.frame_number().checked_sub(self.base.frame_number())?;
        let rel = usize::try_from(rel).ok()?;
        (rel < self.frames).then_some(rel)
    }

    fn page_at(&self, index: usize) -> PhysicalPage {
        self.base.add_frames(index as u64)
    }

    #[inline]
    fn bit(&self, index: usize) -> bool {
        (self.bitmap[index / BITS] >> (index % BITS)) & 1 == 1
    }

    #[inline]
    fn set(&mut self, index: usize, used: bool) {
        let mask = 1u64 << (index % BITS);
        if used {
            self.bitmap[index / BITS] |= mask;
        } else {
            self.bitmap[index / BITS] &= !mask;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x0010_0000;

    #[test]
    fn allocates_every_frame_exactly_once() {
        let mut a = BitmapFrameAlloc::new(PhysicalAddress::new(BASE), 70);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..70 {
            let f = a.allocate(PAGE_SIZE).unwrap();
            assert!(seen.insert(f), "frame {f} handed out twice");
        }
        assert_eq!(a.allocate(PAGE_SIZE), Err(FrameAllocError::OutOfMemory));
        assert_eq!(a.num_used(), 70);
        assert_eq!(a.num_free(), 0);
    }

    #[test]
    fn aligned_allocation_respects_alignment() {
        // base is 1 MiB, so the first 64 KiB-aligned frame is frame 0
        let mut a = BitmapFrameAlloc::new(PhysicalAddress::new(BASE + PAGE_SIZE), 64);
        let f = a.allocate(0x1_0000).unwrap();
        assert_eq!(f.base().as_u64() % 0x1_0000, 0);
        assert_eq!(f.base().as_u64(), BASE + 0x1_0000);
    }

    #[test]
    fn bad_alignment_is_rejected() {
        let mut a = BitmapFrameAlloc::new(PhysicalAddress::new(BASE), 4);
        assert_eq!(a.allocate(0), Err(FrameAllocError::InvalidAlignment(0)));
        assert_eq!(a.allocate(0x1800), Err(FrameAllocError::InvalidAlignment(0x1800)));
        assert_eq!(a.allocate(512), Err(FrameAllocError::InvalidAlignment(512)));
    }

    #[test]
    fn double_free_and_foreign_frames_are_reported() {
        let mut a = BitmapFrameAlloc::new(PhysicalAddress::new(BASE), 4);
        let f = a.allocate(PAGE_SIZE).unwrap();
        assert_eq!(a.free(f), Ok(()));
        assert_eq!(a.free(f), Err(FrameAllocError::DoubleFree(f)));

        let foreign = PhysicalAddress::new(0x1000).page();
        assert_eq!(a.free(foreign), Err(FrameAllocError::OutOfPool(foreign)));
    }

    #[test]
    fn freed_frames_are_reused() {
        let mut a = BitmapFrameAlloc::new(PhysicalAddress::new(BASE), 2);
        let f0 = a.allocate(PAGE_SIZE).unwrap();
        let _f1 = a.allocate(PAGE_SIZE).unwrap();
        a.free(f0).unwrap();
        assert_eq!(a.allocate(PAGE_SIZE), Ok(f0));
    }

    #[test]
    fn reserve_range_takes_frames_out_of_circulation() {
        let mut a = BitmapFrameAlloc::new(PhysicalAddress::new(BASE), 8);
        let n = a.reserve_range(PhysicalAddress::new(BASE + 0x800), 0x1000);
        assert_eq!(n, 2);
        assert_eq!(a.reserve_range(PhysicalAddress::new(BASE), 0x1000), 0);
        assert_eq!(a.num_free(), 6);
        assert!(a.is_allocated(PhysicalAddress::new(BASE + 0x1000).page()));
    }

    #[test]
    fn claims_are_all_or_nothing() {
        let mut a = BitmapFrameAlloc::new(PhysicalAddress::new(BASE), 8);
        let busy = a.allocate(PAGE_SIZE).unwrap();
        assert_eq!(
            a.claim_range(PhysicalAddress::new(BASE), 3 * PAGE_SIZE),
            Err(FrameAllocError::InUse(busy))
        );
        assert_eq!(a.num_free(), 7);

        // straddles the end of the pool: only the frames inside count
        let tail = PhysicalAddress::new(BASE + 6 * PAGE_SIZE);
        assert_eq!(a.claim_range(tail, 4 * PAGE_SIZE), Ok(2));
        assert_eq!(a.num_free(), 5);
        assert_eq!(a.release_range(tail, 4 * PAGE_SIZE), Ok(2));
        assert_eq!(a.num_free(), 7);
        assert_eq!(
            a.release_range(tail, PAGE_SIZE),
            Err(FrameAllocError::DoubleFree(tail.page()))
        );
    }
}
