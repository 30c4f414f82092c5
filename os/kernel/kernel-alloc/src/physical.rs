use crate::frame_alloc::{BitmapFrameAlloc, FrameAllocError};
use crate::phys_mapper::{PhysMapper, RamPhysMapper};
use alloc::boxed::Box;
use core::ptr::{self, NonNull};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, pages_for};
use kernel_sync::SpinLock;

/// The kernel's shared physical frame pool.
///
/// The bitmap sits behind an interrupt-masking spin lock held only for the
/// bitmap mutation itself. Frame contents are accessed through the
/// [`PhysMapper`] without holding the lock; the caller owns the frames it
/// touches.
pub struct PhysicalAllocator {
    frames: SpinLock<BitmapFrameAlloc>,
    mapper: Box<dyn PhysMapper>,
}

impl PhysicalAllocator {
    pub fn new(frames: BitmapFrameAlloc, mapper: impl PhysMapper + 'static) -> Self {
        log::info!(
            "physical pool: {} frames at {}",
            frames.total_frames(),
            frames.base()
        );
        Self {
            frames: SpinLock::new(frames),
            mapper: Box::new(mapper),
        }
    }

    /// A pool of `frames` frames at `base`, backed by a heap arena.
    #[must_use]
    pub fn hosted(base: PhysicalAddress, frames: usize) -> Self {
        Self::new(
            BitmapFrameAlloc::new(base, frames),
            RamPhysMapper::new(base, frames),
        )
    }

    /// Allocate one frame aligned to `align`.
    ///
    /// # Panics
    /// When the pool is exhausted or `align` is invalid. Paths that must fail
    /// cleanly use [`try_allocate`](Self::try_allocate).
    #[must_use]
    pub fn allocate(&self, align: u64) -> PhysicalPage {
        match self.try_allocate(align) {
            Ok(frame) => frame,
            Err(e) => {
                let used = self.num_used_pages();
                log::error!("frame allocation failed: {e} ({used} frames in use)");
                panic!("physical frame allocation failed: {e}");
            }
        }
    }

    /// Allocate one frame aligned to `align`.
    ///
    /// # Errors
    /// See [`BitmapFrameAlloc::allocate`].
    pub fn try_allocate(&self, align: u64) -> Result<PhysicalPage, FrameAllocError> {
        let frame = self.frames.with_lock_irq(|f| f.allocate(align))?;
        log::trace!("allocated frame {frame}");
        Ok(frame)
    }

    /// Allocate a frame and zero it.
    ///
    /// # Errors
    /// See [`try_allocate`](Self::try_allocate).
    pub fn try_allocate_zeroed(&self) -> Result<PhysicalPage, FrameAllocError> {
        let frame = self.try_allocate(PAGE_SIZE)?;
        self.zero(frame);
        Ok(frame)
    }

    /// Return a frame to the pool.
    ///
    /// # Panics
    /// On a double free or a frame outside the pool. Callers that can report
    /// the failure use [`try_free`](Self::try_free).
    pub fn free(&self, frame: PhysicalPage) {
        if let Err(e) = self.try_free(frame) {
            panic!("invalid frame release: {e}");
        }
    }

    /// Return a frame to the pool.
    ///
    /// # Errors
    /// [`FrameAllocError::DoubleFree`] or [`FrameAllocError::OutOfPool`]; the
    /// pool is left unchanged.
    pub fn try_free(&self, frame: PhysicalPage) -> Result<(), FrameAllocError> {
        self.frames.with_lock_irq(|f| f.free(frame)).inspect_err(|e| {
            log::error!("invalid frame release: {e}");
        })?;
        log::trace!("freed frame {frame}");
        Ok(())
    }

    /// Take `[start, start + len)` out of circulation (boot modules, firmware).
    pub fn reserve_range(&self, start: PhysicalAddress, len: u64) -> usize {
        self.frames.with_lock_irq(|f| f.reserve_range(start, len))
    }

    /// Whether the mapper reaches every frame of `[start, start + len)`.
    #[must_use]
    pub fn is_backed(&self, start: PhysicalAddress, len: u64) -> bool {
        start
            .offset()
            .checked_add(len)
            .is_some_and(|span| self.mapper.covers(start.page(), pages_for(span)))
    }

    /// Give `[start, start + len)` to a single owner: the range must be
    /// reachable and none of its pool frames may be in use. Pool frames in
    /// the range are marked used until [`release_range`](Self::release_range).
    ///
    /// # Errors
    /// [`FrameAllocError::NotBacked`] or [`FrameAllocError::InUse`].
    pub fn claim_range(&self, start: PhysicalAddress, len: u64) -> Result<usize, FrameAllocError> {
        if !self.is_backed(start, len) {
            return Err(FrameAllocError::NotBacked(start.page()));
        }
        let claimed = self.frames.with_lock_irq(|f| f.claim_range(start, len))?;
        log::debug!("claimed {claimed} pool frames at {start} (+{len:#x})");
        Ok(claimed)
    }

    /// Return the pool frames of a range taken by
    /// [`claim_range`](Self::claim_range).
    ///
    /// # Errors
    /// [`FrameAllocError::DoubleFree`] if part of the range was already free.
    pub fn release_range(&self, start: PhysicalAddress, len: u64) -> Result<usize, FrameAllocError> {
        self.frames
            .with_lock_irq(|f| f.release_range(start, len))
            .inspect_err(|e| log::error!("invalid range release at {start}: {e}"))
    }

    #[must_use]
    pub fn num_used_pages(&self) -> usize {
        self.frames.with_lock_irq(|f| f.num_used())
    }

    #[must_use]
    pub fn num_free_pages(&self) -> usize {
        self.frames.with_lock_irq(|f| f.num_free())
    }

    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.frames.with_lock_irq(|f| f.total_frames())
    }

    #[must_use]
    pub fn is_allocated(&self, frame: PhysicalPage) -> bool {
        self.frames.with_lock_irq(|f| f.is_allocated(frame))
    }

    #[must_use]
    pub fn mapper(&self) -> &dyn PhysMapper {
        &*self.mapper
    }

    /// Fill the frame with zeros.
    pub fn zero(&self, frame: PhysicalPage) {
        let p = self.frame_ptr(frame);
        unsafe { ptr::write_bytes(p.as_ptr(), 0, PAGE_SIZE as usize) }
    }

    /// Copy one whole frame.
    pub fn copy_frame(&self, from: PhysicalPage, to: PhysicalPage) {
        let src = self.frame_ptr(from);
        let dst = self.frame_ptr(to);
        if src != dst {
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), PAGE_SIZE as usize) }
        }
    }

    /// Read `buf.len()` bytes starting at `pa`.
    ///
    /// The range may cross frame boundaries; frames are taken as physically
    /// contiguous.
    pub fn read(&self, pa: PhysicalAddress, buf: &mut [u8]) {
        self.for_each_chunk(pa, buf.len(), |src, done, n| unsafe {
            ptr::copy_nonoverlapping(src, buf[done..].as_mut_ptr(), n);
        });
    }

    /// Write `data` starting at `pa`. Same contiguity rules as [`read`](Self::read).
    pub fn write(&self, pa: PhysicalAddress, data: &[u8]) {
        self.for_each_chunk(pa, data.len(), |dst, done, n| unsafe {
            ptr::copy_nonoverlapping(data[done..].as_ptr(), dst, n);
        });
    }

    /// Read a naturally aligned `u64`.
    #[must_use]
    pub fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        debug_assert_eq!(pa.as_u64() % 8, 0);
        let p = self.byte_ptr(pa).cast::<u64>();
        unsafe { ptr::read_volatile(p) }
    }

    /// Write a naturally aligned `u64`.
    pub fn write_u64(&self, pa: PhysicalAddress, value: u64) {
        debug_assert_eq!(pa.as_u64() % 8, 0);
        let p = self.byte_ptr(pa).cast::<u64>();
        unsafe { ptr::write_volatile(p, value) }
    }

    /// # Panics
    /// If the mapper cannot reach `frame`. Frames come from the pool or from
    /// ranges checked by [`claim_range`](Self::claim_range), so this is
    /// kernel-state corruption.
    fn frame_ptr(&self, frame: PhysicalPage) -> NonNull<u8> {
        self.mapper
            .frame_ptr(frame)
            .unwrap_or_else(|| panic!("frame {frame} is not backed by the physical mapper"))
    }

    fn byte_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let (frame, off) = pa.split();
        unsafe { self.frame_ptr(frame).as_ptr().add(off as usize) }
    }

    /// Calls `f(ptr, done, n)` for each in-frame chunk of `[pa, pa + len)`.
    fn for_each_chunk(&self, pa: PhysicalAddress, len: usize, mut f: impl FnMut(*mut u8, usize, usize)) {
        let mut done = 0usize;
        let mut cur = pa;
        while done < len {
            let room = (PAGE_SIZE - cur.offset()) as usize;
            let n = room.min(len - done);
            f(self.byte_ptr(cur), done, n);
            done += n;
            cur += n as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(frames: usize) -> PhysicalAllocator {
        PhysicalAllocator::hosted(PhysicalAddress::new(0x40_0000), frames)
    }

    #[test]
    fn reads_see_writes_across_frame_boundaries() {
        let pmm = pool(2);
        let a = pmm.allocate(PAGE_SIZE);
        let b = pmm.allocate(PAGE_SIZE);
        assert_eq!(b, a.add_frames(1), "fresh pool hands out frames in order");

        let data: Vec<u8> = (0..32).collect();
        pmm.write(a.join(PAGE_SIZE - 16), &data);

        let mut back = [0u8; 32];
        pmm.read(a.join(PAGE_SIZE - 16), &mut back);
        assert_eq!(&back[..], &data[..]);

        let mut head = [0u8; 16];
        pmm.read(b.base(), &mut head);
        assert_eq!(&head[..], &data[16..]);
    }

    #[test]
    fn zero_and_copy_frame() {
        let pmm = pool(2);
        let a = pmm.allocate(PAGE_SIZE);
        let b = pmm.allocate(PAGE_SIZE);
        pmm.write_u64(a.join(0x100), 42);
        pmm.copy_frame(a, b);
        assert_eq!(pmm.read_u64(b.join(0x100)), 42);
        pmm.zero(b);
        assert_eq!(pmm.read_u64(b.join(0x100)), 0);
    }

    #[test]
    fn exhaustion_fails_cleanly_through_try_allocate() {
        let pmm = pool(3);
        let frames: Vec<_> = (0..3).map(|_| pmm.allocate(PAGE_SIZE)).collect();
        assert_eq!(pmm.try_allocate(PAGE_SIZE), Err(FrameAllocError::OutOfMemory));
        for f in frames {
            pmm.free(f);
        }
        assert_eq!(pmm.num_free_pages(), 3);
    }

    #[test]
    #[should_panic(expected = "physical frame allocation failed")]
    fn allocate_panics_when_exhausted() {
        let pmm = pool(1);
        let _a = pmm.allocate(PAGE_SIZE);
        let _b = pmm.allocate(PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "invalid frame release")]
    fn double_free_panics() {
        let pmm = pool(1);
        let a = pmm.allocate(PAGE_SIZE);
        pmm.free(a);
        pmm.free(a);
    }

    #[test]
    fn try_free_reports_bad_releases() {
        let pmm = pool(1);
        let a = pmm.allocate(PAGE_SIZE);
        assert_eq!(pmm.try_free(a), Ok(()));
        assert_eq!(pmm.try_free(a), Err(FrameAllocError::DoubleFree(a)));
        let foreign = PhysicalAddress::new(0x1000).page();
        assert_eq!(pmm.try_free(foreign), Err(FrameAllocError::OutOfPool(foreign)));
        assert_eq!(pmm.num_free_pages(), 1);
    }

    #[test]
    fn claims_need_backing_and_free_frames() {
        let pmm = pool(4);
        let base = PhysicalAddress::new(0x40_0000);
        assert!(pmm.is_backed(base, 4 * PAGE_SIZE));
        assert!(!pmm.is_backed(base, 5 * PAGE_SIZE));
        assert_eq!(
            pmm.claim_range(PhysicalAddress::new(0), PAGE_SIZE),
            Err(FrameAllocError::NotBacked(PhysicalAddress::new(0).page()))
        );

        let owned = pmm.try_allocate(PAGE_SIZE).unwrap();
        assert_eq!(pmm.claim_range(base, 2 * PAGE_SIZE), Err(FrameAllocError::InUse(owned)));

        let window = base + 2 * PAGE_SIZE;
        assert_eq!(pmm.claim_range(window, 2 * PAGE_SIZE), Ok(2));
        assert_eq!(pmm.try_allocate(PAGE_SIZE), Ok(owned.add_frames(1)));
        assert_eq!(pmm.try_allocate(PAGE_SIZE), Err(FrameAllocError::OutOfMemory));
        assert_eq!(pmm.release_range(window, 2 * PAGE_SIZE), Ok(2));
        assert_eq!(pmm.num_free_pages(), 2);
    }
}
