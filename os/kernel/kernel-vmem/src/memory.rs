//! # Memory objects
//!
//! A [`MemoryObject`] is the destination of virtual pages: an array of page
//! slots, each either backed by a physical frame or absent.
//!
//! | Kind | Backing |
//! |------|---------|
//! | [`MemoryKind::Allocated`] | every page has a zeroed frame from creation/resize on |
//! | [`MemoryKind::OnDemand`] | pages are absent until first touched, then zero-filled |
//! | [`MemoryKind::Physical`] | fixed pre-existing frames (module images, MMIO) |
//!
//! A slot goes from absent to present at most once and stays present until
//! shrinking drops it or the object is destroyed. Dropping the object releases
//! every frame it owns. A Physical window never returns frames to the pool
//! one by one; a claimed window ([`MemoryObject::claim_physical`]) hands its
//! whole range back on drop.

use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_alloc::{FrameAllocError, PhysicalAllocator};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, pages_for};
use kernel_sync::SpinLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Allocated,
    OnDemand,
    Physical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("offset {offset:#x} (+{len:#x}) is outside the object")]
    OutOfRange { offset: u64, len: u64 },
    #[error("physical memory objects cannot be resized")]
    NotResizable,
    #[error(transparent)]
    Frames(#[from] FrameAllocError),
}

pub struct MemoryObject {
    kind: MemoryKind,
    pmm: Arc<PhysicalAllocator>,
    pages: SpinLock<Vec<Option<PhysicalPage>>>,
    /// Physical window whose range was claimed from the allocator.
    claimed: bool,
}

impl MemoryObject {
    /// `pages` eagerly allocated, zeroed pages.
    ///
    /// # Errors
    /// If the pool runs dry; frames taken so far are returned.
    pub fn allocated(pmm: Arc<PhysicalAllocator>, pages: usize) -> Result<Self, MemoryError> {
        let this = Self::with_kind(MemoryKind::Allocated, pmm, 0);
        this.resize(pages)?;
        Ok(this)
    }

    /// `pages` absent pages, populated on first touch.
    #[must_use]
    pub fn on_demand(pmm: Arc<PhysicalAllocator>, pages: usize) -> Self {
        Self::with_kind(MemoryKind::OnDemand, pmm, pages)
    }

    /// A window onto `length` bytes of existing physical memory at `base`.
    ///
    /// The range is trusted: boot code uses this for memory it reserved
    /// itself. Windows requested from user space go through
    /// [`claim_physical`](Self::claim_physical).
    #[must_use]
    pub fn physical(pmm: Arc<PhysicalAllocator>, base: PhysicalAddress, length: u64) -> Self {
        let first = base.page();
        let count = pages_for(base.offset() + length);
        let pages = (0..count).map(|i| Some(first.add_frames(i))).collect();
        Self {
            kind: MemoryKind::Physical,
            pmm,
            pages: SpinLock::new(pages),
            claimed: false,
        }
    }

    /// A window onto `length` bytes at `base` that the allocator must be
    /// able to reach and that shares no frame with another owner. Pool frames
    /// in the range stay taken until the window is dropped.
    ///
    /// # Errors
    /// [`FrameAllocError::NotBacked`] or [`FrameAllocError::InUse`].
    pub fn claim_physical(pmm: Arc<PhysicalAllocator>, base: PhysicalAddress, length: u64) -> Result<Self, MemoryError> {
        pmm.claim_range(base, length)?;
        let mut window = Self::physical(pmm, base, length);
        window.claimed = true;
        Ok(window)
    }

    fn with_kind(kind: MemoryKind, pmm: Arc<PhysicalAllocator>, pages: usize) -> Self {
        Self {
            kind,
            pmm,
            pages: SpinLock::new(alloc::vec![None; pages]),
            claimed: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> MemoryKind {
        self.kind
    }

    #[must_use]
    pub fn num_pages(&self) -> usize {
        self.pages.with_lock_irq(|p| p.len())
    }

    /// Length in bytes.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.num_pages() as u64 * PAGE_SIZE
    }

    /// Number of slots currently backed by a frame.
    #[must_use]
    pub fn present_pages(&self) -> usize {
        self.pages.with_lock_irq(|p| p.iter().flatten().count())
    }

    #[must_use]
    pub fn allocator(&self) -> &Arc<PhysicalAllocator> {
        &self.pmm
    }

    /// Grow or shrink to `pages` pages.
    ///
    /// Growing an Allocated object allocates zeroed frames; growing an
    /// OnDemand object adds absent slots. Shrinking releases owned frames past
    /// the new end.
    ///
    /// # Errors
    /// [`MemoryError::NotResizable`] for Physical objects, or frame exhaustion
    /// (the object keeps its old length).
    pub fn resize(&self, pages: usize) -> Result<(), MemoryError> {
        if self.kind == MemoryKind::Physical {
            return Err(MemoryError::NotResizable);
        }

        let mut slots = self.pages.lock_irq();
        let old = slots.len();
        if pages <= old {
            let dropped: Vec<_> = slots.drain(pages..).flatten().collect();
            drop(slots);
            for frame in dropped {
                self.pmm.try_free(frame)?;
            }
            return Ok(());
        }

        if self.kind == MemoryKind::OnDemand {
            slots.resize(pages, None);
            return Ok(());
        }

        let mut fresh = Vec::with_capacity(pages - old);
        for _ in old..pages {
            match self.pmm.try_allocate_zeroed() {
                Ok(frame) => fresh.push(Some(frame)),
                Err(e) => {
                    drop(slots);
                    for frame in fresh.into_iter().flatten() {
                        self.pmm.try_free(frame)?;
                    }
                    return Err(e.into());
                }
            }
        }
        slots.extend(fresh);
        Ok(())
    }

    /// The frame backing page `index`, if present.
    #[must_use]
    pub fn page_at(&self, index: usize) -> Option<PhysicalPage> {
        self.pages.with_lock_irq(|p| p.get(index).copied().flatten())
    }

    /// The frame backing page `index`, populating an absent OnDemand page with
    /// a zeroed frame.
    ///
    /// # Errors
    /// Out-of-range index or frame exhaustion.
    pub fn ensure_page(&self, index: usize) -> Result<PhysicalPage, MemoryError> {
        let mut slots = self.pages.lock_irq();
        let len = slots.len();
        let slot = slots.get_mut(index).ok_or(MemoryError::OutOfRange {
            offset: index as u64 * PAGE_SIZE,
            len: len as u64 * PAGE_SIZE,
        })?;
        if let Some(frame) = *slot {
            return Ok(frame);
        }
        let frame = self.pmm.try_allocate_zeroed()?;
        *slot = Some(frame);
        log::trace!("populated page {index} with frame {frame}");
        Ok(frame)
    }

    /// Write `data` at byte `offset`, populating pages as needed.
    ///
    /// # Errors
    /// If the range leaves the object or a page cannot be populated.
    pub fn copy_into(&self, offset: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.check_range(offset, data.len() as u64)?;
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let frame = self.ensure_page(page_index(pos))?;
            let n = chunk_len(pos, data.len() - done);
            self.pmm.write(frame.join(pos % PAGE_SIZE), &data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Read into `buf` from byte `offset`. Absent pages read as zero and stay
    /// absent.
    ///
    /// # Errors
    /// If the range leaves the object.
    pub fn copy_out(&self, offset: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.check_range(offset, buf.len() as u64)?;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let n = chunk_len(pos, buf.len() - done);
            match self.page_at(page_index(pos)) {
                Some(frame) => self.pmm.read(frame.join(pos % PAGE_SIZE), &mut buf[done..done + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(())
    }

    /// A private copy: same kind and length, every present page duplicated.
    ///
    /// # Errors
    /// Physical objects cannot be copied; frame exhaustion.
    pub fn duplicate(&self) -> Result<Self, MemoryError> {
        if self.kind == MemoryKind::Physical {
            return Err(MemoryError::NotResizable);
        }
        let source: Vec<_> = self.pages.with_lock_irq(|p| p.clone());
        let copy = Self::with_kind(self.kind, Arc::clone(&self.pmm), source.len());
        for (i, frame) in source.iter().enumerate() {
            if let Some(frame) = frame {
                let fresh = self.pmm.try_allocate(PAGE_SIZE)?;
                self.pmm.copy_frame(*frame, fresh);
                copy.pages.with_lock_irq(|p| p[i] = Some(fresh));
            }
        }
        Ok(copy)
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.length() => Ok(()),
            _ => Err(MemoryError::OutOfRange { offset, len }),
        }
    }
}

impl Drop for MemoryObject {
    fn drop(&mut self) {
        if self.kind == MemoryKind::Physical {
            let pages = self.pages.get_mut();
            if self.claimed
                && let Some(Some(first)) = pages.first()
            {
                // claimed ranges were checked on entry; a failure is already logged
                let _ = self.pmm.release_range(first.base(), pages.len() as u64 * PAGE_SIZE);
            }
            return;
        }
        let pages = core::mem::take(self.pages.get_mut());
        let mut released = 0usize;
        for frame in pages.into_iter().flatten() {
            self.pmm.free(frame);
            released += 1;
        }
        log::trace!("memory object released {released} frames");
    }
}

#[inline]
fn page_index(pos: u64) -> usize {
    (pos / PAGE_SIZE) as usize
}

#[inline]
fn chunk_len(pos: u64, remaining: usize) -> usize {
    ((PAGE_SIZE - pos % PAGE_SIZE) as usize).min(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(frames: usize) -> Arc<PhysicalAllocator> {
        Arc::new(PhysicalAllocator::hosted(PhysicalAddress::new(0x80_0000), frames))
    }

    #[test]
    fn allocated_objects_are_fully_backed_and_zeroed() {
        let pmm = pool(8);
        let m = MemoryObject::allocated(Arc::clone(&pmm), 3).unwrap();
        assert_eq!(m.present_pages(), 3);
        assert_eq!(pmm.num_used_pages(), 3);
        let mut buf = [0xFFu8; 16];
        m.copy_out(PAGE_SIZE * 2, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
        drop(m);
        assert_eq!(pmm.num_used_pages(), 0);
    }

    #[test]
    fn on_demand_pages_appear_on_first_touch_only() {
        let pmm = pool(8);
        let m = MemoryObject::on_demand(Arc::clone(&pmm), 4);
        assert_eq!(m.page_at(1), None);

        let mut buf = [1u8; 8];
        m.copy_out(PAGE_SIZE, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
        assert_eq!(pmm.num_used_pages(), 0, "reads do not populate");

        let f = m.ensure_page(1).unwrap();
        assert_eq!(m.ensure_page(1), Ok(f), "population happens once");
        assert_eq!(m.page_at(1), Some(f));
        assert_eq!(pmm.num_used_pages(), 1);
    }

    #[test]
    fn copy_into_crosses_page_boundaries() {
        let pmm = pool(8);
        let m = MemoryObject::on_demand(Arc::clone(&pmm), 2);
        let data: Vec<u8> = (0u8..=255).collect();
        m.copy_into(PAGE_SIZE - 100, &data).unwrap();
        assert_eq!(m.present_pages(), 2);

        let mut back = vec![0u8; 256];
        m.copy_out(PAGE_SIZE - 100, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn out_of_range_is_reported() {
        let pmm = pool(4);
        let m = MemoryObject::on_demand(pmm, 1);
        assert_eq!(
            m.copy_into(PAGE_SIZE - 1, &[1, 2]),
            Err(MemoryError::OutOfRange { offset: PAGE_SIZE - 1, len: 2 })
        );
        assert!(matches!(m.ensure_page(1), Err(MemoryError::OutOfRange { .. })));
        assert_eq!(m.page_at(5), None);
    }

    #[test]
    fn shrinking_releases_frames() {
        let pmm = pool(8);
        let m = MemoryObject::allocated(Arc::clone(&pmm), 4).unwrap();
        m.resize(1).unwrap();
        assert_eq!(pmm.num_used_pages(), 1);
        m.resize(2).unwrap();
        assert_eq!(pmm.num_used_pages(), 2);
    }

    #[test]
    fn failed_growth_keeps_old_length() {
        let pmm = pool(2);
        let m = MemoryObject::allocated(Arc::clone(&pmm), 1).unwrap();
        assert_eq!(m.resize(5), Err(MemoryError::Frames(FrameAllocError::OutOfMemory)));
        assert_eq!(m.num_pages(), 1);
        assert_eq!(pmm.num_used_pages(), 1);
    }

    #[test]
    fn physical_objects_never_own_frames() {
        let pmm = pool(4);
        let base = PhysicalAddress::new(0x80_2000);
        pmm.reserve_range(base, PAGE_SIZE);
        pmm.write(base, b"module");
        let m = MemoryObject::physical(Arc::clone(&pmm), base, 6);
        assert_eq!(m.num_pages(), 1);
        assert_eq!(m.resize(2), Err(MemoryError::NotResizable));
        let mut name = [0u8; 6];
        m.copy_out(0, &mut name).unwrap();
        assert_eq!(&name, b"module");
        drop(m);
        assert!(pmm.is_allocated(base.page()), "reserved frame stays reserved");
    }

    #[test]
    fn claimed_windows_own_their_range() {
        let pmm = pool(4);
        let base = PhysicalAddress::new(0x80_1000);
        let m = MemoryObject::claim_physical(Arc::clone(&pmm), base, 2 * PAGE_SIZE).unwrap();
        assert_eq!(pmm.num_used_pages(), 2);

        // no second owner, and nothing the allocator cannot reach
        assert_eq!(
            MemoryObject::claim_physical(Arc::clone(&pmm), base, PAGE_SIZE).err(),
            Some(MemoryError::Frames(FrameAllocError::InUse(base.page())))
        );
        let outside = PhysicalAddress::new(0x1000);
        assert_eq!(
            MemoryObject::claim_physical(Arc::clone(&pmm), outside, PAGE_SIZE).err(),
            Some(MemoryError::Frames(FrameAllocError::NotBacked(outside.page())))
        );

        m.copy_into(PAGE_SIZE, b"mmio").unwrap();
        drop(m);
        assert_eq!(pmm.num_used_pages(), 0);
    }

    #[test]
    fn duplicate_is_a_private_copy() {
        let pmm = pool(8);
        let m = MemoryObject::on_demand(Arc::clone(&pmm), 3);
        m.copy_into(8, b"parent").unwrap();
        let c = m.duplicate().unwrap();
        assert_eq!(c.present_pages(), 1);
        c.copy_into(8, b"child!").unwrap();

        let mut buf = [0u8; 6];
        m.copy_out(8, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
        c.copy_out(8, &mut buf).unwrap();
        assert_eq!(&buf, b"child!");
    }
}
