//! # Address Space (x86-64, PML4-rooted)
//!
//! One protection domain: a page-table root plus an ordered, non-overlapping
//! set of [`Mapping`]s from virtual ranges to [`MemoryObject`]s.
//!
//! ## Highlights
//!
//! - [`AddressSpace::map`] places a mapping (fixed, bottom-up or top-down) but
//!   installs no translations; every page is populated by
//!   [`AddressSpace::handle_fault`] on first access.
//! - Kernel copies to and from user memory [`resolve`](AddressSpace::resolve)
//!   each page to its memory object under the lock and copy through the
//!   object, so a concurrent unmap cannot pull the frame away mid-copy.
//! - [`AddressSpace::unmap`] removes exactly one whole mapping, clears its
//!   entries and shoots down stale translations after dropping the lock.
//! - [`AddressSpace::fork`] clones the mapping set, sharing or copying each
//!   memory object.
//! - Dropping the space frees its user-half table frames; the kernel half
//!   (PML4 slots `256..512`) is shared with the kernel space and left alone.
//!
//! ## Locking
//!
//! All structural mutation happens under one interrupt-masking spin lock. Lock
//! order is address space → memory object → frame allocator.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use kernel_alloc::{FrameAllocError, PhysicalAllocator};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};
use kernel_sync::SpinLock;

use crate::fault::{Access, PageFaultError};
use crate::memory::{MemoryError, MemoryKind, MemoryObject};
use crate::page_table::{ENTRIES, KERNEL_PML4_START, PageTableEntry, PageTableWalker};

/// Lowest address handed out to user mappings.
pub const USER_BASE: u64 = 0x0000_0000_0010_0000;

/// One past the highest user-mappable address.
pub const USER_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// How [`AddressSpace::map`] places and protects a mapping.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct MapFlags {
    /// Place exactly at the hint.
    pub fixed: bool,
    /// Search free space top-down (stacks).
    pub prefer_top: bool,
    pub read_write: bool,
    pub read_execute: bool,
    /// Children of a fork share the memory object instead of copying it.
    pub share_on_fork: bool,
    #[bits(27)]
    __: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("mapping overlaps an existing mapping")]
    Overlap,
    #[error("range is outside the user half or the memory object")]
    OutOfRange,
    #[error("no free virtual range is large enough")]
    NoSpace,
    #[error("no mapping with that base and length")]
    NotMapped,
    #[error("mapping cannot be both writable and executable")]
    WriteExecute,
    #[error("mapping needs read-write or read-execute permission")]
    NoPermission,
    #[error("offset, length or address is not page aligned")]
    Unaligned,
    #[error("unresolvable fault at {0}")]
    Fault(VirtualAddress),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Frames(#[from] FrameAllocError),
}

/// A broken address-space invariant found by [`AddressSpace::check_invariants`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvariantError {
    #[error("mappings at {0} and {1} overlap")]
    Overlap(VirtualAddress, VirtualAddress),
    #[error("present entry for {0:?} has no mapping")]
    Orphan(VirtualPage),
    #[error("entry for {0:?} does not point at the object's frame")]
    FrameMismatch(VirtualPage),
    #[error("entry for {0:?} disagrees with the mapping's permission")]
    PermissionMismatch(VirtualPage),
}

/// Invalidates stale translations on every CPU that may cache them.
pub trait TlbShootdown: Send + Sync {
    fn shootdown(&self, root: PhysicalPage, base: VirtualAddress, pages: usize);
}

/// For spaces that are never live on a CPU (hosted kernels, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoShootdown;

impl TlbShootdown for NoShootdown {
    fn shootdown(&self, _root: PhysicalPage, _base: VirtualAddress, _pages: usize) {}
}

/// `invlpg` on the current CPU only.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalInvlpg;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl TlbShootdown for LocalInvlpg {
    fn shootdown(&self, _root: PhysicalPage, base: VirtualAddress, pages: usize) {
        for i in 0..pages as u64 {
            let va = base.as_u64() + i * PAGE_SIZE;
            unsafe { core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags)) }
        }
    }
}

/// A virtual range backed by a memory object.
#[derive(Clone)]
pub struct Mapping {
    pub base: VirtualAddress,
    pub length: u64,
    pub memory: Arc<MemoryObject>,
    /// Byte offset into `memory` of the first page.
    pub offset: u64,
    pub flags: MapFlags,
}

impl Mapping {
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64() + self.length
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.base.as_u64() && va.as_u64() < self.end()
    }

    #[inline]
    #[must_use]
    pub const fn writable(&self) -> bool {
        self.flags.read_write()
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> usize {
        (self.length / PAGE_SIZE) as usize
    }

    /// Index into the memory object of the page holding `va`.
    #[inline]
    #[must_use]
    pub const fn object_page(&self, va: VirtualAddress) -> usize {
        ((self.offset + (va.as_u64() - self.base.as_u64())) / PAGE_SIZE) as usize
    }

    /// Whether an access of this kind is allowed by the mapping.
    #[must_use]
    pub const fn permits(&self, access: Access) -> bool {
        match access {
            Access::Read => true,
            Access::Write => self.flags.read_write(),
            Access::Execute => self.flags.read_execute(),
        }
    }
}

impl core::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mapping")
            .field("base", &self.base)
            .field("length", &format_args!("{:#x}", self.length))
            .field("kind", &self.memory.kind())
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("flags", &self.flags)
            .finish()
    }
}

pub struct AddressSpace {
    pmm: Arc<PhysicalAllocator>,
    root: PhysicalPage,
    shootdown: Arc<dyn TlbShootdown>,
    mappings: SpinLock<BTreeMap<VirtualAddress, Mapping>>,
}

impl AddressSpace {
    /// The kernel space: an empty tree whose upper half later spaces share.
    ///
    /// # Errors
    /// If no frame is left for the root.
    pub fn kernel(
        pmm: Arc<PhysicalAllocator>,
        shootdown: Arc<dyn TlbShootdown>,
    ) -> Result<Self, MapError> {
        let root = pmm.try_allocate_zeroed()?;
        log::info!("kernel address space root at {root}");
        Ok(Self {
            pmm,
            root,
            shootdown,
            mappings: SpinLock::new(BTreeMap::new()),
        })
    }

    /// A fresh user space sharing `kernel`'s upper half.
    ///
    /// # Errors
    /// If no frame is left for the root.
    pub fn create(kernel: &Self) -> Result<Self, MapError> {
        let root = kernel.pmm.try_allocate_zeroed()?;
        let src = kernel.walker();
        let dst = PageTableWalker::new(&kernel.pmm, root);
        for i in KERNEL_PML4_START..ENTRIES {
            dst.write_entry(root, i, src.read_entry(kernel.root, i));
        }
        log::debug!("created address space {root}");
        Ok(Self {
            pmm: Arc::clone(&kernel.pmm),
            root,
            shootdown: Arc::clone(&kernel.shootdown),
            mappings: SpinLock::new(BTreeMap::new()),
        })
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        self.root
    }

    #[inline]
    #[must_use]
    pub fn allocator(&self) -> &Arc<PhysicalAllocator> {
        &self.pmm
    }

    #[inline]
    fn walker(&self) -> PageTableWalker<'_> {
        PageTableWalker::new(&self.pmm, self.root)
    }

    /// Snapshot of all mappings in address order.
    #[must_use]
    pub fn mappings(&self) -> Vec<Mapping> {
        self.mappings.with_lock_irq(|m| m.values().cloned().collect())
    }

    /// The mapping containing `va`, if any.
    #[must_use]
    pub fn mapping_at(&self, va: VirtualAddress) -> Option<Mapping> {
        self.mappings.with_lock_irq(|m| find(m, va).cloned())
    }

    /// Map `length` bytes of `memory` starting at byte `offset`.
    ///
    /// With `fixed`, the mapping is placed at `hint`; otherwise the first
    /// (`prefer_top`: last) free gap in `[USER_BASE, USER_TOP)` is used.
    ///
    /// # Errors
    /// See [`MapError`].
    pub fn map(
        &self,
        memory: Arc<MemoryObject>,
        hint: VirtualAddress,
        offset: u64,
        length: u64,
        flags: MapFlags,
    ) -> Result<VirtualAddress, MapError> {
        match (flags.read_write(), flags.read_execute()) {
            (true, true) => return Err(MapError::WriteExecute),
            (false, false) => return Err(MapError::NoPermission),
            _ => {}
        }
        if length == 0 || offset % PAGE_SIZE != 0 || length % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if flags.fixed() && !hint.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        match offset.checked_add(length) {
            Some(end) if end <= memory.length() => {}
            _ => return Err(MapError::OutOfRange),
        }

        let mut mappings = self.mappings.lock_irq();
        let base = if flags.fixed() {
            let end = hint.as_u64().checked_add(length).ok_or(MapError::OutOfRange)?;
            if hint.as_u64() < USER_BASE || end > USER_TOP {
                return Err(MapError::OutOfRange);
            }
            if overlaps(&mappings, hint.as_u64(), end) {
                return Err(MapError::Overlap);
            }
            hint
        } else if flags.prefer_top() {
            find_gap_top_down(&mappings, length).ok_or(MapError::NoSpace)?
        } else {
            find_gap_bottom_up(&mappings, length).ok_or(MapError::NoSpace)?
        };

        log::debug!(
            "map {base}+{length:#x} -> {:?} @ {offset:#x} ({})",
            memory.kind(),
            if flags.read_write() { "rw" } else { "rx" }
        );
        mappings.insert(
            base,
            Mapping {
                base,
                length,
                memory,
                offset,
                flags,
            },
        );
        Ok(base)
    }

    /// Remove the mapping that starts at `address` and spans exactly `length`.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if no such mapping exists.
    pub fn unmap(&self, address: VirtualAddress, length: u64) -> Result<(), MapError> {
        let removed = {
            let mut mappings = self.mappings.lock_irq();
            match mappings.get(&address) {
                Some(m) if m.length == length => {}
                _ => return Err(MapError::NotMapped),
            }
            let Some(removed) = mappings.remove(&address) else {
                return Err(MapError::NotMapped);
            };
            let walker = self.walker();
            for i in 0..removed.pages() {
                let _ = walker.clear_leaf(address + i as u64 * PAGE_SIZE);
            }
            removed
        };
        self.shootdown.shootdown(self.root, address, removed.pages());
        log::debug!("unmapped {address}+{length:#x}");
        // dropping `removed` releases the memory object reference
        drop(removed);
        Ok(())
    }

    /// Resolve a fault at `address` with hardware error code `flags`.
    ///
    /// Returns `false` if no mapping covers the address, the access violates
    /// the mapping's permission, or the page cannot be populated.
    pub fn handle_fault(&self, address: VirtualAddress, flags: PageFaultError) -> bool {
        let mappings = self.mappings.lock_irq();
        let Some(mapping) = find(&mappings, address) else {
            log::debug!("fault at {address}: no mapping");
            return false;
        };
        let access = flags.access();
        if !mapping.permits(access) {
            log::debug!("fault at {address}: {access:?} denied by mapping");
            return false;
        }

        let frame = match mapping.memory.ensure_page(mapping.object_page(address)) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("fault at {address}: {e}");
                return false;
            }
        };
        let rw = mapping.writable();
        match self
            .walker()
            .set_leaf(address.page().base(), PageTableEntry::leaf(frame, rw, rw))
        {
            Ok(()) => {
                log::trace!("fault at {address} resolved to {frame}");
                true
            }
            Err(e) => {
                log::warn!("fault at {address}: page table allocation failed: {e}");
                false
            }
        }
    }

    /// MMU emulation of a user-mode access.
    ///
    /// # Errors
    /// The page-fault error code the hardware would raise.
    pub fn translate(&self, address: VirtualAddress, access: Access) -> Result<PhysicalAddress, PageFaultError> {
        let _g = self.mappings.lock_irq();
        self.walker().translate(address, access)
    }

    /// The memory object and byte offset behind `va`, if the mapping allows
    /// `access`. The returned reference keeps the backing alive even if the
    /// range is unmapped afterwards.
    ///
    /// # Errors
    /// [`MapError::Fault`] if no mapping covers `va` or it forbids `access`.
    pub fn resolve(&self, va: VirtualAddress, access: Access) -> Result<(Arc<MemoryObject>, u64), MapError> {
        self.mappings.with_lock_irq(|mappings| {
            let mapping = find(mappings, va)
                .filter(|m| m.permits(access))
                .ok_or(MapError::Fault(va))?;
            let offset = mapping.offset + (va.as_u64() - mapping.base.as_u64());
            Ok((Arc::clone(&mapping.memory), offset))
        })
    }

    /// Write `data` to user memory at `address`, populating pages as needed.
    ///
    /// # Errors
    /// [`MapError::Fault`] at the first address that cannot be written.
    pub fn copy_to_user(&self, address: VirtualAddress, data: &[u8]) -> Result<(), MapError> {
        self.for_each_user_chunk(address, data.len(), Access::Write, |memory, offset, done, n| {
            memory.copy_into(offset, &data[done..done + n])
        })
    }

    /// Read user memory at `address` into `buf`. Untouched on-demand pages
    /// read as zero.
    ///
    /// # Errors
    /// [`MapError::Fault`] at the first address that cannot be read.
    pub fn copy_from_user(&self, address: VirtualAddress, buf: &mut [u8]) -> Result<(), MapError> {
        self.for_each_user_chunk(address, buf.len(), Access::Read, |memory, offset, done, n| {
            memory.copy_out(offset, &mut buf[done..done + n])
        })
    }

    /// Calls `f(memory, offset, done, n)` for each in-page chunk of
    /// `[address, address + len)`, going through the memory object rather
    /// than the page tables.
    fn for_each_user_chunk(
        &self,
        address: VirtualAddress,
        len: usize,
        access: Access,
        mut f: impl FnMut(&MemoryObject, u64, usize, usize) -> Result<(), MemoryError>,
    ) -> Result<(), MapError> {
        let mut done = 0usize;
        while done < len {
            let va = address
                .checked_add(done as u64)
                .ok_or(MapError::Fault(address))?;
            let (memory, offset) = self.resolve(va, access)?;
            let n = ((PAGE_SIZE - va.offset()) as usize).min(len - done);
            f(&memory, offset, done, n).map_err(|e| {
                log::debug!("user copy at {va}: {e}");
                MapError::Fault(va)
            })?;
            done += n;
        }
        Ok(())
    }

    /// A new space with the same mappings.
    ///
    /// `share_on_fork` mappings and Physical objects are shared; every other
    /// mapping gets a private copy of its memory object. No translations are
    /// copied; the child faults its pages in.
    ///
    /// # Errors
    /// Frame exhaustion while copying.
    pub fn fork(&self) -> Result<Self, MapError> {
        let child = Self::create(self)?;
        let parent = self.mappings();
        let mut copies: BTreeMap<usize, Arc<MemoryObject>> = BTreeMap::new();
        let mut forked = BTreeMap::new();
        for m in parent {
            let memory = if m.flags.share_on_fork() || m.memory.kind() == MemoryKind::Physical {
                Arc::clone(&m.memory)
            } else {
                // mappings of one object stay aliased in the child
                let key = Arc::as_ptr(&m.memory) as usize;
                match copies.get(&key) {
                    Some(copy) => Arc::clone(copy),
                    None => {
                        let copy = Arc::new(m.memory.duplicate()?);
                        copies.insert(key, Arc::clone(&copy));
                        copy
                    }
                }
            };
            forked.insert(m.base, Mapping { memory, ..m });
        }
        *child.mappings.lock_irq() = forked;
        log::debug!("forked {} into {}", self.root, child.root);
        Ok(child)
    }

    /// Verify that mappings do not overlap and every present user entry
    /// matches its mapping's frame and permission.
    ///
    /// # Errors
    /// The first violation found.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        let mappings = self.mappings.lock_irq();
        let mut prev: Option<&Mapping> = None;
        for m in mappings.values() {
            if let Some(p) = prev
                && p.end() > m.base.as_u64()
            {
                return Err(InvariantError::Overlap(p.base, m.base));
            }
            prev = Some(m);
        }

        let mut result = Ok(());
        self.walker().for_each_user_leaf(|page, entry| {
            if result.is_err() {
                return;
            }
            let Some(m) = find(&mappings, page.base()) else {
                result = Err(InvariantError::Orphan(page));
                return;
            };
            if m.memory.page_at(m.object_page(page.base())) != Some(entry.frame()) {
                result = Err(InvariantError::FrameMismatch(page));
            } else if !entry.user() || entry.writable() != m.writable() || entry.no_execute() != m.writable() {
                result = Err(InvariantError::PermissionMismatch(page));
            }
        });
        result
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let freed = self.walker().free_user_tables();
        self.pmm.free(self.root);
        log::debug!("address space {} dropped ({} table frames)", self.root, freed + 1);
    }
}

fn find(mappings: &BTreeMap<VirtualAddress, Mapping>, va: VirtualAddress) -> Option<&Mapping> {
    mappings
        .range(..=va)
        .next_back()
        .map(|(_, m)| m)
        .filter(|m| m.contains(va))
}

fn overlaps(mappings: &BTreeMap<VirtualAddress, Mapping>, start: u64, end: u64) -> bool {
    mappings
        .values()
        .any(|m| m.base.as_u64() < end && start < m.end())
}

fn find_gap_bottom_up(mappings: &BTreeMap<VirtualAddress, Mapping>, length: u64) -> Option<VirtualAddress> {
    let mut cursor = USER_BASE;
    for m in mappings.values() {
        if m.base.as_u64() >= cursor && m.base.as_u64() - cursor >= length {
            return Some(VirtualAddress::new(cursor));
        }
        cursor = cursor.max(m.end());
    }
    (USER_TOP.saturating_sub(cursor) >= length).then(|| VirtualAddress::new(cursor))
}

fn find_gap_top_down(mappings: &BTreeMap<VirtualAddress, Mapping>, length: u64) -> Option<VirtualAddress> {
    let mut cursor = USER_TOP;
    for m in mappings.values().rev() {
        if m.end() <= cursor && cursor - m.end() >= length {
            return Some(VirtualAddress::new(cursor - length));
        }
        cursor = cursor.min(m.base.as_u64());
    }
    (cursor.saturating_sub(USER_BASE) >= length).then(|| VirtualAddress::new(cursor - length))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(frames: usize) -> (Arc<PhysicalAllocator>, AddressSpace) {
        let pmm = Arc::new(PhysicalAllocator::hosted(PhysicalAddress::new(0x100_0000), frames));
        let kernel = AddressSpace::kernel(Arc::clone(&pmm), Arc::new(NoShootdown)).unwrap();
        let space = AddressSpace::create(&kernel).unwrap();
        (pmm, space)
    }

    fn rw() -> MapFlags {
        MapFlags::new().with_read_write(true)
    }

    fn demand(pmm: &Arc<PhysicalAllocator>, pages: usize) -> Arc<MemoryObject> {
        Arc::new(MemoryObject::on_demand(Arc::clone(pmm), pages))
    }

    #[test]
    fn permission_combinations_are_checked() {
        let (pmm, space) = setup(16);
        let m = demand(&pmm, 1);
        let both = MapFlags::new().with_read_write(true).with_read_execute(true);
        assert_eq!(
            space.map(Arc::clone(&m), VirtualAddress::zero(), 0, PAGE_SIZE, both),
            Err(MapError::WriteExecute)
        );
        assert_eq!(
            space.map(m, VirtualAddress::zero(), 0, PAGE_SIZE, MapFlags::new()),
            Err(MapError::NoPermission)
        );
    }

    #[test]
    fn placement_bottom_up_and_top_down() {
        let (pmm, space) = setup(16);
        let a = space.map(demand(&pmm, 2), VirtualAddress::zero(), 0, 2 * PAGE_SIZE, rw()).unwrap();
        let b = space.map(demand(&pmm, 1), VirtualAddress::zero(), 0, PAGE_SIZE, rw()).unwrap();
        assert_eq!(a.as_u64(), USER_BASE);
        assert_eq!(b.as_u64(), USER_BASE + 2 * PAGE_SIZE);

        let top = space
            .map(demand(&pmm, 16), VirtualAddress::zero(), 0, 16 * PAGE_SIZE, rw().with_prefer_top(true))
            .unwrap();
        assert_eq!(top.as_u64(), USER_TOP - 16 * PAGE_SIZE);

        // the hole left by `a` is reused first
        space.unmap(a, 2 * PAGE_SIZE).unwrap();
        let c = space.map(demand(&pmm, 1), VirtualAddress::zero(), 0, PAGE_SIZE, rw()).unwrap();
        assert_eq!(c.as_u64(), USER_BASE);
        space.check_invariants().unwrap();
    }

    #[test]
    fn fixed_mappings_reject_overlap_and_kernel_half() {
        let (pmm, space) = setup(16);
        let at = VirtualAddress::new(0x40_0000);
        space.map(demand(&pmm, 2), at, 0, 2 * PAGE_SIZE, rw().with_fixed(true)).unwrap();
        assert_eq!(
            space.map(demand(&pmm, 1), at + PAGE_SIZE, 0, PAGE_SIZE, rw().with_fixed(true)),
            Err(MapError::Overlap)
        );
        assert_eq!(
            space.map(
                demand(&pmm, 1),
                VirtualAddress::new(0xFFFF_8000_0000_0000),
                0,
                PAGE_SIZE,
                rw().with_fixed(true)
            ),
            Err(MapError::OutOfRange)
        );
        assert_eq!(
            space.map(demand(&pmm, 1), at, 0, 2 * PAGE_SIZE, rw()),
            Err(MapError::OutOfRange),
            "length exceeds the object"
        );
    }

    #[test]
    fn unmap_requires_an_exact_mapping() {
        let (pmm, space) = setup(16);
        let at = space.map(demand(&pmm, 2), VirtualAddress::zero(), 0, 2 * PAGE_SIZE, rw()).unwrap();
        assert_eq!(space.unmap(at, PAGE_SIZE), Err(MapError::NotMapped));
        assert_eq!(space.unmap(at + PAGE_SIZE, PAGE_SIZE), Err(MapError::NotMapped));
        assert_eq!(space.unmap(at, 2 * PAGE_SIZE), Ok(()));
        assert_eq!(space.unmap(at, 2 * PAGE_SIZE), Err(MapError::NotMapped));
    }

    #[test]
    fn execute_fault_on_read_write_mapping_is_unresolved() {
        let (pmm, space) = setup(16);
        let at = space.map(demand(&pmm, 1), VirtualAddress::zero(), 0, PAGE_SIZE, rw()).unwrap();
        let fetch = PageFaultError::for_access(Access::Execute, false);
        assert!(!space.handle_fault(at, fetch));
        assert!(space.handle_fault(at, PageFaultError::for_access(Access::Read, false)));
        // NX is installed for writable pages
        assert_eq!(space.translate(at, Access::Execute), Err(PageFaultError::for_access(Access::Execute, true)));
    }

    #[test]
    fn copy_to_and_from_user_populate_the_object() {
        let (pmm, space) = setup(32);
        let at = space.map(demand(&pmm, 3), VirtualAddress::zero(), 0, 3 * PAGE_SIZE, rw()).unwrap();
        let msg = [0xABu8; 5000];
        space.copy_to_user(at + 100, &msg).unwrap();

        let mut back = [0u8; 5000];
        space.copy_from_user(at + 100, &mut back).unwrap();
        assert_eq!(back, msg);
        space.check_invariants().unwrap();

        assert_eq!(
            space.copy_from_user(at + 3 * PAGE_SIZE, &mut back[..1]),
            Err(MapError::Fault(at + 3 * PAGE_SIZE))
        );
    }

    #[test]
    fn resolved_objects_outlive_an_unmap() {
        let (pmm, space) = setup(32);
        let baseline = pmm.num_used_pages();
        let at = space.map(demand(&pmm, 1), VirtualAddress::zero(), 0, PAGE_SIZE, rw()).unwrap();
        space.copy_to_user(at, b"early").unwrap();

        let (memory, offset) = space.resolve(at + 8, Access::Write).unwrap();
        assert_eq!(offset, 8);
        space.unmap(at, PAGE_SIZE).unwrap();
        assert_eq!(space.resolve(at, Access::Read).map(|_| ()), Err(MapError::Fault(at)));

        // the frame stays with the object until the last reference goes
        memory.copy_into(offset, b"late").unwrap();
        let fresh = pmm.try_allocate(PAGE_SIZE).unwrap();
        pmm.write(fresh.join(offset), b"xxxx");
        let mut back = [0u8; 4];
        memory.copy_out(offset, &mut back).unwrap();
        assert_eq!(&back, b"late");
        pmm.free(fresh);

        drop(memory);
        assert_eq!(pmm.num_used_pages(), baseline);
        assert_eq!(space.copy_to_user(at, b"gone"), Err(MapError::Fault(at)));
    }

    #[test]
    fn resolve_honours_mapping_permissions() {
        let (pmm, space) = setup(16);
        let rx = MapFlags::new().with_read_execute(true);
        let at = space.map(demand(&pmm, 1), VirtualAddress::zero(), 0, PAGE_SIZE, rx).unwrap();
        assert!(space.resolve(at, Access::Read).is_ok());
        assert_eq!(space.resolve(at, Access::Write).map(|_| ()), Err(MapError::Fault(at)));
    }

    #[test]
    fn fork_copies_private_and_shares_marked_mappings() {
        let (pmm, space) = setup(64);
        let private = space.map(demand(&pmm, 1), VirtualAddress::zero(), 0, PAGE_SIZE, rw()).unwrap();
        let shared = space
            .map(demand(&pmm, 1), VirtualAddress::zero(), 0, PAGE_SIZE, rw().with_share_on_fork(true))
            .unwrap();
        space.copy_to_user(private, b"before").unwrap();
        space.copy_to_user(shared, b"before").unwrap();

        let child = space.fork().unwrap();
        child.copy_to_user(private, b"child!").unwrap();
        child.copy_to_user(shared, b"child!").unwrap();

        let mut buf = [0u8; 6];
        space.copy_from_user(private, &mut buf).unwrap();
        assert_eq!(&buf, b"before");
        space.copy_from_user(shared, &mut buf).unwrap();
        assert_eq!(&buf, b"child!");
        child.check_invariants().unwrap();
    }

    #[test]
    fn dropping_a_space_returns_all_frames() {
        let pmm = Arc::new(PhysicalAllocator::hosted(PhysicalAddress::new(0x100_0000), 32));
        let kernel = AddressSpace::kernel(Arc::clone(&pmm), Arc::new(NoShootdown)).unwrap();
        let baseline = pmm.num_used_pages();
        {
            let space = AddressSpace::create(&kernel).unwrap();
            let at = space.map(demand(&pmm, 2), VirtualAddress::zero(), 0, 2 * PAGE_SIZE, rw()).unwrap();
            space.copy_to_user(at, &[1u8; 8192]).unwrap();
            assert!(pmm.num_used_pages() > baseline);
        }
        assert_eq!(pmm.num_used_pages(), baseline);
    }
}
