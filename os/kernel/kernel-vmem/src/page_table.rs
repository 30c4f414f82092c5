//! # x86-64 page tables
//!
//! - [`PageTableEntry`]: one 64-bit entry, valid at every level for the
//!   4 KiB-only layout used here (`PS` is always 0).
//! - [`PageTableWalker`]: reads, creates and clears entries of one tree rooted
//!   at a PML4 frame. Table frames are reached through the frame allocator's
//!   mapper; nothing here dereferences a physical address directly.
//!
//! ## Invariants & Notes
//!
//! - Table frames come from the [`PhysicalAllocator`] and are zeroed before
//!   they are linked.
//! - Non-leaf entries in the user half are `present | writable | user`;
//!   effective permissions are decided by the leaf.
//! - After modifying active mappings, the caller performs TLB maintenance.

use bitfield_struct::bitfield;
use kernel_alloc::{FrameAllocError, PhysicalAllocator};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};

use crate::fault::{Access, PageFaultError};

/// Entries per table.
pub const ENTRIES: usize = 512;

/// First PML4 slot of the kernel half.
pub const KERNEL_PML4_START: usize = 256;

/// One page-table entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// **Present** (P): valid entry if `true`.
    pub present: bool,
    /// **Writable** (RW).
    pub writable: bool,
    /// **User/Supervisor** (US): user-mode access if `true`.
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    /// Set by the CPU on first access.
    pub accessed: bool,
    /// Set by the CPU on first write (leaf only).
    pub dirty: bool,
    /// **PS**; always `false` in this kernel.
    pub large_page: bool,
    pub global: bool,
    #[bits(3)]
    pub os_low: u8,
    /// Physical frame number (bits 12..52).
    #[bits(40)]
    pub frame_number: u64,
    #[bits(11)]
    pub os_high: u16,
    /// **Execute Disable** / NX.
    pub no_execute: bool,
}

impl PageTableEntry {
    /// A present user leaf for `frame`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage, writable: bool, no_execute: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_user(true)
            .with_writable(writable)
            .with_no_execute(no_execute)
            .with_frame_number(frame.frame_number())
    }

    /// A non-leaf entry pointing to the table in `frame`.
    #[inline]
    #[must_use]
    pub const fn table(frame: PhysicalPage, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_frame_number(frame.frame_number())
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage {
        PhysicalPage::from_frame_number(self.frame_number())
    }
}

/// The four table indices of `va`, PML4 first.
#[inline]
#[must_use]
pub const fn indices(va: VirtualAddress) -> [usize; 4] {
    let v = va.as_u64();
    [
        ((v >> 39) & 0x1FF) as usize,
        ((v >> 30) & 0x1FF) as usize,
        ((v >> 21) & 0x1FF) as usize,
        ((v >> 12) & 0x1FF) as usize,
    ]
}

/// Rebuild a canonical address from four table indices.
#[must_use]
pub const fn from_indices(l4: usize, l3: usize, l2: usize, l1: usize) -> VirtualAddress {
    let mut v = ((l4 as u64) << 39) | ((l3 as u64) << 30) | ((l2 as u64) << 21) | ((l1 as u64) << 12);
    if l4 >= KERNEL_PML4_START {
        v |= 0xFFFF_0000_0000_0000;
    }
    VirtualAddress::new(v)
}

/// Software view of one page-table tree.
#[derive(Clone, Copy)]
pub struct PageTableWalker<'a> {
    pmm: &'a PhysicalAllocator,
    root: PhysicalPage,
}

impl<'a> PageTableWalker<'a> {
    #[must_use]
    pub const fn new(pmm: &'a PhysicalAllocator, root: PhysicalPage) -> Self {
        Self { pmm, root }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        self.root
    }

    #[inline]
    #[must_use]
    pub fn read_entry(&self, table: PhysicalPage, index: usize) -> PageTableEntry {
        PageTableEntry::from_bits(self.pmm.read_u64(entry_addr(table, index)))
    }

    #[inline]
    pub fn write_entry(&self, table: PhysicalPage, index: usize, entry: PageTableEntry) {
        self.pmm.write_u64(entry_addr(table, index), entry.into_bits());
    }

    /// The leaf entry for `va`, or `None` if an intermediate table is missing.
    #[must_use]
    pub fn leaf(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let idx = indices(va);
        let mut table = self.root;
        for &i in &idx[..3] {
            let e = self.read_entry(table, i);
            if !e.present() {
                return None;
            }
            table = e.frame();
        }
        Some(self.read_entry(table, idx[3]))
    }

    /// Install `entry` as the leaf for `va`, creating missing tables.
    ///
    /// # Errors
    /// When a table frame cannot be allocated; the tree is left valid.
    pub fn set_leaf(&self, va: VirtualAddress, entry: PageTableEntry) -> Result<(), FrameAllocError> {
        let idx = indices(va);
        let user = idx[0] < KERNEL_PML4_START;
        let mut table = self.root;
        for &i in &idx[..3] {
            let e = self.read_entry(table, i);
            table = if e.present() {
                e.frame()
            } else {
                let next = self.pmm.try_allocate_zeroed()?;
                self.write_entry(table, i, PageTableEntry::table(next, user));
                next
            };
        }
        self.write_entry(table, idx[3], entry);
        Ok(())
    }

    /// Clear the leaf for `va`, returning the previous entry if it was present.
    pub fn clear_leaf(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let idx = indices(va);
        let mut table = self.root;
        for &i in &idx[..3] {
            let e = self.read_entry(table, i);
            if !e.present() {
                return None;
            }
            table = e.frame();
        }
        let old = self.read_entry(table, idx[3]);
        if !old.present() {
            return None;
        }
        self.write_entry(table, idx[3], PageTableEntry::new());
        Some(old)
    }

    /// MMU emulation of a user-mode `access` to `va`.
    ///
    /// # Errors
    /// The x86 page-fault error code the hardware would push.
    pub fn translate(&self, va: VirtualAddress, access: Access) -> Result<PhysicalAddress, PageFaultError> {
        let not_present = PageFaultError::for_access(access, false);
        if !va.is_canonical() {
            return Err(not_present);
        }
        let idx = indices(va);
        let mut table = self.root;
        let mut writable = true;
        let mut user = true;
        let mut no_execute = false;
        for (level, &i) in idx.iter().enumerate() {
            let e = self.read_entry(table, i);
            if !e.present() {
                return Err(not_present);
            }
            writable &= e.writable();
            user &= e.user();
            no_execute |= e.no_execute();
            if level == 3 {
                let violation = !user
                    || (access == Access::Write && !writable)
                    || (access == Access::Execute && no_execute);
                if violation {
                    return Err(PageFaultError::for_access(access, true));
                }
                return Ok(e.frame().join(va.offset()));
            }
            table = e.frame();
        }
        Err(not_present)
    }

    /// Visit every present leaf in PML4 slots `0..256`.
    pub fn for_each_user_leaf(&self, mut f: impl FnMut(VirtualPage, PageTableEntry)) {
        for l4 in 0..KERNEL_PML4_START {
            let e4 = self.read_entry(self.root, l4);
            if !e4.present() {
                continue;
            }
            for l3 in 0..ENTRIES {
                let e3 = self.read_entry(e4.frame(), l3);
                if !e3.present() {
                    continue;
                }
                for l2 in 0..ENTRIES {
                    let e2 = self.read_entry(e3.frame(), l2);
                    if !e2.present() {
                        continue;
                    }
                    for l1 in 0..ENTRIES {
                        let e1 = self.read_entry(e2.frame(), l1);
                        if e1.present() {
                            f(from_indices(l4, l3, l2, l1).page(), e1);
                        }
                    }
                }
            }
        }
    }

    /// Free every table frame below PML4 slots `0..256` and clear those slots.
    ///
    /// Leaf frames are not touched; they belong to memory objects.
    pub fn free_user_tables(&self) -> usize {
        let mut freed = 0;
        for l4 in 0..KERNEL_PML4_START {
            let e4 = self.read_entry(self.root, l4);
            if !e4.present() {
                continue;
            }
            let pdpt = e4.frame();
            for l3 in 0..ENTRIES {
                let e3 = self.read_entry(pdpt, l3);
                if !e3.present() {
                    continue;
                }
                let pd = e3.frame();
                for l2 in 0..ENTRIES {
                    let e2 = self.read_entry(pd, l2);
                    if e2.present() {
                        self.pmm.free(e2.frame());
                        freed += 1;
                    }
                }
                self.pmm.free(pd);
                freed += 1;
            }
            self.pmm.free(pdpt);
            freed += 1;
            self.write_entry(self.root, l4, PageTableEntry::new());
        }
        freed
    }
}

#[inline]
fn entry_addr(table: PhysicalPage, index: usize) -> PhysicalAddress {
    debug_assert!(index < ENTRIES);
    table.join(index as u64 * (PAGE_SIZE / ENTRIES as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> PhysicalAllocator {
        PhysicalAllocator::hosted(PhysicalAddress::new(0x10_0000), 64)
    }

    #[test]
    fn entry_layout_matches_hardware() {
        let frame = PhysicalAddress::new(0x1234_5000).page();
        let e = PageTableEntry::leaf(frame, true, true);
        assert_eq!(e.into_bits(), 0x8000_0000_1234_5007);
        assert_eq!(e.frame(), frame);
        let t = PageTableEntry::table(frame, false);
        assert_eq!(t.into_bits(), 0x1234_5003);
    }

    #[test]
    fn indices_round_trip() {
        let va = VirtualAddress::new(0x0000_7F12_3456_7000);
        let [a, b, c, d] = indices(va);
        assert_eq!(from_indices(a, b, c, d), va);
        let high = VirtualAddress::new(0xFFFF_8000_0020_1000);
        let [a, b, c, d] = indices(high);
        assert_eq!(from_indices(a, b, c, d), high);
    }

    #[test]
    fn set_translate_clear() {
        let pmm = pool();
        let root = pmm.try_allocate_zeroed().unwrap();
        let w = PageTableWalker::new(&pmm, root);
        let va = VirtualAddress::new(0x40_0123);
        let frame = pmm.allocate(PAGE_SIZE);

        assert_eq!(
            w.translate(va, Access::Read),
            Err(PageFaultError::for_access(Access::Read, false))
        );
        w.set_leaf(va, PageTableEntry::leaf(frame, false, false)).unwrap();
        // root + pdpt + pd + pt + leaf frame
        assert_eq!(pmm.num_used_pages(), 5);

        assert_eq!(w.translate(va, Access::Read), Ok(frame.join(0x123)));
        assert_eq!(w.translate(va, Access::Execute), Ok(frame.join(0x123)));
        assert_eq!(
            w.translate(va, Access::Write),
            Err(PageFaultError::for_access(Access::Write, true))
        );

        let mut leaves = 0;
        w.for_each_user_leaf(|page, e| {
            assert_eq!(page.base().as_u64(), 0x40_0000);
            assert_eq!(e.frame(), frame);
            leaves += 1;
        });
        assert_eq!(leaves, 1);

        assert!(w.clear_leaf(va).is_some());
        assert!(w.clear_leaf(va).is_none());
        assert_eq!(w.free_user_tables(), 3);
        assert_eq!(pmm.num_used_pages(), 2);
    }
}
