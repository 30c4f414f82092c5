use kernel_alloc::PhysicalAllocator;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{
    Access, AddressSpace, MapFlags, MemoryObject, NoShootdown, PageFaultError, TlbShootdown,
};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingShootdown {
    calls: Mutex<Vec<(VirtualAddress, usize)>>,
}

impl TlbShootdown for RecordingShootdown {
    fn shootdown(&self, _root: kernel_memory_addresses::PhysicalPage, base: VirtualAddress, pages: usize) {
        self.calls.lock().unwrap().push((base, pages));
    }
}

fn pool(frames: usize) -> Arc<PhysicalAllocator> {
    Arc::new(PhysicalAllocator::hosted(PhysicalAddress::new(0x200_0000), frames))
}

/// Touch `va` the way a user thread would: translate, fault, retry.
fn touch(space: &AddressSpace, va: VirtualAddress, access: Access) -> Result<PhysicalAddress, PageFaultError> {
    match space.translate(va, access) {
        Ok(pa) => Ok(pa),
        Err(code) if space.handle_fault(va, code) => space.translate(va, access),
        Err(code) => Err(code),
    }
}

#[test]
fn on_demand_mapping_lifecycle() {
    let pmm = pool(64);
    let shootdown = Arc::new(RecordingShootdown::default());
    let kernel = AddressSpace::kernel(Arc::clone(&pmm), shootdown.clone()).unwrap();
    let space = AddressSpace::create(&kernel).unwrap();

    let memory = Arc::new(MemoryObject::on_demand(Arc::clone(&pmm), 3));
    let base = VirtualAddress::new(0x10_0000_0000);
    let flags = MapFlags::new().with_fixed(true).with_read_write(true);
    assert_eq!(space.map(Arc::clone(&memory), base, 0, 3 * PAGE_SIZE, flags), Ok(base));

    // touching page 2 populates exactly one frame
    let page2 = base + 2 * PAGE_SIZE;
    assert!(space.translate(page2, Access::Read).is_err());
    let pa = touch(&space, page2 + 8, Access::Read).unwrap();
    assert_eq!(memory.present_pages(), 1);
    assert_eq!(pmm.read_u64(pa), 0, "fresh page reads as zero");

    let mut word = [0u8; 8];
    space.copy_to_user(page2 + 8, &42u64.to_le_bytes()).unwrap();
    space.copy_from_user(page2 + 8, &mut word).unwrap();
    assert_eq!(u64::from_le_bytes(word), 42);

    touch(&space, base, Access::Write).unwrap();
    touch(&space, base + PAGE_SIZE, Access::Write).unwrap();
    assert_eq!(memory.present_pages(), 3);
    space.check_invariants().unwrap();

    drop(memory);
    let before = pmm.num_used_pages();
    space.unmap(base, 3 * PAGE_SIZE).unwrap();
    assert_eq!(before - pmm.num_used_pages(), 3);
    assert_eq!(*shootdown.calls.lock().unwrap(), vec![(base, 3)]);
    space.check_invariants().unwrap();
}

#[test]
fn write_faults_inside_read_execute_mappings_never_resolve() {
    let pmm = pool(64);
    let kernel = AddressSpace::kernel(Arc::clone(&pmm), Arc::new(NoShootdown)).unwrap();
    let space = AddressSpace::create(&kernel).unwrap();
    let memory = Arc::new(MemoryObject::allocated(Arc::clone(&pmm), 4).unwrap());
    let base = space
        .map(memory, VirtualAddress::zero(), 0, 4 * PAGE_SIZE, MapFlags::new().with_read_execute(true))
        .unwrap();

    for offset in (0..4 * PAGE_SIZE).step_by(1000) {
        let va = base + offset;
        // not present yet, then present but read-only
        assert!(!space.handle_fault(va, PageFaultError::for_access(Access::Write, false)));
        touch(&space, va, Access::Execute).unwrap();
        assert!(!space.handle_fault(va, PageFaultError::for_access(Access::Write, true)));
        assert_eq!(
            space.translate(va, Access::Write),
            Err(PageFaultError::for_access(Access::Write, true))
        );
    }
    assert_eq!(
        space.copy_to_user(base, b"x"),
        Err(kernel_vmem::MapError::Fault(base))
    );
    space.check_invariants().unwrap();
}

#[test]
fn random_map_unmap_sequences_keep_invariants() {
    let pmm = pool(512);
    let kernel = AddressSpace::kernel(Arc::clone(&pmm), Arc::new(NoShootdown)).unwrap();
    let space = AddressSpace::create(&kernel).unwrap();

    // small deterministic LCG
    let mut seed = 0x2545_F491_4F6C_DD1Du64;
    let mut next = move || {
        seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        seed >> 33
    };

    let mut live: Vec<(VirtualAddress, u64)> = Vec::new();
    for _ in 0..200 {
        if live.is_empty() || next() % 3 != 0 {
            let pages = (next() % 4 + 1) as usize;
            let len = pages as u64 * PAGE_SIZE;
            let mut flags = MapFlags::new().with_read_write(true);
            flags.set_prefer_top(next() % 2 == 0);
            let mem = Arc::new(MemoryObject::on_demand(Arc::clone(&pmm), pages));
            let at = space.map(mem, VirtualAddress::zero(), 0, len, flags).unwrap();
            // populate a random page of the new mapping
            let target = at + (next() % pages as u64) * PAGE_SIZE;
            touch(&space, target, Access::Write).unwrap();
            live.push((at, len));
        } else {
            let victim = (next() as usize) % live.len();
            let (at, len) = live.swap_remove(victim);
            space.unmap(at, len).unwrap();
        }
        space.check_invariants().unwrap();
    }

    let mut ranges: Vec<_> = space.mappings().iter().map(|m| (m.base.as_u64(), m.end())).collect();
    ranges.sort_unstable();
    assert!(ranges.windows(2).all(|w| w[0].1 <= w[1].0));
    assert_eq!(ranges.len(), live.len());
}
