use kernel_alloc::{FrameAllocError, PhysicalAllocator};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

const FRAMES: usize = 256;

fn pool() -> Arc<PhysicalAllocator> {
    Arc::new(PhysicalAllocator::hosted(PhysicalAddress::new(0x100_0000), FRAMES))
}

#[test]
fn used_pages_track_outstanding_allocations() {
    let pmm = pool();
    let mut held = Vec::new();
    for round in 0..10 {
        for _ in 0..7 {
            held.push(pmm.allocate(PAGE_SIZE));
        }
        for _ in 0..(round % 4) {
            pmm.free(held.pop().unwrap());
        }
        assert_eq!(pmm.num_used_pages(), held.len());
        assert_eq!(pmm.num_used_pages() + pmm.num_free_pages(), FRAMES);
    }
}

#[test]
fn overcommit_fails_cleanly() {
    let pmm = pool();
    let mut got = 0;
    loop {
        match pmm.try_allocate(PAGE_SIZE) {
            Ok(_) => got += 1,
            Err(e) => {
                assert_eq!(e, FrameAllocError::OutOfMemory);
                break;
            }
        }
    }
    assert_eq!(got, FRAMES);
    assert_eq!(pmm.num_free_pages(), 0);
}

#[test]
fn concurrent_allocations_never_alias() {
    let threads = 8;
    let per_thread = FRAMES / threads;
    let pmm = pool();
    let start = Arc::new(Barrier::new(threads));
    let all = Arc::new(Mutex::new(HashSet::new()));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let pmm = Arc::clone(&pmm);
            let start = Arc::clone(&start);
            let all = Arc::clone(&all);
            thread::spawn(move || {
                start.wait();
                let mut mine = Vec::new();
                for i in 0..per_thread * 4 {
                    mine.push(pmm.allocate(PAGE_SIZE));
                    if i % 4 != 3 {
                        pmm.free(mine.pop().unwrap());
                    }
                }
                let mut all = all.lock().unwrap();
                for f in mine {
                    assert!(all.insert(f), "frame {f} allocated twice");
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(pmm.num_used_pages(), threads * per_thread);
    assert_eq!(all.lock().unwrap().len(), threads * per_thread);
}
