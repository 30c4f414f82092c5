mod common;

use common::{SCRATCH, call, call_err, hosted, run_next, spawn, write_user};
use kernel::Kernel;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_syscall::{DEBUG_MEMORY, Error, MAP_READ_WRITE, SUBSYSTEM_DEBUG, Sysno, ThreadFlags};

fn used_pages(kernel: &Kernel) -> u64 {
    call(kernel, 0, Sysno::ControlKernel, &[SUBSYSTEM_DEBUG, DEBUG_MEMORY]).0
}

/// The last frame of the pool; nothing in these tests gets that far.
fn spare_frame(kernel: &Kernel) -> u64 {
    let config = kernel.config();
    config.phys_base.as_u64() + (config.frames as u64 - 1) * PAGE_SIZE
}

#[test]
fn physical_windows_outside_ram_are_refused() {
    let kernel = hosted(1);
    let t = spawn(&kernel, ThreadFlags::new());
    run_next(&kernel, 0);

    assert_eq!(call_err(&kernel, 0, Sysno::AccessPhysical, &[0, PAGE_SIZE]), Error::IllegalArgs);
    let past_the_end = spare_frame(&kernel) + PAGE_SIZE;
    assert_eq!(
        call_err(&kernel, 0, Sysno::AccessPhysical, &[past_the_end - PAGE_SIZE, 2 * PAGE_SIZE]),
        Error::IllegalArgs
    );

    // the kernel keeps running and serving the thread
    write_user(&t, SCRATCH, b"still here");
    call(&kernel, 0, Sysno::Log, &[SCRATCH.as_u64(), 10]);
}

#[test]
fn frames_owned_elsewhere_cannot_be_windowed() {
    let kernel = hosted(1);
    let t = spawn(&kernel, ThreadFlags::new());
    run_next(&kernel, 0);

    write_user(&t, SCRATCH, b"private");
    let (pa, _) = call(&kernel, 0, Sysno::PointerPhysical, &[SCRATCH.as_u64()]);
    let frame = pa & !(PAGE_SIZE - 1);
    assert_eq!(call_err(&kernel, 0, Sysno::AccessPhysical, &[frame, PAGE_SIZE]), Error::IllegalArgs);

    // a free frame becomes the window's until it is closed
    let spare = spare_frame(&kernel);
    let before = used_pages(&kernel);
    let (window, _) = call(&kernel, 0, Sysno::AccessPhysical, &[spare, PAGE_SIZE]);
    assert_eq!(used_pages(&kernel), before + 1);
    assert_eq!(call_err(&kernel, 0, Sysno::AccessPhysical, &[spare, PAGE_SIZE]), Error::IllegalArgs);
    call(&kernel, 0, Sysno::CloseDescriptor, &[window]);
    assert_eq!(used_pages(&kernel), before);

    // mapped windows reach the frame itself
    let (window, _) = call(&kernel, 0, Sysno::AccessPhysical, &[spare, PAGE_SIZE]);
    let (at, _) = call(&kernel, 0, Sysno::MapMemory, &[window, 0, 0, 0, PAGE_SIZE, MAP_READ_WRITE]);
    write_user(&t, VirtualAddress::new(at), b"device");
    call(&kernel, 0, Sysno::Log, &[at, 6]);
    let mut back = [0u8; 6];
    kernel.allocator().read(PhysicalAddress::new(spare), &mut back);
    assert_eq!(&back, b"device");
}

#[test]
fn exhausting_the_pool_fails_the_call_not_the_kernel() {
    let kernel = hosted(1);
    let t = spawn(&kernel, ThreadFlags::new());
    run_next(&kernel, 0);

    let before = used_pages(&kernel);
    let too_big = kernel.config().frames as u64 * PAGE_SIZE;
    assert_eq!(call_err(&kernel, 0, Sysno::AllocateMemory, &[too_big, 0]), Error::NoMemory);
    assert_eq!(used_pages(&kernel), before, "partial allocations are returned");

    let (memory, _) = call(&kernel, 0, Sysno::AllocateMemory, &[PAGE_SIZE, 0]);
    call(&kernel, 0, Sysno::CloseDescriptor, &[memory]);
    write_user(&t, SCRATCH, b"still here");
    call(&kernel, 0, Sysno::Log, &[SCRATCH.as_u64(), 10]);
}
