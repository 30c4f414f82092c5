#![allow(dead_code)]

use kernel::thread::ThreadInit;
use kernel::{ContextSwitch, Kernel, KernelConfig, Platform, Schedule, Thread, Trap, TrapExit};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_syscall::{EVENT_SIZE, Error, Event, Sysno, ThreadFlags, TrapFrame};
use kernel_vmem::{AddressSpace, MapFlags, MemoryObject};
use std::sync::{Arc, Mutex};

/// Read-write scratch mapping every spawned thread gets.
pub const SCRATCH: VirtualAddress = VirtualAddress::new(0x1000_0000);
pub const SCRATCH_PAGES: usize = 4;

pub fn config(cpus: usize) -> KernelConfig {
    KernelConfig {
        cpus,
        frames: 1024,
        ..KernelConfig::default()
    }
}

pub fn hosted(cpus: usize) -> Kernel {
    let config = config(cpus);
    let platform = Platform::hosted(&config);
    Kernel::new(config, platform).unwrap()
}

/// Records every context switch as `(cpu, thread id)`.
#[derive(Default)]
pub struct RecordingSwitch {
    pub switches: Mutex<Vec<(usize, u64)>>,
    pub idles: Mutex<usize>,
}

impl ContextSwitch for RecordingSwitch {
    fn switch_to(&self, cpu: usize, thread: &Thread) {
        self.switches.lock().unwrap().push((cpu, thread.id()));
    }

    fn idle(&self, _cpu: usize) {
        *self.idles.lock().unwrap() += 1;
    }
}

pub fn recording(cpus: usize) -> (Kernel, Arc<RecordingSwitch>) {
    let config = config(cpus);
    let switch = Arc::new(RecordingSwitch::default());
    let platform = Platform::hosted(&config).with_switcher(switch.clone());
    (Kernel::new(config, platform).unwrap(), switch)
}

/// A runnable thread with its own universe and a scratch mapping.
pub fn spawn(kernel: &Kernel, flags: ThreadFlags) -> Arc<Thread> {
    let space = Arc::new(AddressSpace::create(kernel.kernel_space()).unwrap());
    let scratch = Arc::new(MemoryObject::on_demand(Arc::clone(kernel.allocator()), SCRATCH_PAGES));
    let flags_rw = MapFlags::new().with_fixed(true).with_read_write(true);
    space
        .map(scratch, SCRATCH, 0, SCRATCH_PAGES as u64 * PAGE_SIZE, flags_rw)
        .unwrap();
    let thread = kernel.create_thread(ThreadInit {
        flags,
        universe: kernel.create_universe(),
        space,
        directory: Arc::clone(kernel.root_directory()),
        ip: VirtualAddress::new(0x40_0000),
        sp: SCRATCH + PAGE_SIZE,
    });
    kernel.scheduler().enqueue(&thread);
    thread
}

/// Schedule `cpu` and expect a thread to run.
pub fn run_next(kernel: &Kernel, cpu: usize) -> Arc<Thread> {
    match kernel.schedule(cpu).unwrap() {
        Schedule::Running(thread) => thread,
        Schedule::Idle => panic!("cpu {cpu} went idle"),
    }
}

/// Issue a syscall from `cpu`'s current thread.
pub fn syscall(kernel: &Kernel, cpu: usize, sysno: Sysno, args: &[u64]) -> (TrapExit, TrapFrame) {
    let thread = kernel.scheduler().current(cpu).expect("no current thread");
    thread.with_image(|tf| tf.set_call(sysno as u64, args));
    let exit = kernel.trap(cpu, Trap::Syscall).unwrap();
    (exit, thread.image())
}

/// Issue a syscall that must succeed without blocking; returns `(out0, out1)`.
pub fn call(kernel: &Kernel, cpu: usize, sysno: Sysno, args: &[u64]) -> (u64, u64) {
    let (exit, frame) = syscall(kernel, cpu, sysno, args);
    assert!(matches!(exit, TrapExit::Continue), "{sysno:?} rescheduled: {exit:?}");
    assert_eq!(frame.error(), Some(Error::None), "{sysno:?} failed");
    (frame.out0(), frame.out1())
}

/// Issue a syscall that must fail with `error`.
pub fn call_err(kernel: &Kernel, cpu: usize, sysno: Sysno, args: &[u64]) -> Error {
    let (_, frame) = syscall(kernel, cpu, sysno, args);
    frame.error().unwrap()
}

pub fn write_user(thread: &Thread, at: VirtualAddress, bytes: &[u8]) {
    thread.space().copy_to_user(at, bytes).unwrap();
}

pub fn read_user(thread: &Thread, at: VirtualAddress, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    thread.space().copy_from_user(at, &mut buf).unwrap();
    buf
}

/// Decode `count` event records written at `at`.
pub fn read_events(thread: &Thread, at: VirtualAddress, count: usize) -> Vec<Event> {
    (0..count)
        .map(|i| {
            let bytes = read_user(thread, at + (i * EVENT_SIZE) as u64, EVENT_SIZE);
            Event::from_bytes(bytes.as_slice().try_into().unwrap()).unwrap()
        })
        .collect()
}

/// Poll `hub` from `cpu`'s current thread into the second scratch page.
pub fn poll_events(kernel: &Kernel, cpu: usize, hub: u64) -> Vec<Event> {
    let buffer = SCRATCH + PAGE_SIZE;
    let (count, _) = call(kernel, cpu, Sysno::WaitForEvents, &[hub, buffer.as_u64(), 16, 0]);
    let thread = kernel.scheduler().current(cpu).unwrap();
    read_events(&thread, buffer, usize::try_from(count).unwrap())
}
