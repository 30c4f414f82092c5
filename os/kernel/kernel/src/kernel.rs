//! # Kernel context
//!
//! [`Kernel`] owns everything that is global to the system: the frame
//! allocator, the kernel address space, the scheduler, the IRQ relays, the
//! root resource directory and the monotonic clock. It is built once and
//! passed down by reference.
//!
//! [`Kernel::boot`] is the bring-up sequence after the loader hands over:
//!
//! 1. reserve the frames of every boot module,
//! 2. publish modules `1..` as memory objects under `initrd/<name>`,
//! 3. load module `0` as the first user thread and enqueue it.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use kernel_alloc::PhysicalAllocator;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::{AddressSpace, MemoryObject, NoShootdown, TlbShootdown};
use log::LevelFilter;

use crate::error::KernelError;
use crate::event::{EventHub, Timeouts};
use crate::irq::{self, IrqRelay, NUM_IRQS};
use crate::logger::{KernelLogger, LogSink};
use crate::module;
use crate::rd::RdFolder;
use crate::schedule::{ContextSwitch, NoContextSwitch, Schedule, Scheduler};
use crate::thread::{Thread, ThreadInit};
use crate::universe::{AnyDescriptor, MAX_DESCRIPTORS, Universe};

/// Boot-time tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of CPUs the scheduler manages.
    pub cpus: usize,
    /// First frame handed to the frame allocator.
    pub phys_base: PhysicalAddress,
    /// Frames managed by the frame allocator.
    pub frames: usize,
    /// Nanoseconds per timer tick.
    pub tick_ns: u64,
    /// Stack size of the first user thread, in bytes.
    pub stack_size: u64,
    /// Descriptor slots per universe.
    pub max_descriptors: usize,
    pub log_level: LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            phys_base: PhysicalAddress::new(0x10_0000),
            frames: 4096,
            tick_ns: 10_000_000,
            stack_size: 0x1_0000,
            max_descriptors: MAX_DESCRIPTORS,
            log_level: LevelFilter::Info,
        }
    }
}

impl KernelConfig {
    /// A logger at the configured level; install it before [`Kernel::boot`].
    #[must_use]
    pub const fn logger<S: LogSink + 'static>(&self, sink: S) -> KernelLogger<S> {
        KernelLogger::new(self.log_level, sink)
    }
}

/// A module handed over by the boot loader, already in physical memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootModule {
    pub name: String,
    /// Page-aligned physical base.
    pub base: PhysicalAddress,
    pub length: u64,
}

/// The hardware seams a kernel runs on.
pub struct Platform {
    pub pmm: Arc<PhysicalAllocator>,
    pub shootdown: Arc<dyn TlbShootdown>,
    pub switcher: Arc<dyn ContextSwitch>,
}

impl Platform {
    /// Emulated RAM, no TLBs and no real context switches.
    #[must_use]
    pub fn hosted(config: &KernelConfig) -> Self {
        Self {
            pmm: Arc::new(PhysicalAllocator::hosted(config.phys_base, config.frames)),
            shootdown: Arc::new(NoShootdown),
            switcher: Arc::new(NoContextSwitch),
        }
    }

    /// Physical memory through the higher-half direct map.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    #[must_use]
    pub fn bare_metal(config: &KernelConfig, switcher: Arc<dyn ContextSwitch>) -> Self {
        use kernel_alloc::{BitmapFrameAlloc, HhdmPhysMapper};
        use kernel_vmem::LocalInvlpg;

        Self {
            pmm: Arc::new(PhysicalAllocator::new(
                BitmapFrameAlloc::new(config.phys_base, config.frames),
                HhdmPhysMapper::default(),
            )),
            shootdown: Arc::new(LocalInvlpg),
            switcher,
        }
    }

    #[must_use]
    pub fn with_switcher(mut self, switcher: Arc<dyn ContextSwitch>) -> Self {
        self.switcher = switcher;
        self
    }
}

pub struct Kernel {
    config: KernelConfig,
    pmm: Arc<PhysicalAllocator>,
    kernel_space: Arc<AddressSpace>,
    scheduler: Arc<Scheduler>,
    irqs: [Arc<IrqRelay>; NUM_IRQS],
    root_directory: Arc<RdFolder>,
    timeouts: Timeouts,
    ticks: AtomicU64,
    next_thread: AtomicU64,
    next_async: AtomicI64,
}

impl Kernel {
    /// Bring up the kernel objects without any user threads.
    ///
    /// # Errors
    /// If the kernel address space cannot be allocated.
    pub fn new(config: KernelConfig, platform: Platform) -> Result<Self, KernelError> {
        let Platform {
            pmm,
            shootdown,
            switcher,
        } = platform;
        let kernel_space = Arc::new(AddressSpace::kernel(Arc::clone(&pmm), shootdown)?);
        log::info!(
            "kernel: {} cpus, {} frames at {}, kernel space root {}",
            config.cpus,
            pmm.total_pages(),
            config.phys_base,
            kernel_space.root()
        );
        Ok(Self {
            scheduler: Arc::new(Scheduler::new(config.cpus, switcher)),
            config,
            pmm,
            kernel_space,
            irqs: irq::relays(),
            root_directory: Arc::new(RdFolder::new()),
            timeouts: Timeouts::default(),
            ticks: AtomicU64::new(0),
            next_thread: AtomicU64::new(1),
            next_async: AtomicI64::new(1),
        })
    }

    /// Bring up the kernel and start module `0` as the first thread.
    ///
    /// # Errors
    /// - [`KernelError::IllegalArgs`] without modules or with an unaligned one.
    /// - Any error from publishing the modules or loading the image.
    pub fn boot(
        config: KernelConfig,
        platform: Platform,
        modules: &[BootModule],
    ) -> Result<(Self, Arc<Thread>), KernelError> {
        let kernel = Self::new(config, platform)?;
        let (init, rest) = modules
            .split_first()
            .ok_or(KernelError::IllegalArgs("no boot modules"))?;

        for m in modules {
            if !m.base.is_page_aligned() {
                return Err(KernelError::IllegalArgs("boot module is not page aligned"));
            }
            let frames = kernel.pmm.reserve_range(m.base, m.length);
            log::debug!("module {}: {} bytes at {}, {frames} frames reserved", m.name, m.length, m.base);
        }

        let initrd = Arc::new(RdFolder::new());
        for m in rest {
            let memory = MemoryObject::physical(Arc::clone(&kernel.pmm), m.base, m.length);
            initrd.publish(&m.name, AnyDescriptor::Memory(Arc::new(memory)))?;
        }
        kernel.root_directory.mount("initrd", initrd)?;
        log::info!("published {} modules under initrd", rest.len());

        let length = usize::try_from(init.length).map_err(|_| KernelError::IllegalArgs("init image too large"))?;
        let mut image = vec![0u8; length];
        kernel.pmm.read(init.base, &mut image);
        let thread = module::execute_module(&kernel, &image)?;
        log::info!("started {} as thread {}", init.name, thread.id());
        Ok((kernel, thread))
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub const fn allocator(&self) -> &Arc<PhysicalAllocator> {
        &self.pmm
    }

    #[inline]
    #[must_use]
    pub const fn kernel_space(&self) -> &Arc<AddressSpace> {
        &self.kernel_space
    }

    #[inline]
    #[must_use]
    pub const fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    #[inline]
    #[must_use]
    pub const fn root_directory(&self) -> &Arc<RdFolder> {
        &self.root_directory
    }

    #[must_use]
    pub fn irq(&self, number: usize) -> Option<&Arc<IrqRelay>> {
        self.irqs.get(number)
    }

    /// Nanoseconds since boot, advanced by timer ticks.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire).saturating_mul(self.config.tick_ns)
    }

    /// Advance the clock by one tick and expire due waits.
    pub fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::AcqRel);
        let now = self.now();
        let expired = self.timeouts.expire(now);
        if expired > 0 {
            log::trace!("{expired} waits timed out at {now}ns");
        }
        now
    }

    pub(crate) fn next_async_id(&self) -> i64 {
        self.next_async.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn add_timeout(&self, deadline: u64, hub: Arc<EventHub>, wait: u64) {
        self.timeouts.add(deadline, hub, wait);
    }

    #[must_use]
    pub fn create_event_hub(&self) -> Arc<EventHub> {
        Arc::new(EventHub::new(Arc::clone(&self.scheduler)))
    }

    #[must_use]
    pub fn create_universe(&self) -> Arc<Universe> {
        Arc::new(Universe::new(self.config.max_descriptors))
    }

    /// A new thread; the caller decides when to enqueue it.
    #[must_use]
    pub fn create_thread(&self, init: ThreadInit) -> Arc<Thread> {
        let id = self.next_thread.fetch_add(1, Ordering::Relaxed);
        Thread::new(id, init, self.create_event_hub())
    }

    /// Pick the next thread for `cpu`.
    ///
    /// # Errors
    /// [`KernelError::NoSuchCpu`] for an unknown CPU.
    pub fn schedule(&self, cpu: usize) -> Result<Schedule, KernelError> {
        if cpu >= self.scheduler.num_cpus() {
            return Err(KernelError::NoSuchCpu(cpu));
        }
        Ok(self.scheduler.do_schedule(cpu))
    }
}
