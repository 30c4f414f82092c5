//! # Trap handling
//!
//! Every entry into the kernel, synchronous or not, is a [`Trap`] delivered
//! to [`Kernel::trap`] for one CPU. The low-level entry stubs save the user
//! registers into the current thread's [`TrapFrame`](kernel_syscall::TrapFrame),
//! decode the vector with [`Trap::from_vector`] and act on the returned
//! [`TrapExit`].
//!
//! | Trap                 | Handling                                                   |
//! |----------------------|------------------------------------------------------------|
//! | `Syscall`            | [`syscall::dispatch`]                                      |
//! | `PageFault`          | resolved by the address space, or treated as a fault       |
//! | `Debug`              | logged, the thread continues                               |
//! | other faults         | exit if `traps_are_fatal`, else stop and notify observers  |
//! | fault while stopped  | the thread exits                                           |
//! | `DoubleFault`        | kernel panic                                               |
//! | `Irq(n)`             | the relay for line `n` fires                               |
//! | `Timer`              | the clock advances, due waits expire, the CPU is preempted |

use alloc::sync::Arc;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_syscall::Observation;
use kernel_vmem::{Access, PageFaultError};

use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::schedule::Schedule;
use crate::syscall::{self, Outcome};
use crate::thread::{RunState, Thread};

pub const DIVIDE_ERROR_VECTOR: u8 = 0x00;
pub const DEBUG_VECTOR: u8 = 0x01;
pub const BREAKPOINT_VECTOR: u8 = 0x03;
pub const INVALID_OPCODE_VECTOR: u8 = 0x06;
pub const DEVICE_NOT_AVAILABLE_VECTOR: u8 = 0x07;
pub const DOUBLE_FAULT_VECTOR: u8 = 0x08;
pub const GENERAL_PROTECTION_VECTOR: u8 = 0x0D;
pub const PAGE_FAULT_VECTOR: u8 = 0x0E;
/// Legacy PIC lines are remapped to `0x20..0x30`.
pub const IRQ_BASE_VECTOR: u8 = 0x20;
pub const SYSCALL_VECTOR: u8 = 0x80;
pub const LAPIC_TIMER_VECTOR: u8 = 0xE0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Syscall,
    PageFault { address: VirtualAddress, code: PageFaultError },
    DivideByZero,
    Debug,
    Breakpoint,
    InvalidOpcode,
    NoFpu,
    GeneralProtection,
    DoubleFault,
    Irq(u8),
    Timer,
}

impl Trap {
    /// Decode a hardware vector; `cr2` only matters for page faults.
    #[must_use]
    pub const fn from_vector(vector: u8, error_code: u64, cr2: u64) -> Option<Self> {
        Some(match vector {
            DIVIDE_ERROR_VECTOR => Self::DivideByZero,
            DEBUG_VECTOR => Self::Debug,
            BREAKPOINT_VECTOR => Self::Breakpoint,
            INVALID_OPCODE_VECTOR => Self::InvalidOpcode,
            DEVICE_NOT_AVAILABLE_VECTOR => Self::NoFpu,
            DOUBLE_FAULT_VECTOR => Self::DoubleFault,
            GENERAL_PROTECTION_VECTOR => Self::GeneralProtection,
            PAGE_FAULT_VECTOR => Self::PageFault {
                address: VirtualAddress::new(cr2),
                code: PageFaultError::from_bits(error_code),
            },
            v if v >= IRQ_BASE_VECTOR && v < IRQ_BASE_VECTOR + 16 => Self::Irq(v - IRQ_BASE_VECTOR),
            SYSCALL_VECTOR => Self::Syscall,
            LAPIC_TIMER_VECTOR => Self::Timer,
            _ => return None,
        })
    }

    /// Whether the trap is raised by the instruction stream of the current
    /// thread rather than by a device.
    #[must_use]
    pub const fn is_synchronous(self) -> bool {
        !matches!(self, Self::Irq(_) | Self::Timer)
    }

    /// What observers of a thread stopped by this trap are told.
    #[must_use]
    pub const fn observation(self) -> Observation {
        match self {
            Self::PageFault { .. } => Observation::PageFault,
            Self::Breakpoint => Observation::Breakpoint,
            Self::InvalidOpcode => Observation::IllegalInstruction,
            Self::DivideByZero => Observation::DivideByZero,
            Self::NoFpu => Observation::NoFpu,
            Self::GeneralProtection
            | Self::Syscall
            | Self::Debug
            | Self::DoubleFault
            | Self::Irq(_)
            | Self::Timer => Observation::GeneralFault,
        }
    }
}

/// How the CPU leaves the kernel after a trap.
#[derive(Debug, Clone)]
pub enum TrapExit {
    /// Return to the interrupted thread.
    Continue,
    /// A scheduling decision was made; load the chosen thread (or idle).
    Rescheduled(Schedule),
}

impl Kernel {
    /// Handle `trap` on `cpu`.
    ///
    /// # Errors
    /// [`KernelError::NoSuchCpu`] for an unknown CPU.
    ///
    /// # Panics
    /// On a double fault, and on a synchronous trap with no current thread.
    pub fn trap(&self, cpu: usize, trap: Trap) -> Result<TrapExit, KernelError> {
        if cpu >= self.scheduler().num_cpus() {
            return Err(KernelError::NoSuchCpu(cpu));
        }

        match trap {
            Trap::Irq(line) => {
                match self.irq(usize::from(line)) {
                    Some(relay) => {
                        let woken = relay.fire();
                        log::trace!("irq {line}: {woken} waiters");
                    }
                    None => log::warn!("spurious irq {line}"),
                }
                Ok(TrapExit::Continue)
            }
            Trap::Timer => {
                self.tick();
                Ok(TrapExit::Rescheduled(self.scheduler().preempt(cpu)))
            }
            Trap::DoubleFault => panic!("double fault on cpu {cpu}"),
            _ => {
                let Some(thread) = self.scheduler().current(cpu) else {
                    panic!("{trap:?} on cpu {cpu} without a current thread");
                };
                Ok(match trap {
                    Trap::Syscall => self.syscall_trap(cpu, &thread),
                    _ => self.fault_trap(cpu, &thread, trap),
                })
            }
        }
    }

    fn syscall_trap(&self, cpu: usize, thread: &Arc<Thread>) -> TrapExit {
        match syscall::dispatch(self, thread) {
            Outcome::Return => TrapExit::Continue,
            Outcome::Block => TrapExit::Rescheduled(self.scheduler().do_schedule(cpu)),
            Outcome::Yield => TrapExit::Rescheduled(self.scheduler().preempt(cpu)),
            Outcome::Exit => {
                thread.exit();
                TrapExit::Rescheduled(self.scheduler().do_schedule(cpu))
            }
        }
    }

    fn fault_trap(&self, cpu: usize, thread: &Thread, trap: Trap) -> TrapExit {
        if thread.state() == RunState::Fault {
            log::error!("thread {}: {trap:?} while stopped on a fault, killing it", thread.id());
            thread.exit();
            return TrapExit::Rescheduled(self.scheduler().do_schedule(cpu));
        }

        match trap {
            Trap::Debug => {
                log::info!("thread {}: debug trap at {:#x}", thread.id(), thread.image().rip);
                return TrapExit::Continue;
            }
            Trap::PageFault { address, code } if thread.space().handle_fault(address, code) => {
                return TrapExit::Continue;
            }
            Trap::PageFault { address, code } => {
                log::info!(
                    "thread {}: unresolved page fault at {address} ({}) ip {:#x}",
                    thread.id(),
                    code.explain(),
                    thread.image().rip
                );
            }
            _ => {}
        }

        if thread.flags().traps_are_fatal() {
            log::warn!("thread {} killed by {trap:?}", thread.id());
            thread.exit();
        } else {
            log::info!("thread {} stopped by {trap:?}", thread.id());
            thread.enter_fault(trap);
        }
        TrapExit::Rescheduled(self.scheduler().do_schedule(cpu))
    }

    /// Emulated MMU access by `cpu`'s current thread.
    ///
    /// A translation miss is delivered as a page-fault trap; if the thread
    /// survives it and is still current, the translation is retried. `None`
    /// means the access did not complete.
    ///
    /// # Errors
    /// [`KernelError::NoSuchCpu`] for an unknown CPU.
    pub fn user_access(
        &self,
        cpu: usize,
        address: VirtualAddress,
        access: Access,
    ) -> Result<Option<PhysicalAddress>, KernelError> {
        let Some(thread) = self.scheduler().current(cpu) else {
            return Ok(None);
        };
        let code = match thread.space().translate(address, access) {
            Ok(pa) => return Ok(Some(pa)),
            Err(code) => code,
        };

        match self.trap(cpu, Trap::PageFault { address, code })? {
            TrapExit::Continue => Ok(thread.space().translate(address, access).ok()),
            TrapExit::Rescheduled(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_decode() {
        assert_eq!(Trap::from_vector(0x80, 0, 0), Some(Trap::Syscall));
        assert_eq!(Trap::from_vector(0x21, 0, 0), Some(Trap::Irq(1)));
        assert_eq!(Trap::from_vector(0x30, 0, 0), None);
        assert_eq!(Trap::from_vector(0xE0, 0, 0), Some(Trap::Timer));

        let pf = Trap::from_vector(0x0E, 0b10110, 0x40_1000).unwrap();
        let Trap::PageFault { address, code } = pf else {
            panic!("expected a page fault, got {pf:?}");
        };
        assert_eq!(address, VirtualAddress::new(0x40_1000));
        assert_eq!(code.access(), Access::Execute);
        assert!(code.user());
        assert_eq!(pf.observation(), Observation::PageFault);
    }

    #[test]
    fn only_devices_are_asynchronous() {
        assert!(Trap::Syscall.is_synchronous());
        assert!(Trap::GeneralProtection.is_synchronous());
        assert!(!Trap::Irq(3).is_synchronous());
        assert!(!Trap::Timer.is_synchronous());
    }

    #[test]
    fn a_trap_while_faulted_is_fatal() {
        let config = crate::KernelConfig { frames: 256, ..crate::KernelConfig::default() };
        let platform = crate::Platform::hosted(&config);
        let kernel = Kernel::new(config, platform).unwrap();
        let space = Arc::new(kernel_vmem::AddressSpace::create(kernel.kernel_space()).unwrap());
        let thread = kernel.create_thread(crate::thread::ThreadInit {
            flags: kernel_syscall::ThreadFlags::new(),
            universe: kernel.create_universe(),
            space,
            directory: Arc::clone(kernel.root_directory()),
            ip: VirtualAddress::new(0x40_0000),
            sp: VirtualAddress::new(0x80_0000),
        });
        kernel.scheduler().enqueue(&thread);
        kernel.schedule(0).unwrap();

        thread.set_state(RunState::Fault);
        let exit = kernel.trap(0, Trap::Breakpoint).unwrap();
        assert!(matches!(exit, TrapExit::Rescheduled(Schedule::Idle)));
        assert_eq!(thread.state(), RunState::Exited);
    }
}
