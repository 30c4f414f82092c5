//! # Microkernel core
//!
//! The privileged half of the system: threads, the capability model, IPC and
//! the trap state machine, built on the memory crates below it.
//!
//! ```text
//!   trap ──► interrupts::Kernel::trap
//!              ├─ Syscall    ──► syscall::dispatch ──► universe / ipc / rd / irq / io
//!              ├─ PageFault  ──► AddressSpace::handle_fault
//!              ├─ Irq(n)     ──► IrqRelay::fire
//!              └─ Timer      ──► Scheduler::preempt
//!                                  │
//!                                  ▼
//!                       Scheduler::do_schedule ──► ContextSwitch
//! ```
//!
//! There are no global singletons: a [`Kernel`] is built once by
//! [`Kernel::new`] or [`Kernel::boot`] and passed around by reference. On a
//! hosted target the hardware seams ([`ContextSwitch`], [`kernel_vmem::TlbShootdown`],
//! [`kernel_alloc::PhysMapper`]) are emulated, so the whole kernel runs under
//! `cargo test`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod elf;
mod error;
pub mod event;
pub mod interrupts;
pub mod io;
pub mod ipc;
pub mod irq;
mod kernel;
pub mod logger;
pub mod module;
pub mod rd;
pub mod schedule;
pub mod syscall;
pub mod thread;
pub mod universe;

pub use error::KernelError;
pub use interrupts::{Trap, TrapExit};
pub use kernel::{BootModule, Kernel, KernelConfig, Platform};
pub use schedule::{ContextSwitch, Cpu, NoContextSwitch, Schedule, Scheduler};
pub use thread::{RunState, Thread};
pub use universe::{AnyDescriptor, MAX_DESCRIPTORS, Universe, UniverseError};
