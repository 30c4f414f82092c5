//! # Kernel syscall ABI
//!
//! Everything user space and the kernel must agree on bit-for-bit:
//!
//! - [`Sysno`]: opcode numbers.
//! - [`Error`]: the single error word every syscall returns.
//! - [`Event`]: the completion record written by `WaitForEvents`.
//! - Flag words for mapping, messaging and thread creation.
//! - [`TrapFrame`]: the saved register image and how syscall arguments and
//!   results are laid out in it.
//!
//! ## Register convention
//!
//! | Role | Register |
//! |------|----------|
//! | opcode | `rax` |
//! | `in0..in8` | `rdi rsi rdx r10 r8 r9 r12 r13 r14` |
//! | error | `rax` |
//! | `out0`, `out1` | `rdi`, `rsi` |

#![cfg_attr(not(any(test, doctest)), no_std)]

mod descriptor;
mod error;
mod event;
mod flags;
mod sysno;
mod trap_frame;

pub use descriptor::DescriptorKind;
pub use error::Error;
pub use event::{EVENT_SIZE, Event, EventType, Observation};
pub use flags::{ALLOC_ON_DEMAND, MAP_FIXED, MAP_PREFER_TOP, MAP_READ_EXECUTE, MAP_READ_WRITE, MAP_SHARE_ON_FORK, MsgFlags, ThreadFlags};
pub use sysno::Sysno;
pub use trap_frame::TrapFrame;

/// A universe-local descriptor handle.
pub type Handle = u64;

/// "No handle"; in handle arguments it selects the caller's own object.
pub const NULL_HANDLE: Handle = 0;

/// Receive filter wildcard for the request id.
pub const ANY_REQUEST: i64 = -1;

/// Receive filter wildcard for the sequence id.
pub const ANY_SEQUENCE: i64 = -1;

/// `WaitForEvents` timeout that blocks until at least one event arrives.
pub const WAIT_INFINITE: i64 = -1;

/// `ControlKernel` subsystem for debugging aids.
pub const SUBSYSTEM_DEBUG: u64 = 1;

/// Debug interface: report physical memory usage in `out0`/`out1`.
pub const DEBUG_MEMORY: u64 = 1;

/// The only supported thread ABI.
pub const ABI_SYSTEM_V: u64 = 1;
