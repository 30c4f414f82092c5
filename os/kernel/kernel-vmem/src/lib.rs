//! # Virtual Memory Support
//!
//! Memory objects, x86-64 4-level page tables and the per-process
//! [`AddressSpace`] that ties them together and resolves page faults.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as indices into four levels of page tables,
//! each a 4 KiB frame of 512 eight-byte entries. This kernel only installs
//! 4 KiB leaves, so every walk ends at the PT.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//! ```
//!
//! PML4 entries `256..512` describe the kernel half. Every address space shares
//! them with the kernel space; only entries `0..256` are private.
//!
//! ## Layers
//!
//! - [`page_table`]: entry layout and a software walker that reads and writes
//!   tables through the frame allocator's [`PhysMapper`](kernel_alloc::PhysMapper).
//! - [`fault`]: the hardware page-fault error code.
//! - [`memory`]: [`MemoryObject`], the destination of virtual pages.
//! - [`address_space`]: the mapping set, fault resolution, fork and teardown.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

pub mod address_space;
pub mod fault;
pub mod memory;
pub mod page_table;

pub use crate::address_space::{
    AddressSpace, MapError, MapFlags, Mapping, NoShootdown, TlbShootdown, USER_BASE, USER_TOP,
};
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use crate::address_space::LocalInvlpg;
pub use crate::fault::{Access, PageFaultError};
pub use crate::memory::{MemoryError, MemoryKind, MemoryObject};
pub use crate::page_table::{PageTableEntry, PageTableWalker};
