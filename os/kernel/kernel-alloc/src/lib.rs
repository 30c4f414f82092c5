//! # Physical Frame Allocation
//!
//! This crate owns the kernel's flat pool of 4 KiB physical frames and the
//! means to touch their contents.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              PhysicalAllocator                      │
//! │    • interrupt-masking spin lock around the bitmap  │
//! │    • zero / read / write helpers on frames          │
//! └───────────────┬─────────────────────┬───────────────┘
//!                 │                     │
//! ┌───────────────▼─────────┐ ┌─────────▼───────────────┐
//! │   BitmapFrameAlloc      │ │   PhysMapper            │
//! │    • 1 bit per frame    │ │    • HHDM (bare metal)  │
//! │    • aligned search     │ │    • RAM arena (hosted) │
//! └─────────────────────────┘ └─────────────────────────┘
//! ```
//!
//! ## Invariants
//!
//! * The allocated and free frame sets partition the managed range.
//! * `num_used_pages() + num_free_pages()` is constant for the life of the pool.
//! * Freeing a free frame, or a frame outside the pool, through
//!   [`PhysicalAllocator::free`] is kernel-state corruption and panics;
//!   [`PhysicalAllocator::try_free`] reports it instead.
//! * A claimed physical window owns every pool frame it covers until it is
//!   released.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::PhysicalAllocator;
//! use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
//!
//! let pmm = PhysicalAllocator::hosted(PhysicalAddress::new(0x10_0000), 16);
//! let frame = pmm.allocate(PAGE_SIZE);
//! pmm.zero(frame);
//! pmm.write_u64(frame.join(8), 0xDEAD_BEEF);
//! assert_eq!(pmm.read_u64(frame.join(8)), 0xDEAD_BEEF);
//! assert_eq!(pmm.num_used_pages(), 1);
//! pmm.free(frame);
//! assert_eq!(pmm.num_used_pages(), 0);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod frame_alloc;
pub mod phys_mapper;
mod physical;

pub use frame_alloc::{BitmapFrameAlloc, FrameAllocError};
pub use phys_mapper::{HHDM_BASE, HHDM_SIZE, HhdmPhysMapper, PhysMapper, RamPhysMapper};
pub use physical::PhysicalAllocator;
