//! # Kernel synchronization primitives
//!
//! Every shared kernel structure (frame allocator, address spaces, run queue,
//! IRQ relays, event hubs, channels, universes) sits behind a [`SpinLock`].
//! Critical sections that may race with interrupt handlers take the lock via
//! [`SpinLock::lock_irq`], which masks interrupts for the guard's lifetime.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(all(not(test), not(doctest), not(target_os = "none")))]
extern crate std;

pub mod irq;
mod spin_lock;

pub use irq::IrqGuard;
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};
