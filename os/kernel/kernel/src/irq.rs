//! # IRQ relays
//!
//! One relay per legacy interrupt line. Drivers obtain a line with
//! `AccessIrq`, then queue `SubmitWaitForIrq` operations that complete on the
//! next [`IrqRelay::fire`].

use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_sync::SpinLock;
use kernel_syscall::{Event, EventType};

use crate::event::AsyncOp;

pub const NUM_IRQS: usize = 16;

#[derive(Default)]
struct RelayState {
    mode: u64,
    fired: u64,
    acknowledged: u64,
    waiters: Vec<AsyncOp>,
}

pub struct IrqRelay {
    number: u8,
    state: SpinLock<RelayState>,
}

impl IrqRelay {
    #[must_use]
    pub fn new(number: u8) -> Self {
        Self {
            number,
            state: SpinLock::new(RelayState::default()),
        }
    }

    #[inline]
    #[must_use]
    pub const fn number(&self) -> u8 {
        self.number
    }

    /// Record the line's trigger mode flags.
    pub fn setup(&self, mode: u64) {
        self.state.with_lock_irq(|s| s.mode = mode);
        log::debug!("irq {}: mode {mode:#x}", self.number);
    }

    #[must_use]
    pub fn mode(&self) -> u64 {
        self.state.with_lock_irq(|s| s.mode)
    }

    /// Count an acknowledgement; returns the running total.
    pub fn acknowledge(&self) -> u64 {
        self.state.with_lock_irq(|s| {
            s.acknowledged += 1;
            s.acknowledged
        })
    }

    pub fn submit_wait(&self, op: AsyncOp) {
        self.state.with_lock_irq(|s| s.waiters.push(op));
    }

    /// The line was raised: complete every queued wait. Returns how many.
    pub fn fire(&self) -> usize {
        let (sequence, waiters) = self.state.with_lock_irq(|s| {
            s.fired += 1;
            (s.fired, core::mem::take(&mut s.waiters))
        });
        let n = waiters.len();
        for op in waiters {
            op.complete(Event {
                event_type: EventType::Irq,
                msg_sequence: sequence.cast_signed(),
                ..Event::default()
            });
        }
        if n == 0 {
            log::trace!("irq {}: no waiters", self.number);
        }
        n
    }

    #[must_use]
    pub fn fired(&self) -> u64 {
        self.state.with_lock_irq(|s| s.fired)
    }
}

/// All relays, indexed by line number.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn relays() -> [Arc<IrqRelay>; NUM_IRQS] {
    core::array::from_fn(|n| Arc::new(IrqRelay::new(n as u8)))
}
