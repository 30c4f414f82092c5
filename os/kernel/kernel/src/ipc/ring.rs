//! Ring buffers.
//!
//! User space registers buffers with `SubmitRing`; `RecvStringToRing` copies
//! payloads into the oldest buffer at its write offset. A buffer too small for
//! the next payload is retired (its submission completes with the number of
//! bytes used) and the next one is tried.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;
use kernel_syscall::{Error, Event, EventType};
use kernel_vmem::AddressSpace;

use crate::event::{AsyncOp, EventHub};

struct Chunk {
    space: Arc<AddressSpace>,
    base: VirtualAddress,
    size: usize,
    used: usize,
    op: AsyncOp,
}

pub struct RingBuffer {
    hub: Arc<EventHub>,
    chunks: SpinLock<VecDeque<Chunk>>,
}

impl RingBuffer {
    #[must_use]
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self {
            hub,
            chunks: SpinLock::new(VecDeque::new()),
        }
    }

    /// Hub used for `SubmitRing` calls that name none.
    #[inline]
    #[must_use]
    pub const fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Register `size` bytes at `base`; `op` completes when the buffer is retired.
    pub fn submit(&self, space: Arc<AddressSpace>, base: VirtualAddress, size: usize, op: AsyncOp) {
        self.chunks.with_lock_irq(|c| {
            c.push_back(Chunk {
                space,
                base,
                size,
                used: 0,
                op,
            });
        });
    }

    #[must_use]
    pub fn buffers(&self) -> usize {
        self.chunks.with_lock_irq(|c| c.len())
    }

    /// Copy `bytes` into the current buffer and return the offset used.
    ///
    /// # Errors
    /// [`Error::BufferTooSmall`] when no buffer can take the payload,
    /// [`Error::Fault`] when the buffer is not mapped writable.
    pub fn deliver(&self, bytes: &[u8]) -> Result<u64, Error> {
        let mut retired = Vec::new();
        let target = self.chunks.with_lock_irq(|chunks| {
            while let Some(front) = chunks.front_mut() {
                if front.size - front.used >= bytes.len() {
                    let offset = front.used;
                    front.used += bytes.len();
                    return Some((Arc::clone(&front.space), front.base, offset));
                }
                retired.extend(chunks.pop_front());
            }
            None
        });

        for chunk in retired {
            chunk.op.complete(Event {
                event_type: EventType::Ring,
                length: chunk.used as u64,
                ..Event::default()
            });
        }

        let (space, base, offset) = target.ok_or(Error::BufferTooSmall)?;
        let offset = offset as u64;
        space
            .copy_to_user(VirtualAddress::new(base.as_u64() + offset), bytes)
            .map_err(|_| Error::Fault)?;
        Ok(offset)
    }
}
