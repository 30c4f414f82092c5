//! Full-duplex pipes.
//!
//! A pipe is two channels. Endpoint `0` sends into channel `0` and receives
//! from channel `1`; endpoint `1` the other way round. Within a channel a
//! message is matched to the first compatible receive, so ordering between a
//! sender and receiver is preserved.
//!
//! Dropping the last reference to either endpoint closes the whole pipe:
//! everything pending completes with `ClosedRemotely`, and so does everything
//! submitted afterwards.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;
use kernel_syscall::{ANY_REQUEST, ANY_SEQUENCE, Error, Event, EventType};
use kernel_vmem::AddressSpace;

use crate::event::AsyncOp;
use crate::ipc::RingBuffer;
use crate::universe::{AnyDescriptor, Universe};

pub enum Payload {
    String(Vec<u8>),
    Descriptor(AnyDescriptor),
}

impl Payload {
    const fn send_event(&self) -> EventType {
        match self {
            Self::String(_) => EventType::SendString,
            Self::Descriptor(_) => EventType::SendDescriptor,
        }
    }
}

pub struct Message {
    pub payload: Payload,
    pub request: i64,
    pub sequence: i64,
    /// Response (as opposed to request) direction.
    pub response: bool,
}

/// Where a receive puts the payload.
pub enum RecvTarget {
    String {
        space: Arc<AddressSpace>,
        buffer: VirtualAddress,
        max: usize,
    },
    Ring(Arc<RingBuffer>),
    Descriptor(Arc<Universe>),
}

impl RecvTarget {
    const fn event_type(&self) -> EventType {
        match self {
            Self::String { .. } => EventType::RecvString,
            Self::Ring(_) => EventType::RecvStringToRing,
            Self::Descriptor(_) => EventType::RecvDescriptor,
        }
    }

    const fn accepts(&self, payload: &Payload) -> bool {
        matches!(
            (self, payload),
            (Self::String { .. } | Self::Ring(_), Payload::String(_)) | (Self::Descriptor(_), Payload::Descriptor(_))
        )
    }
}

/// Which messages a receive accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    /// A request id or [`ANY_REQUEST`].
    pub request: i64,
    /// A sequence id or [`ANY_SEQUENCE`].
    pub sequence: i64,
    pub response: bool,
}

impl Filter {
    #[must_use]
    pub const fn matches(&self, message: &Message) -> bool {
        self.response == message.response
            && (self.request == ANY_REQUEST || self.request == message.request)
            && (self.sequence == ANY_SEQUENCE || self.sequence == message.sequence)
    }
}

struct PendingSend {
    message: Message,
    op: AsyncOp,
}

struct PendingRecv {
    target: RecvTarget,
    filter: Filter,
    op: AsyncOp,
}

#[derive(Default)]
struct Channel {
    closed: bool,
    sends: VecDeque<PendingSend>,
    recvs: VecDeque<PendingRecv>,
}

#[derive(Default)]
struct FullPipe {
    channels: [SpinLock<Channel>; 2],
}

impl FullPipe {
    fn close(&self) {
        let mut sends = Vec::new();
        let mut recvs = Vec::new();
        for channel in &self.channels {
            channel.with_lock_irq(|c| {
                c.closed = true;
                sends.extend(c.sends.drain(..));
                recvs.extend(c.recvs.drain(..));
            });
        }
        if !sends.is_empty() || !recvs.is_empty() {
            log::debug!("pipe closed with {} sends and {} receives pending", sends.len(), recvs.len());
        }
        for s in sends {
            s.op.fail(s.message.payload.send_event(), Error::ClosedRemotely);
        }
        for r in recvs {
            r.op.fail(r.target.event_type(), Error::ClosedRemotely);
        }
    }
}

struct Side {
    pipe: Arc<FullPipe>,
    index: usize,
}

impl Drop for Side {
    fn drop(&mut self) {
        self.pipe.close();
    }
}

/// One end of a pipe. Cloning shares the end.
#[derive(Clone)]
pub struct PipeEndpoint(Arc<Side>);

/// A new pipe as its two ends.
#[must_use]
pub fn create_full_pipe() -> (PipeEndpoint, PipeEndpoint) {
    let pipe = Arc::new(FullPipe::default());
    (
        PipeEndpoint(Arc::new(Side {
            pipe: Arc::clone(&pipe),
            index: 0,
        })),
        PipeEndpoint(Arc::new(Side { pipe, index: 1 })),
    )
}

impl PipeEndpoint {
    #[inline]
    #[must_use]
    pub fn side(&self) -> usize {
        self.0.index
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.pipe.channels[0].with_lock_irq(|c| c.closed)
    }

    /// Send `message`; `op` completes once it is delivered.
    pub fn send(&self, message: Message, op: AsyncOp) {
        let send = PendingSend { message, op };
        let mut channel = self.0.pipe.channels[self.0.index].lock_irq();
        if channel.closed {
            drop(channel);
            send.op.fail(send.message.payload.send_event(), Error::ClosedRemotely);
            return;
        }
        let pos = channel
            .recvs
            .iter()
            .position(|r| r.target.accepts(&send.message.payload) && r.filter.matches(&send.message));
        match pos.and_then(|p| channel.recvs.remove(p)) {
            Some(recv) => {
                drop(channel);
                transfer(send, recv);
            }
            None => channel.sends.push_back(send),
        }
    }

    /// Receive the first message accepted by `filter` into `target`.
    pub fn recv(&self, target: RecvTarget, filter: Filter, op: AsyncOp) {
        let recv = PendingRecv { target, filter, op };
        let mut channel = self.0.pipe.channels[1 - self.0.index].lock_irq();
        if channel.closed {
            drop(channel);
            recv.op.fail(recv.target.event_type(), Error::ClosedRemotely);
            return;
        }
        let pos = channel
            .sends
            .iter()
            .position(|s| recv.target.accepts(&s.message.payload) && recv.filter.matches(&s.message));
        match pos.and_then(|p| channel.sends.remove(p)) {
            Some(send) => {
                drop(channel);
                transfer(send, recv);
            }
            None => channel.recvs.push_back(recv),
        }
    }
}

/// Move one message into its receive target and complete both sides.
fn transfer(send: PendingSend, recv: PendingRecv) {
    let PendingSend { message, op: send_op } = send;
    let send_type = message.payload.send_event();
    let mut event = Event {
        event_type: recv.target.event_type(),
        msg_request: message.request,
        msg_sequence: message.sequence,
        ..Event::default()
    };

    let error = match (recv.target, message.payload) {
        (RecvTarget::String { space, buffer, max }, Payload::String(bytes)) => {
            if bytes.len() > max {
                Error::BufferTooSmall
            } else if let Err(e) = space.copy_to_user(buffer, &bytes) {
                log::debug!("receive buffer unusable: {e}");
                Error::Fault
            } else {
                event.length = bytes.len() as u64;
                Error::None
            }
        }
        (RecvTarget::Ring(ring), Payload::String(bytes)) => match ring.deliver(&bytes) {
            Ok(offset) => {
                event.offset = offset;
                event.length = bytes.len() as u64;
                Error::None
            }
            Err(e) => e,
        },
        (RecvTarget::Descriptor(universe), Payload::Descriptor(descriptor)) => match universe.attach(descriptor) {
            Ok(handle) => {
                event.handle = handle;
                Error::None
            }
            Err(_) => Error::NoDescriptorSlots,
        },
        // excluded by `RecvTarget::accepts`
        _ => Error::IllegalArgs,
    };
    event.error = error;

    recv.op.complete(event);
    send_op.complete(Event {
        event_type: send_type,
        msg_request: event.msg_request,
        msg_sequence: event.msg_sequence,
        ..Event::default()
    });
}
