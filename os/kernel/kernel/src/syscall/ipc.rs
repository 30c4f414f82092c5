//! Event hubs, rings, pipes and servers.

use alloc::sync::Arc;
use kernel_memory_addresses::VirtualAddress;
use kernel_syscall::{Error, MsgFlags, NULL_HANDLE};

use super::{Ctx, Reply};
use crate::error::KernelError;
use crate::event::{AsyncOp, Wait, WaitKind, deliver};
use crate::ipc::{self, Filter, Message, Payload, RecvTarget, RingBuffer};
use crate::universe::AnyDescriptor;

fn msg_flags(flags: u64) -> Result<MsgFlags, KernelError> {
    u32::try_from(flags)
        .ok()
        .map(MsgFlags::from_bits)
        .filter(|f| f.is_valid())
        .ok_or(KernelError::IllegalArgs("message flags must select exactly one direction"))
}

fn usize_arg(value: u64, what: &'static str) -> Result<usize, KernelError> {
    usize::try_from(value).map_err(|_| KernelError::IllegalArgs(what))
}

fn submitted(op_id: i64) -> Reply {
    Reply::one(op_id.cast_unsigned())
}

pub fn create_event_hub(cx: &Ctx<'_>) -> Result<Reply, KernelError> {
    let handle = cx.attach(AnyDescriptor::EventHub(cx.kernel.create_event_hub()))?;
    Ok(Reply::one(handle))
}

/// `timeout` is in nanoseconds: `0` polls, negative waits forever.
pub fn wait_for_events(cx: &Ctx<'_>, hub: u64, buffer: u64, max: u64, timeout: u64) -> Result<Reply, KernelError> {
    let hub = cx.hub(hub)?;
    let max = usize_arg(max, "event count")?;
    if max == 0 {
        return Err(KernelError::IllegalArgs("event buffer holds no events"));
    }
    let kind = WaitKind::Events {
        buffer: VirtualAddress::new(buffer),
        max,
    };
    let timeout = timeout.cast_signed();

    let events = if timeout == 0 {
        hub.poll(max)
    } else {
        match hub.wait(cx.thread, kind) {
            Wait::Ready(events) => events,
            Wait::Blocked(wait) => {
                if timeout > 0 {
                    let deadline = cx.kernel.now().saturating_add(timeout.cast_unsigned());
                    cx.kernel.add_timeout(deadline, hub, wait);
                }
                return Ok(Reply::Blocked);
            }
        }
    };
    match deliver(cx.thread, kind, &events) {
        (Error::None, count) => Ok(Reply::one(count)),
        (e, _) => Err(KernelError::Abi(e)),
    }
}

/// `(hub)`: the hub completes `SubmitRing` calls that name no hub.
pub fn create_ring(cx: &Ctx<'_>, hub: u64) -> Result<Reply, KernelError> {
    let ring = RingBuffer::new(cx.hub(hub)?);
    let handle = cx.attach(AnyDescriptor::Ring(Arc::new(ring)))?;
    Ok(Reply::one(handle))
}

/// `(ring, hub, buffer, size, function, object)`
pub fn submit_ring(cx: &Ctx<'_>, a: [u64; 9]) -> Result<Reply, KernelError> {
    let [ring, hub, buffer, size, function, object, ..] = a;
    let ring = cx.ring(ring)?;
    let size = usize_arg(size, "ring buffer size")?;
    if size == 0 {
        return Err(KernelError::IllegalArgs("empty ring buffer"));
    }
    let op = if hub == NULL_HANDLE {
        AsyncOp::new(Arc::clone(ring.hub()), cx.kernel.next_async_id(), function, object)
    } else {
        cx.submit(hub, function, object)?
    };
    let id = op.async_id();
    ring.submit(Arc::clone(cx.thread.space()), VirtualAddress::new(buffer), size, op);
    Ok(submitted(id))
}

pub fn create_full_pipe(cx: &Ctx<'_>) -> Result<Reply, KernelError> {
    let (first, second) = ipc::create_full_pipe();
    let first = cx.attach(AnyDescriptor::Pipe(first))?;
    let second = cx.attach(AnyDescriptor::Pipe(second))?;
    Ok(Reply::Values(first, second))
}

/// `(pipe, hub, ptr, len, request, sequence, function, object, flags)`
pub fn submit_send_string(cx: &Ctx<'_>, a: [u64; 9]) -> Result<Reply, KernelError> {
    let [pipe, hub, ptr, len, request, sequence, function, object, flags] = a;
    let flags = msg_flags(flags)?;
    let pipe = cx.pipe(pipe)?;
    let bytes = cx.read_user(ptr, len)?;
    let op = cx.submit(hub, function, object)?;
    let id = op.async_id();
    pipe.send(message(Payload::String(bytes), request, sequence, flags), op);
    Ok(submitted(id))
}

/// `(pipe, hub, handle, request, sequence, function, object, flags)`
pub fn submit_send_descriptor(cx: &Ctx<'_>, a: [u64; 9]) -> Result<Reply, KernelError> {
    let [pipe, hub, handle, request, sequence, function, object, flags, _] = a;
    let flags = msg_flags(flags)?;
    let pipe = cx.pipe(pipe)?;
    let descriptor = cx.descriptor(handle)?;
    let op = cx.submit(hub, function, object)?;
    let id = op.async_id();
    pipe.send(message(Payload::Descriptor(descriptor), request, sequence, flags), op);
    Ok(submitted(id))
}

/// `(pipe, hub, request, sequence, function, object, flags)`
pub fn submit_recv_descriptor(cx: &Ctx<'_>, a: [u64; 9]) -> Result<Reply, KernelError> {
    let [pipe, hub, request, sequence, function, object, flags, ..] = a;
    let flags = msg_flags(flags)?;
    let pipe = cx.pipe(pipe)?;
    let op = cx.submit(hub, function, object)?;
    let id = op.async_id();
    let target = RecvTarget::Descriptor(Arc::clone(cx.thread.universe()));
    pipe.recv(target, filter(request, sequence, flags), op);
    Ok(submitted(id))
}

/// `(pipe, hub, ptr, max, request, sequence, function, object, flags)`
pub fn submit_recv_string(cx: &Ctx<'_>, a: [u64; 9]) -> Result<Reply, KernelError> {
    let [pipe, hub, ptr, max, request, sequence, function, object, flags] = a;
    let flags = msg_flags(flags)?;
    let pipe = cx.pipe(pipe)?;
    let op = cx.submit(hub, function, object)?;
    let id = op.async_id();
    let target = RecvTarget::String {
        space: Arc::clone(cx.thread.space()),
        buffer: VirtualAddress::new(ptr),
        max: usize_arg(max, "receive buffer size")?,
    };
    pipe.recv(target, filter(request, sequence, flags), op);
    Ok(submitted(id))
}

/// `(pipe, ring, hub, request, sequence, function, object, flags)`
pub fn submit_recv_string_to_ring(cx: &Ctx<'_>, a: [u64; 9]) -> Result<Reply, KernelError> {
    let [pipe, ring, hub, request, sequence, function, object, flags, _] = a;
    let flags = msg_flags(flags)?;
    let pipe = cx.pipe(pipe)?;
    let ring = cx.ring(ring)?;
    let op = cx.submit(hub, function, object)?;
    let id = op.async_id();
    pipe.recv(RecvTarget::Ring(ring), filter(request, sequence, flags), op);
    Ok(submitted(id))
}

/// `(pipe, ptr, len, request, sequence, flags)`
pub fn send_string(cx: &Ctx<'_>, a: [u64; 9]) -> Result<Reply, KernelError> {
    let [pipe, ptr, len, request, sequence, flags, ..] = a;
    let flags = msg_flags(flags)?;
    let pipe = cx.pipe(pipe)?;
    let bytes = cx.read_user(ptr, len)?;
    pipe.send(message(Payload::String(bytes), request, sequence, flags), cx.submit_sync());
    cx.block_on_sync()
}

/// `(pipe, ptr, max, request, sequence, flags) -> length`
pub fn recv_string(cx: &Ctx<'_>, a: [u64; 9]) -> Result<Reply, KernelError> {
    let [pipe, ptr, max, request, sequence, flags, ..] = a;
    let flags = msg_flags(flags)?;
    let pipe = cx.pipe(pipe)?;
    let target = RecvTarget::String {
        space: Arc::clone(cx.thread.space()),
        buffer: VirtualAddress::new(ptr),
        max: usize_arg(max, "receive buffer size")?,
    };
    pipe.recv(target, filter(request, sequence, flags), cx.submit_sync());
    cx.block_on_sync()
}

pub fn create_server(cx: &Ctx<'_>) -> Result<Reply, KernelError> {
    let (server, client) = ipc::create_server();
    let server = cx.attach(AnyDescriptor::Server(server))?;
    let client = cx.attach(AnyDescriptor::Client(client))?;
    Ok(Reply::Values(server, client))
}

pub fn submit_accept(cx: &Ctx<'_>, server: u64, hub: u64, function: u64, object: u64) -> Result<Reply, KernelError> {
    let server = cx.server(server)?;
    let op = cx.submit(hub, function, object)?;
    let id = op.async_id();
    server.accept(Arc::clone(cx.thread.universe()), op);
    Ok(submitted(id))
}

pub fn submit_connect(cx: &Ctx<'_>, client: u64, hub: u64, function: u64, object: u64) -> Result<Reply, KernelError> {
    let client = cx.client(client)?;
    let op = cx.submit(hub, function, object)?;
    let id = op.async_id();
    client.connect(Arc::clone(cx.thread.universe()), op);
    Ok(submitted(id))
}

fn message(payload: Payload, request: u64, sequence: u64, flags: MsgFlags) -> Message {
    Message {
        payload,
        request: request.cast_signed(),
        sequence: sequence.cast_signed(),
        response: flags.response(),
    }
}

const fn filter(request: u64, sequence: u64, flags: MsgFlags) -> Filter {
    Filter {
        request: request.cast_signed(),
        sequence: sequence.cast_signed(),
        response: flags.response(),
    }
}
