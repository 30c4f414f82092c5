//! IRQ lines and I/O ports.

use alloc::sync::Arc;

use super::{Ctx, Reply};
use crate::error::KernelError;
use crate::io::{IoSpace, parse_ports};
use crate::universe::AnyDescriptor;

/// Most ports a single `AccessIo` call may name.
const MAX_PORTS: u64 = 1024;

pub fn access_irq(cx: &Ctx<'_>, number: u64) -> Result<Reply, KernelError> {
    let relay = usize::try_from(number)
        .ok()
        .and_then(|n| cx.kernel.irq(n))
        .ok_or(KernelError::IllegalArgs("no such irq line"))?;
    let handle = cx.attach(AnyDescriptor::Irq(Arc::clone(relay)))?;
    Ok(Reply::one(handle))
}

pub fn setup_irq(cx: &Ctx<'_>, irq: u64, mode: u64) -> Result<Reply, KernelError> {
    cx.irq(irq)?.setup(mode);
    Ok(Reply::none())
}

/// Returns how many acknowledgements the line has seen.
pub fn acknowledge_irq(cx: &Ctx<'_>, irq: u64) -> Result<Reply, KernelError> {
    Ok(Reply::one(cx.irq(irq)?.acknowledge()))
}

pub fn submit_wait_for_irq(cx: &Ctx<'_>, irq: u64, hub: u64, function: u64, object: u64) -> Result<Reply, KernelError> {
    let relay = cx.irq(irq)?;
    let op = cx.submit(hub, function, object)?;
    let id = op.async_id();
    relay.submit_wait(op);
    Ok(Reply::one(id.cast_unsigned()))
}

/// `(ports, count) -> handle` where `ports` points at `count` little-endian `u16`s.
pub fn access_io(cx: &Ctx<'_>, ports: u64, count: u64) -> Result<Reply, KernelError> {
    if count == 0 || count > MAX_PORTS {
        return Err(KernelError::IllegalArgs("port count out of range"));
    }
    let bytes = cx.read_user(ports, count * 2)?;
    let space = IoSpace::new(parse_ports(&bytes));
    let handle = cx.attach(AnyDescriptor::Io(Arc::new(space)))?;
    Ok(Reply::one(handle))
}

/// Grant the calling thread the ports of an I/O space.
pub fn enable_io(cx: &Ctx<'_>, io: u64) -> Result<Reply, KernelError> {
    let space = cx.io(io)?;
    cx.thread.grant_ports(space.ports());
    log::debug!("thread {}: {} io ports enabled", cx.thread.id(), space.ports().len());
    Ok(Reply::none())
}

pub fn enable_full_io(cx: &Ctx<'_>) -> Result<Reply, KernelError> {
    cx.thread.grant_all_ports();
    log::warn!("thread {}: full io access enabled", cx.thread.id());
    Ok(Reply::none())
}
