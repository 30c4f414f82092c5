//! Universes and threads.

use kernel_memory_addresses::VirtualAddress;
use kernel_syscall::{ABI_SYSTEM_V, ThreadFlags};

use super::{Ctx, Reply};
use crate::error::KernelError;
use crate::thread::ThreadInit;
use crate::universe::AnyDescriptor;

const THREAD_FLAGS_MASK: u32 = 0b111;

pub fn create_universe(cx: &Ctx<'_>) -> Result<Reply, KernelError> {
    let handle = cx.attach(AnyDescriptor::Universe(cx.kernel.create_universe()))?;
    Ok(Reply::one(handle))
}

/// `(universe, space, directory, abi, ip, sp, flags) -> handle`
pub fn create(cx: &Ctx<'_>, a: [u64; 9]) -> Result<Reply, KernelError> {
    let [universe, space, directory, abi, ip, sp, flags, ..] = a;
    if abi != ABI_SYSTEM_V {
        return Err(KernelError::IllegalArgs("unknown thread ABI"));
    }
    let flags = u32::try_from(flags)
        .ok()
        .filter(|f| f & !THREAD_FLAGS_MASK == 0)
        .map(ThreadFlags::from_bits)
        .ok_or(KernelError::IllegalArgs("unknown thread flags"))?;

    let thread = cx.kernel.create_thread(ThreadInit {
        flags,
        universe: cx.universe(universe)?,
        space: cx.space(space)?,
        directory: cx.folder(directory)?,
        ip: VirtualAddress::new(ip),
        sp: VirtualAddress::new(sp),
    });
    if !flags.stopped() {
        cx.kernel.scheduler().enqueue(&thread);
    }
    log::debug!(
        "thread {} created thread {} at ip {ip:#x}{}",
        cx.thread.id(),
        thread.id(),
        if flags.stopped() { " (stopped)" } else { "" }
    );
    let handle = cx.attach(AnyDescriptor::Thread(thread))?;
    Ok(Reply::one(handle))
}

pub fn submit_observe(cx: &Ctx<'_>, thread: u64, hub: u64, function: u64, object: u64) -> Result<Reply, KernelError> {
    let target = cx.target_thread(thread)?;
    let op = cx.submit(hub, function, object)?;
    let id = op.async_id();
    target.observe(op);
    Ok(Reply::one(id.cast_unsigned()))
}

pub fn resume(cx: &Ctx<'_>, thread: u64) -> Result<Reply, KernelError> {
    let target = cx.target_thread(thread)?;
    if !target.resume() {
        return Err(KernelError::IllegalArgs("thread is not stopped"));
    }
    cx.kernel.scheduler().enqueue(&target);
    log::debug!("thread {} resumed thread {}", cx.thread.id(), target.id());
    Ok(Reply::none())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_mask_covers_every_thread_flag() {
        let all = ThreadFlags::new()
            .with_exclusive(true)
            .with_traps_are_fatal(true)
            .with_stopped(true);
        assert_eq!(all.into_bits(), THREAD_FLAGS_MASK);
    }
}
