//! Memory objects and address spaces.

use alloc::sync::Arc;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, is_page_aligned};
use kernel_syscall::{
    ALLOC_ON_DEMAND, MAP_FIXED, MAP_PREFER_TOP, MAP_READ_EXECUTE, MAP_READ_WRITE, MAP_SHARE_ON_FORK,
};
use kernel_vmem::{Access, AddressSpace, MapError, MapFlags, MemoryObject};

use super::{Ctx, Reply};
use crate::error::KernelError;
use crate::universe::AnyDescriptor;

const MAP_FLAGS_MASK: u64 = MAP_FIXED | MAP_PREFER_TOP | MAP_READ_WRITE | MAP_READ_EXECUTE | MAP_SHARE_ON_FORK;

fn page_count(size: u64) -> Result<usize, KernelError> {
    if size == 0 || !is_page_aligned(size) {
        return Err(KernelError::IllegalArgs("size is not a non-zero multiple of the page size"));
    }
    usize::try_from(size / PAGE_SIZE).map_err(|_| KernelError::IllegalArgs("size too large"))
}

pub fn allocate(cx: &Ctx<'_>, size: u64, flags: u64) -> Result<Reply, KernelError> {
    if flags & !ALLOC_ON_DEMAND != 0 {
        return Err(KernelError::IllegalArgs("unknown allocation flags"));
    }
    let pages = page_count(size)?;
    let pmm = Arc::clone(cx.kernel.allocator());
    let memory = if flags & ALLOC_ON_DEMAND == 0 {
        MemoryObject::allocated(pmm, pages)?
    } else {
        MemoryObject::on_demand(pmm, pages)
    };
    let handle = cx.attach(AnyDescriptor::Memory(Arc::new(memory)))?;
    Ok(Reply::one(handle))
}

/// `(base, size)`: the range must be reachable and owned by nobody else.
pub fn access_physical(cx: &Ctx<'_>, base: u64, size: u64) -> Result<Reply, KernelError> {
    if !is_page_aligned(base) {
        return Err(KernelError::IllegalArgs("physical base is not page aligned"));
    }
    page_count(size)?;
    let memory = MemoryObject::claim_physical(Arc::clone(cx.kernel.allocator()), PhysicalAddress::new(base), size)?;
    let handle = cx.attach(AnyDescriptor::Memory(Arc::new(memory)))?;
    Ok(Reply::one(handle))
}

pub fn create_space(cx: &Ctx<'_>) -> Result<Reply, KernelError> {
    let space = AddressSpace::create(cx.kernel.kernel_space())?;
    let handle = cx.attach(AnyDescriptor::AddressSpace(Arc::new(space)))?;
    Ok(Reply::one(handle))
}

pub fn fork_space(cx: &Ctx<'_>, space: u64) -> Result<Reply, KernelError> {
    let forked = cx.space(space)?.fork()?;
    let handle = cx.attach(AnyDescriptor::AddressSpace(Arc::new(forked)))?;
    Ok(Reply::one(handle))
}

pub fn map(
    cx: &Ctx<'_>,
    memory: u64,
    space: u64,
    hint: u64,
    offset: u64,
    length: u64,
    flags: u64,
) -> Result<Reply, KernelError> {
    if flags & !MAP_FLAGS_MASK != 0 {
        return Err(KernelError::IllegalArgs("unknown map flags"));
    }
    let flags = MapFlags::from_bits(u32::try_from(flags).map_err(|_| KernelError::IllegalArgs("unknown map flags"))?);
    let memory = cx.memory(memory)?;
    let address = cx.space(space)?.map(memory, VirtualAddress::new(hint), offset, length, flags)?;
    Ok(Reply::one(address.as_u64()))
}

pub fn unmap(cx: &Ctx<'_>, space: u64, address: u64, length: u64) -> Result<Reply, KernelError> {
    cx.space(space)?.unmap(VirtualAddress::new(address), length)?;
    Ok(Reply::none())
}

/// Physical address behind a pointer of the caller, faulting the page in if
/// needed.
pub fn pointer_physical(cx: &Ctx<'_>, pointer: u64) -> Result<Reply, KernelError> {
    let space = cx.thread.space();
    let address = VirtualAddress::new(pointer);
    let pa = match space.translate(address, Access::Read) {
        Ok(pa) => pa,
        Err(code) => {
            if !space.handle_fault(address, code) {
                return Err(MapError::Fault(address).into());
            }
            space
                .translate(address, Access::Read)
                .map_err(|_| MapError::Fault(address))?
        }
    };
    Ok(Reply::one(pa.as_u64()))
}
