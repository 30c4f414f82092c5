//! # Loading the first user program
//!
//! Every non-empty `PT_LOAD` segment gets its own eagerly allocated memory
//! object, zero-filled, with the file bytes copied in at the segment's page offset.
//! It is mapped at its link address, read-write for `R|W` segments and
//! read-execute for `R|X` segments. The stack is an on-demand object near the
//! top of the user half.

use alloc::sync::Arc;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_down, align_up, pages_for};
use kernel_syscall::ThreadFlags;
use kernel_vmem::{AddressSpace, MapFlags, MemoryObject};

use crate::elf::{ElfError, ElfView, PFlags, PT_GNU_EH_FRAME, PT_GNU_STACK, PT_LOAD, ProgramHeader};
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::thread::{Thread, ThreadInit};

/// Load `image` into a fresh address space and enqueue its first thread.
///
/// The thread gets a fresh universe, the kernel's root directory and the
/// `exclusive | traps_are_fatal` flags.
///
/// # Errors
/// - [`KernelError::Elf`] for a malformed image, a segment that is neither
///   `R|W` nor `R|X` or an unsupported segment type.
/// - Memory errors while allocating or mapping.
pub fn execute_module(kernel: &Kernel, image: &[u8]) -> Result<Arc<Thread>, KernelError> {
    let elf = ElfView::parse(image)?;
    let space = Arc::new(AddressSpace::create(kernel.kernel_space())?);

    for ph in elf.program_headers() {
        match ph.p_type {
            PT_LOAD => load_segment(kernel, &space, image, &ph)?,
            PT_GNU_EH_FRAME | PT_GNU_STACK => {}
            other => return Err(ElfError::UnsupportedSegment(other).into()),
        }
    }

    let stack_pages = usize::try_from(pages_for(kernel.config().stack_size))
        .map_err(|_| KernelError::IllegalArgs("stack too large"))?;
    let stack = Arc::new(MemoryObject::on_demand(Arc::clone(kernel.allocator()), stack_pages));
    let stack_len = stack.length();
    let stack_base = space.map(
        stack,
        VirtualAddress::zero(),
        0,
        stack_len,
        MapFlags::new().with_prefer_top(true).with_read_write(true),
    )?;
    let sp = stack_base
        .checked_add(stack_len)
        .ok_or(KernelError::IllegalArgs("stack outside the user half"))?;

    let thread = kernel.create_thread(ThreadInit {
        flags: ThreadFlags::new().with_exclusive(true).with_traps_are_fatal(true),
        universe: kernel.create_universe(),
        space,
        directory: Arc::clone(kernel.root_directory()),
        ip: elf.entry(),
        sp,
    });
    log::info!(
        "loaded module: entry {}, stack {}..{}, thread {}",
        elf.entry(),
        stack_base,
        sp,
        thread.id()
    );
    kernel.scheduler().enqueue(&thread);
    Ok(thread)
}

fn load_segment(
    kernel: &Kernel,
    space: &AddressSpace,
    image: &[u8],
    ph: &ProgramHeader,
) -> Result<(), KernelError> {
    if ph.p_memsz == 0 {
        log::debug!("segment {}: empty, skipped", ph.p_vaddr);
        return Ok(());
    }
    let flags = if ph.p_flags == PFlags::RW {
        MapFlags::new().with_read_write(true)
    } else if ph.p_flags == PFlags::RX {
        MapFlags::new().with_read_execute(true)
    } else {
        return Err(ElfError::IllegalPermissions(ph.p_flags).into());
    };

    let vaddr = ph.p_vaddr.as_u64();
    let end = vaddr.checked_add(ph.p_memsz).ok_or(ElfError::OutOfBounds)?;
    let base = align_down(vaddr, PAGE_SIZE);
    let length = align_up(end, PAGE_SIZE) - base;
    let pages = usize::try_from(length / PAGE_SIZE).map_err(|_| ElfError::OutOfBounds)?;

    let memory = Arc::new(MemoryObject::allocated(Arc::clone(kernel.allocator()), pages)?);
    memory.copy_into(vaddr - base, ph.file_bytes(image)?)?;
    space.map(memory, VirtualAddress::new(base), 0, length, flags.with_fixed(true))?;
    log::debug!("segment {}: {} bytes, {flags:?}", ph.p_vaddr, ph.p_memsz);
    Ok(())
}
