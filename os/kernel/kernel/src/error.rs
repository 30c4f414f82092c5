use kernel_alloc::FrameAllocError;
use kernel_syscall::Error;
use kernel_vmem::{MapError, MemoryError};

use crate::elf::ElfError;
use crate::rd::RdError;
use crate::universe::UniverseError;

/// Everything a kernel operation can fail with.
///
/// Syscalls return this and the dispatcher turns it into the ABI error word.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("unknown syscall {0}")]
    IllegalSyscall(u64),
    #[error("illegal argument: {0}")]
    IllegalArgs(&'static str),
    #[error("handle refers to the wrong kind of descriptor")]
    BadDescriptor,
    #[error("no such cpu {0}")]
    NoSuchCpu(usize),
    #[error(transparent)]
    Universe(#[from] UniverseError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Frames(#[from] FrameAllocError),
    #[error(transparent)]
    Rd(#[from] RdError),
    #[error(transparent)]
    Elf(#[from] ElfError),
    #[error("completed with {0}")]
    Abi(Error),
}

impl From<KernelError> for Error {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::IllegalSyscall(_) => Self::IllegalSyscall,
            KernelError::IllegalArgs(_) | KernelError::NoSuchCpu(_) | KernelError::Elf(_) => Self::IllegalArgs,
            KernelError::BadDescriptor => Self::BadDescriptor,
            KernelError::Universe(UniverseError::NoDescriptor(_)) => Self::NoDescriptor,
            KernelError::Universe(UniverseError::NoSlots) => Self::NoDescriptorSlots,
            KernelError::Map(e) => map_error(e),
            KernelError::Memory(e) => memory_error(e),
            KernelError::Frames(e) => frame_error(e),
            KernelError::Rd(RdError::AlreadyExists(_)) => Self::AlreadyExists,
            KernelError::Rd(RdError::NoSuchPath(_)) => Self::NoSuchPath,
            KernelError::Rd(RdError::InvalidName(_)) => Self::IllegalArgs,
            KernelError::Abi(e) => e,
        }
    }
}

const fn map_error(e: MapError) -> Error {
    match e {
        MapError::Overlap => Error::AlreadyMapped,
        MapError::NoSpace => Error::NoMemory,
        MapError::Fault(_) => Error::Fault,
        MapError::Memory(e) => memory_error(e),
        MapError::Frames(e) => frame_error(e),
        MapError::OutOfRange
        | MapError::NotMapped
        | MapError::WriteExecute
        | MapError::NoPermission
        | MapError::Unaligned => Error::IllegalArgs,
    }
}

const fn memory_error(e: MemoryError) -> Error {
    match e {
        MemoryError::OutOfRange { .. } | MemoryError::NotResizable => Error::IllegalArgs,
        MemoryError::Frames(f) => frame_error(f),
    }
}

const fn frame_error(e: FrameAllocError) -> Error {
    match e {
        FrameAllocError::OutOfMemory => Error::NoMemory,
        _ => Error::IllegalArgs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::VirtualAddress;

    #[test]
    fn boundary_codes() {
        let cases: [(KernelError, Error); 7] = [
            (KernelError::IllegalSyscall(999), Error::IllegalSyscall),
            (UniverseError::NoDescriptor(4).into(), Error::NoDescriptor),
            (UniverseError::NoSlots.into(), Error::NoDescriptorSlots),
            (MapError::Overlap.into(), Error::AlreadyMapped),
            (MapError::Fault(VirtualAddress::new(0x1000)).into(), Error::Fault),
            (MemoryError::Frames(FrameAllocError::OutOfMemory).into(), Error::NoMemory),
            (RdError::NoSuchPath("x".into()).into(), Error::NoSuchPath),
        ];
        for (k, abi) in cases {
            assert_eq!(Error::from(k), abi);
        }
    }
}
