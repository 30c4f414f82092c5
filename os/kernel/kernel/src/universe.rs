//! # Universes
//!
//! A universe is a capability table: small integer handles mapped to
//! [`AnyDescriptor`]s. Handles are allocated monotonically from 1 and never
//! reused; `0` means "none" (or "the caller's own object" where a syscall
//! accepts it).

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use kernel_sync::SpinLock;
use kernel_syscall::{DescriptorKind, Handle};
use kernel_vmem::{AddressSpace, MemoryObject};

use crate::event::EventHub;
use crate::io::IoSpace;
use crate::ipc::{ClientEndpoint, PipeEndpoint, RingBuffer, ServerEndpoint};
use crate::irq::IrqRelay;
use crate::rd::RdFolder;
use crate::thread::Thread;

/// Default bound on live descriptors per universe.
pub const MAX_DESCRIPTORS: usize = 1024;

/// A reference to a kernel object, as held by a universe.
///
/// Cloning clones the reference, never the object.
#[derive(Clone)]
pub enum AnyDescriptor {
    Memory(Arc<MemoryObject>),
    AddressSpace(Arc<AddressSpace>),
    Thread(Arc<Thread>),
    Universe(Arc<Universe>),
    EventHub(Arc<EventHub>),
    Ring(Arc<RingBuffer>),
    Pipe(PipeEndpoint),
    Server(ServerEndpoint),
    Client(ClientEndpoint),
    RdFolder(Arc<RdFolder>),
    Irq(Arc<IrqRelay>),
    Io(Arc<IoSpace>),
}

impl AnyDescriptor {
    #[must_use]
    pub const fn kind(&self) -> DescriptorKind {
        match self {
            Self::Memory(_) => DescriptorKind::Memory,
            Self::AddressSpace(_) => DescriptorKind::AddressSpace,
            Self::Thread(_) => DescriptorKind::Thread,
            Self::Universe(_) => DescriptorKind::Universe,
            Self::EventHub(_) => DescriptorKind::EventHub,
            Self::Ring(_) => DescriptorKind::Ring,
            Self::Pipe(_) => DescriptorKind::Pipe,
            Self::Server(_) => DescriptorKind::Server,
            Self::Client(_) => DescriptorKind::Client,
            Self::RdFolder(_) => DescriptorKind::RdFolder,
            Self::Irq(_) => DescriptorKind::Irq,
            Self::Io(_) => DescriptorKind::Io,
        }
    }
}

impl core::fmt::Debug for AnyDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "AnyDescriptor::{:?}", self.kind())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UniverseError {
    #[error("no descriptor with handle {0}")]
    NoDescriptor(Handle),
    #[error("descriptor table is full")]
    NoSlots,
}

struct Table {
    next: Handle,
    descriptors: BTreeMap<Handle, AnyDescriptor>,
}

pub struct Universe {
    limit: usize,
    table: SpinLock<Table>,
}

impl Universe {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            table: SpinLock::new(Table {
                next: 1,
                descriptors: BTreeMap::new(),
            }),
        }
    }

    /// Store `descriptor` under a fresh handle.
    ///
    /// # Errors
    /// [`UniverseError::NoSlots`] if the table is full.
    pub fn attach(&self, descriptor: AnyDescriptor) -> Result<Handle, UniverseError> {
        self.table.with_lock_irq(|t| {
            if t.descriptors.len() >= self.limit {
                return Err(UniverseError::NoSlots);
            }
            let handle = t.next;
            t.next += 1;
            t.descriptors.insert(handle, descriptor);
            Ok(handle)
        })
    }

    /// A clone of the descriptor behind `handle`.
    ///
    /// # Errors
    /// [`UniverseError::NoDescriptor`] for unknown handles.
    pub fn get(&self, handle: Handle) -> Result<AnyDescriptor, UniverseError> {
        self.table.with_lock_irq(|t| {
            t.descriptors
                .get(&handle)
                .cloned()
                .ok_or(UniverseError::NoDescriptor(handle))
        })
    }

    /// Remove `handle` and hand its descriptor back, so the last reference
    /// is dropped outside the table lock.
    ///
    /// # Errors
    /// [`UniverseError::NoDescriptor`] for unknown handles.
    pub fn detach(&self, handle: Handle) -> Result<AnyDescriptor, UniverseError> {
        self.table
            .with_lock_irq(|t| t.descriptors.remove(&handle))
            .ok_or(UniverseError::NoDescriptor(handle))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.with_lock_irq(|t| t.descriptors.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoSpace;

    fn io() -> AnyDescriptor {
        AnyDescriptor::Io(Arc::new(IoSpace::new(alloc::vec![0x60])))
    }

    #[test]
    fn handles_are_never_reused() {
        let u = Universe::new(8);
        let a = u.attach(io()).unwrap();
        let b = u.attach(io()).unwrap();
        assert_eq!((a, b), (1, 2));
        u.detach(a).unwrap();
        assert_eq!(u.attach(io()).unwrap(), 3);
        assert!(matches!(u.get(a), Err(UniverseError::NoDescriptor(1))));
        assert_eq!(u.get(b).unwrap().kind(), DescriptorKind::Io);
    }

    #[test]
    fn full_table_is_recoverable() {
        let u = Universe::new(2);
        u.attach(io()).unwrap();
        let b = u.attach(io()).unwrap();
        assert_eq!(u.attach(io()).unwrap_err(), UniverseError::NoSlots);
        u.detach(b).unwrap();
        assert!(u.attach(io()).is_ok());
        assert_eq!(u.len(), 2);
    }
}
