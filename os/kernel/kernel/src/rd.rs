//! # Resource directory
//!
//! A tree of named entries used for service discovery. Each [`RdFolder`]
//! maps names to a published descriptor or a mounted sub-folder; paths are
//! `/`-separated and resolved through mounts.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use kernel_sync::SpinLock;

use crate::universe::AnyDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RdError {
    #[error("{0:?} already exists")]
    AlreadyExists(String),
    #[error("no such path: {0:?}")]
    NoSuchPath(String),
    #[error("invalid name {0:?}")]
    InvalidName(String),
}

#[derive(Clone)]
enum Entry {
    Published(AnyDescriptor),
    Mounted(Arc<RdFolder>),
}

#[derive(Default)]
pub struct RdFolder {
    entries: SpinLock<BTreeMap<String, Entry>>,
}

impl RdFolder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `descriptor` visible under `name`.
    ///
    /// # Errors
    /// [`RdError::AlreadyExists`] or [`RdError::InvalidName`].
    pub fn publish(&self, name: &str, descriptor: AnyDescriptor) -> Result<(), RdError> {
        self.insert(name, Entry::Published(descriptor))
    }

    /// Attach `folder` under `name`.
    ///
    /// # Errors
    /// [`RdError::AlreadyExists`] or [`RdError::InvalidName`].
    pub fn mount(&self, name: &str, folder: Arc<Self>) -> Result<(), RdError> {
        self.insert(name, Entry::Mounted(folder))
    }

    fn insert(&self, name: &str, entry: Entry) -> Result<(), RdError> {
        if name.is_empty() || name.contains('/') {
            return Err(RdError::InvalidName(name.to_string()));
        }
        self.entries.with_lock_irq(|e| {
            if e.contains_key(name) {
                return Err(RdError::AlreadyExists(name.to_string()));
            }
            e.insert(name.to_string(), entry);
            Ok(())
        })
    }

    /// Resolve `path`. A path ending at a mount yields the folder itself.
    ///
    /// # Errors
    /// [`RdError::NoSuchPath`] if a component is missing or a published
    /// descriptor is traversed like a folder.
    pub fn open(self: &Arc<Self>, path: &str) -> Result<AnyDescriptor, RdError> {
        let missing = || RdError::NoSuchPath(path.to_string());
        let mut folder = Arc::clone(self);
        let mut parts = path.split('/').filter(|p| !p.is_empty()).peekable();
        if parts.peek().is_none() {
            return Err(missing());
        }
        while let Some(name) = parts.next() {
            let entry = folder
                .entries
                .with_lock_irq(|e| e.get(name).cloned())
                .ok_or_else(missing)?;
            match (entry, parts.peek().is_some()) {
                (Entry::Mounted(next), true) => folder = next,
                (Entry::Mounted(last), false) => return Ok(AnyDescriptor::RdFolder(last)),
                (Entry::Published(d), false) => return Ok(d),
                (Entry::Published(_), true) => return Err(missing()),
            }
        }
        Err(missing())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.with_lock_irq(|e| e.len())
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
    use kernel_syscall::DescriptorKind;

    fn io() -> AnyDescriptor {
        AnyDescriptor::Io(Arc::new(IoSpace::new(alloc::vec![0x3F8])))
    }

    #[test]
    fn paths_resolve_through_mounts() {
        let root = Arc::new(RdFolder::new());
        let initrd = Arc::new(RdFolder::new());
        initrd.publish("posix", io()).unwrap();
        root.mount("initrd", Arc::clone(&initrd)).unwrap();

        assert_eq!(root.open("initrd/posix").unwrap().kind(), DescriptorKind::Io);
        assert_eq!(root.open("/initrd/").unwrap().kind(), DescriptorKind::RdFolder);
        assert!(matches!(root.open("initrd/nope"), Err(RdError::NoSuchPath(_))));
        assert!(matches!(root.open("initrd/posix/x"), Err(RdError::NoSuchPath(_))));
        assert!(matches!(root.open(""), Err(RdError::NoSuchPath(_))));
    }

    #[test]
    fn names_are_unique_and_flat() {
        let root = RdFolder::new();
        root.publish("a", io()).unwrap();
        assert_eq!(root.publish("a", io()).unwrap_err(), RdError::AlreadyExists("a".into()));
        assert!(matches!(root.mount("a", Arc::new(RdFolder::new())), Err(RdError::AlreadyExists(_))));
        assert!(matches!(root.publish("a/b", io()), Err(RdError::InvalidName(_))));
        assert_eq!(root.len(), 1);
    }
}
