//! Resource directory.

use alloc::sync::Arc;

use super::{Ctx, Reply};
use crate::error::KernelError;
use crate::rd::RdFolder;
use crate::universe::AnyDescriptor;

pub fn create(cx: &Ctx<'_>) -> Result<Reply, KernelError> {
    let handle = cx.attach(AnyDescriptor::RdFolder(Arc::new(RdFolder::new())))?;
    Ok(Reply::one(handle))
}

/// `(folder, name, len, mounted)`: attach folder `mounted` under `name`.
pub fn mount(cx: &Ctx<'_>, folder: u64, name: u64, len: u64, mounted: u64) -> Result<Reply, KernelError> {
    let folder = cx.folder(folder)?;
    let name = cx.read_str(name, len)?;
    let AnyDescriptor::RdFolder(mounted) = cx.descriptor(mounted)? else {
        return Err(KernelError::BadDescriptor);
    };
    folder.mount(&name, mounted)?;
    log::debug!("thread {} mounted {name:?}", cx.thread.id());
    Ok(Reply::none())
}

/// `(folder, name, len, handle)`: make the descriptor behind `handle` visible under `name`.
pub fn publish(cx: &Ctx<'_>, folder: u64, name: u64, len: u64, handle: u64) -> Result<Reply, KernelError> {
    let folder = cx.folder(folder)?;
    let name = cx.read_str(name, len)?;
    let descriptor = cx.descriptor(handle)?;
    log::debug!("thread {} published {:?} as {name:?}", cx.thread.id(), descriptor.kind());
    folder.publish(&name, descriptor)?;
    Ok(Reply::none())
}

/// `(path, len) -> handle`, resolved from the caller's root directory.
pub fn open(cx: &Ctx<'_>, path: u64, len: u64) -> Result<Reply, KernelError> {
    let path = cx.read_str(path, len)?;
    let descriptor = cx.thread.directory().open(&path)?;
    let handle = cx.attach(descriptor)?;
    Ok(Reply::one(handle))
}
