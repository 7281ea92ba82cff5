// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Resource collaborator seam for file- and device-backed mappings.
//!
//! `mmap` consults only the capability query today: every resource-backed request
//! is refused with [`VmError::Unsupported`](super::VmError::Unsupported), which
//! tells resources that could never be mapped apart from ones whose population is
//! not wired up. A resource-backed object takes a reference through
//! [`Resource::acquire`] when it is built and calls [`Resource::unmap`] when it
//! retires.

extern crate alloc;

use alloc::sync::Arc;

/// An open object (file, device) a mapping could be backed by.
pub trait Resource: Send + Sync {
    /// Returns true if the resource implements the mapping hooks.
    fn can_mmap(&self) -> bool;

    /// Takes a reference on behalf of a new mapping object.
    fn acquire(&self);

    /// Releases `[offset, offset + len)` of the resource once no mapping uses it.
    fn unmap(&self, offset: usize, len: usize);
}

/// Descriptor table consulted by the `mmap` syscall for non-anonymous requests.
pub trait ResourceTable {
    /// Resolves `fd` to the resource it names.
    fn resource(&self, fd: i32) -> Option<Arc<dyn Resource>>;
}

/// Table without any open descriptors.
pub struct NoResources;

impl ResourceTable for NoResources {
    fn resource(&self, _fd: i32) -> Option<Arc<dyn Resource>> {
        None
    }
}
