// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Demand-paged user mappings layered on the Sv39 primitives in `mm`
//! OWNERS: @kernel-mm-team
//! PUBLIC API: create_mapping, map_physical, remove_mapping, list_ranges,
//!             install_page, handle_page_fault
//! DEPENDS_ON: mm::{AddressSpace, PageTable, FrameAllocator}
//! INVARIANTS: see range.rs (per-space records), object.rs (shared objects),
//!             fault.rs (resolver)

mod error;
mod fault;
mod flags;
mod mmap;
mod object;
mod range;
mod resource;

pub use error::{VmError, EINVAL, ENODEV, ENOMEM};
pub use fault::{
    handle_page_fault, resolve, CurrentSpace, FaultKind, FaultOutcome, PageFault,
    SCAUSE_INSTRUCTION_PAGE_FAULT, SCAUSE_LOAD_PAGE_FAULT, SCAUSE_STORE_PAGE_FAULT,
};
pub use flags::{Access, MapFlags, Prot};
pub use mmap::{create_mapping, list_ranges, map_physical, remove_mapping, RangeInfo};
pub use object::{Backing, MapObject, ObjectId};
pub use range::{LocalRange, Located, RangeId, RangeRegistry};
pub use resource::{NoResources, Resource, ResourceTable};

pub(crate) use object::Sharer;

/// Installs `phys` for the object page at `object_va` in every address space that
/// maps it; see [`MapObject::install_page`].
pub fn install_page(
    object: &MapObject,
    object_va: usize,
    phys: usize,
    prot: Prot,
) -> Result<usize, VmError> {
    object.install_page(object_va, phys, prot)
}


#[cfg(test)]
mod tests_prop;
