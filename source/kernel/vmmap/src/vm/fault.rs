// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Demand-paging fault resolver for anonymous mappings
//! OWNERS: @kernel-mm-team
//! PUBLIC API: handle_page_fault(), PageFault, FaultKind, FaultOutcome, CurrentSpace
//! DEPENDS_ON: mm::{AddressSpace, FrameAllocator}, vm::MapObject::install_page
//! INVARIANTS:
//!   - The address-space lock is released before frames are allocated
//!   - A frame that loses the install race goes back to the allocator
//!   - Protection faults and addresses outside every record are never resolved here

extern crate alloc;

use alloc::sync::Arc;

use super::flags::{leaf_permits, Access};
use super::object::Backing;
use crate::mm::{align_down, AddressSpace};
use crate::{log_debug, log_trace, log_warn};

/// Why the hardware raised the fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// No valid leaf translated the address.
    NotPresent,
    /// A leaf exists but forbids the access.
    Protection,
}

/// Decoded page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    pub addr: usize,
    pub kind: FaultKind,
    pub access: Access,
}

/// RISC-V `scause` for an instruction page fault.
pub const SCAUSE_INSTRUCTION_PAGE_FAULT: usize = 12;
/// RISC-V `scause` for a load page fault.
pub const SCAUSE_LOAD_PAGE_FAULT: usize = 13;
/// RISC-V `scause` for a store/AMO page fault.
pub const SCAUSE_STORE_PAGE_FAULT: usize = 15;

impl PageFault {
    pub const fn new(addr: usize, kind: FaultKind, access: Access) -> Self {
        Self { addr, kind, access }
    }

    /// Decodes an x86 page-fault error code (P, W/R and I/D bits).
    pub fn from_x86(addr: usize, code: usize) -> Self {
        let kind = if code & 0x1 != 0 { FaultKind::Protection } else { FaultKind::NotPresent };
        let access = if code & 0x10 != 0 {
            Access::Execute
        } else if code & 0x2 != 0 {
            Access::Write
        } else {
            Access::Read
        };
        Self { addr, kind, access }
    }

    /// Decodes a RISC-V page-fault trap; `None` for causes that are not page faults.
    ///
    /// Sv39 does not report whether a leaf was present, so the fault is treated as
    /// not-present and the resolver tells a real violation from a stale one by looking
    /// at the installed leaf.
    pub fn from_riscv(scause: usize, stval: usize) -> Option<Self> {
        let access = match scause {
            SCAUSE_INSTRUCTION_PAGE_FAULT => Access::Execute,
            SCAUSE_LOAD_PAGE_FAULT => Access::Read,
            SCAUSE_STORE_PAGE_FAULT => Access::Write,
            _ => return None,
        };
        Some(Self { addr: stval, kind: FaultKind::NotPresent, access })
    }
}

/// What the resolver did with a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A page is now present; the faulting access can be retried.
    Resolved,
    /// The fault is not a demand-paging event; the caller must deliver it.
    NotMine,
}

/// Supplies the address space of the faulting context.
pub trait CurrentSpace {
    fn current_space(&self) -> Option<Arc<AddressSpace>>;
}

impl<F> CurrentSpace for F
where
    F: Fn() -> Option<Arc<AddressSpace>>,
{
    fn current_space(&self) -> Option<Arc<AddressSpace>> {
        self()
    }
}

/// Resolves `fault` in the current address space by installing a fresh anonymous frame.
pub fn handle_page_fault(current: &dyn CurrentSpace, fault: PageFault) -> FaultOutcome {
    if fault.kind == FaultKind::Protection {
        log_trace!(target: "fault", "PF: protection fault at {:#x}", fault.addr);
        return FaultOutcome::NotMine;
    }
    let Some(space) = current.current_space() else {
        return FaultOutcome::NotMine;
    };
    resolve(&space, fault)
}

/// Resolves `fault` against `space` directly.
pub fn resolve(space: &AddressSpace, fault: PageFault) -> FaultOutcome {
    let page = align_down(fault.addr);
    let (object, object_va, prot) = {
        let state = space.lock();
        if let Some((_, flags)) = state.page_table.leaf(page) {
            // Another context installed the page after the trap was taken.
            return if leaf_permits(flags, fault.access) {
                FaultOutcome::Resolved
            } else {
                FaultOutcome::NotMine
            };
        }
        let Some(found) = state.ranges.locate(fault.addr) else {
            log_trace!(target: "fault", "PF: {:#x} outside every range", fault.addr);
            return FaultOutcome::NotMine;
        };
        let range = found.range;
        if !range.prot().permits(fault.access) {
            log_debug!(
                target: "fault",
                "PF: {:?} at {:#x} denied by prot {:?}",
                fault.access,
                fault.addr,
                range.prot()
            );
            return FaultOutcome::NotMine;
        }
        if range.object().backing() != Backing::Anonymous {
            return FaultOutcome::NotMine;
        }
        (range.object().clone(), range.object_va(fault.addr), range.prot())
    };

    let frames = space.frames();
    let Some(frame) = frames.allocate_frames(1) else {
        log_warn!(target: "fault", "PF: out of frames at {:#x}", fault.addr);
        return FaultOutcome::NotMine;
    };
    match object.install_page(object_va, frame, prot) {
        Ok(installed) => {
            if installed != frame {
                frames.free_frames(frame, 1);
            }
            log_trace!(
                target: "fault",
                "PF: asid={} {:#x} -> {:#x}",
                space.asid(),
                page,
                installed
            );
            FaultOutcome::Resolved
        }
        Err(err) => {
            if object.frame_at(object_va) != Some(frame) {
                frames.free_frames(frame, 1);
            }
            log_warn!(target: "fault", "PF: install at {:#x} failed: {}", fault.addr, err);
            FaultOutcome::NotMine
        }
    }
}
