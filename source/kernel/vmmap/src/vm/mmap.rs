// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Creation, direct physical mapping, removal and listing of mappings
//! OWNERS: @kernel-mm-team
//! PUBLIC API: create_mapping(), map_physical(), remove_mapping(), list_ranges(), RangeInfo
//! DEPENDS_ON: mm::AddressSpace, vm::{RangeRegistry, MapObject}
//! INVARIANTS:
//!   - Anonymous mappings install nothing up front; pages arrive through faults
//!   - A failed operation leaves registry, page table and objects as they were
//!   - Removal plans every cut and checks capacity before touching any record

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};

use super::flags::{MapFlags, Prot};
use super::object::{Backing, MapObject, Sharer};
use super::range::LocalRange;
use super::resource::Resource;
use super::VmError;
use crate::mm::{
    align_down, align_up, is_page_aligned, is_user_range, AddressSpace, MapError, PageTable,
    SpaceState, PAGE_SIZE,
};
use crate::{log_debug, log_error, log_info, log_warn};

/// Snapshot of one local record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeInfo {
    pub base: usize,
    pub length: usize,
    pub offset: usize,
    pub prot: Prot,
    pub flags: MapFlags,
    pub backing: Backing,
}

/// Establishes a new lazily populated mapping and returns its base address.
///
/// Without [`MapFlags::FIXED`] the base is chosen by the space's placement cursor and
/// `addr` is ignored; with it, `addr` is used verbatim after removing whatever was
/// mapped in `[addr, addr + len)`.
pub fn create_mapping(
    space: &Arc<AddressSpace>,
    addr: usize,
    len: usize,
    prot: Prot,
    flags: MapFlags,
    resource: Option<&dyn Resource>,
    offset: usize,
) -> Result<usize, VmError> {
    if len == 0 {
        return Err(VmError::InvalidArgument);
    }
    if let Some(resource) = resource {
        log_warn!(
            target: "vm",
            "VM: resource-backed mapping refused (mappable={})",
            resource.can_mmap()
        );
        return Err(VmError::Unsupported);
    }
    if !flags.contains(MapFlags::ANONYMOUS) {
        return Err(VmError::InvalidArgument);
    }
    if prot.violates_wx() || !is_page_aligned(offset) {
        return Err(VmError::InvalidArgument);
    }
    let length = align_up(len).ok_or(VmError::InvalidArgument)?;
    let fixed = flags.contains(MapFlags::FIXED);
    if fixed && (!is_page_aligned(addr) || addr == 0 || !is_user_range(addr, length)) {
        return Err(VmError::InvalidArgument);
    }

    let shadow = PageTable::new();
    let config = *space.config();
    let mut state = space.lock();
    let base = if fixed {
        addr
    } else {
        state
            .ranges
            .find_free(state.anon_cursor, length, config.guard_bytes(), config.anon_limit)
            .ok_or(VmError::NoMemory)?
    };

    let object = MapObject::new(base, length, offset, Backing::Anonymous, shadow);
    let range = LocalRange::new(object.clone(), base, length, offset, prot, flags);
    object.attach(Sharer {
        range: range.id(),
        space: Arc::downgrade(space),
        window: range.window(),
    })?;
    if fixed {
        unmap_locked(space, &mut state, addr, length, 1)?;
    } else if !state.ranges.has_room(1) {
        return Err(VmError::NoMemory);
    }
    state.ranges.insert(range)?;
    if !fixed {
        state.anon_cursor = (base + length).saturating_add(config.guard_bytes());
    }
    verify_locked(&state);
    log_debug!(
        target: "vm",
        "VM: mmap asid={} base={:#x} len={:#x} prot={:?}{}",
        space.asid(),
        base,
        length,
        prot,
        if fixed { " fixed" } else { "" }
    );
    Ok(base)
}

/// Maps `len` bytes of physical memory at `phys` to `virt`, installing every page now.
///
/// `virt` and `phys` may carry a byte offset, which must agree; the mapping covers the
/// enclosing pages. The occupied window must be free. On failure nothing stays mapped.
pub fn map_physical(
    space: &Arc<AddressSpace>,
    virt: usize,
    phys: usize,
    len: usize,
    prot: Prot,
) -> Result<(), VmError> {
    if len == 0 || prot.violates_wx() {
        return Err(VmError::InvalidArgument);
    }
    let flags = prot.page_flags().ok_or(VmError::InvalidArgument)?;
    let base = align_down(virt);
    let phys_base = align_down(phys);
    if virt - base != phys - phys_base {
        return Err(VmError::InvalidArgument);
    }
    let length = (virt - base)
        .checked_add(len)
        .and_then(align_up)
        .ok_or(VmError::InvalidArgument)?;
    if base == 0 || !is_user_range(base, length) || phys_base.checked_add(length).is_none() {
        return Err(VmError::InvalidArgument);
    }

    let shadow = PageTable::new();
    let mut state = space.lock();
    if state.ranges.overlapping(base, base + length).next().is_some() {
        return Err(VmError::Map(MapError::Overlap));
    }
    if !state.ranges.has_room(1) {
        return Err(VmError::NoMemory);
    }

    let object = MapObject::new(base, length, 0, Backing::Physical, shadow);
    let mut installed = 0;
    let mut failure = None;
    while installed < length {
        let va = base + installed;
        let pa = phys_base + installed;
        if let Err(err) = object.install_unpublished(va, pa, flags) {
            failure = Some(err);
            break;
        }
        if let Err(err) = state.page_table.map(va, pa, flags) {
            failure = Some(err.into());
            break;
        }
        installed += PAGE_SIZE;
    }
    if let Some(err) = failure {
        for off in (0..installed).step_by(PAGE_SIZE) {
            let _ = state.page_table.unmap(base + off);
        }
        object.retire(space.frames());
        log_error!(
            target: "vm",
            "VM: map_physical {:#x}->{:#x} failed after {} pages: {}",
            base,
            phys_base,
            installed / PAGE_SIZE,
            err
        );
        return Err(err);
    }

    let range =
        LocalRange::new(object.clone(), base, length, 0, prot, MapFlags::SHARED | MapFlags::FIXED);
    let sharer =
        Sharer { range: range.id(), space: Arc::downgrade(space), window: range.window() };
    let registered = object.attach(sharer).and_then(|()| state.ranges.insert(range));
    if let Err(err) = registered {
        for off in (0..length).step_by(PAGE_SIZE) {
            let _ = state.page_table.unmap(base + off);
        }
        object.retire(space.frames());
        return Err(err);
    }
    verify_locked(&state);
    log_debug!(
        target: "vm",
        "VM: map_physical asid={} {:#x}->{:#x} len={:#x}",
        space.asid(),
        base,
        phys_base,
        length
    );
    Ok(())
}

/// Removes every mapping in `[addr, addr + len)`, trimming or splitting records that
/// straddle the boundaries. Unmapped holes inside the window are not an error.
pub fn remove_mapping(space: &AddressSpace, addr: usize, len: usize) -> Result<(), VmError> {
    if len == 0 || !is_page_aligned(addr) {
        return Err(VmError::InvalidArgument);
    }
    let length = align_up(len).ok_or(VmError::InvalidArgument)?;
    if !is_user_range(addr, length) {
        return Err(VmError::InvalidArgument);
    }
    let mut state = space.lock();
    unmap_locked(space, &mut state, addr, length, 0)?;
    verify_locked(&state);
    log_debug!(target: "vm", "VM: munmap asid={} {:#x}+{:#x}", space.asid(), addr, length);
    Ok(())
}

/// Snapshot of every record of `space`, ordered by base address.
pub fn list_ranges(space: &AddressSpace) -> Vec<RangeInfo> {
    let state = space.lock();
    let infos: Vec<RangeInfo> = state
        .ranges
        .iter()
        .map(|range| RangeInfo {
            base: range.base(),
            length: range.length(),
            offset: range.offset(),
            prot: range.prot(),
            flags: range.flags(),
            backing: range.object().backing(),
        })
        .collect();
    for info in &infos {
        log_info!(
            target: "vm",
            "VM: asid={} {:#x}-{:#x} off={:#x} prot={:?} {:?}",
            space.asid(),
            info.base,
            info.base + info.length,
            info.offset,
            info.prot,
            info.backing
        );
    }
    infos
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CutShape {
    Whole,
    Front,
    Back,
    Interior,
}

#[derive(Clone, Copy, Debug)]
struct Cut {
    base: usize,
    start: usize,
    end: usize,
    shape: CutShape,
}

/// Removes `[addr, addr + length)` with the state lock held, leaving room for
/// `reserve` additional records afterwards.
pub(crate) fn unmap_locked(
    space: &AddressSpace,
    state: &mut SpaceState,
    addr: usize,
    length: usize,
    reserve: usize,
) -> Result<(), VmError> {
    let end = addr.checked_add(length).ok_or(VmError::InvalidArgument)?;
    let mut cuts = Vec::new();
    for range in state.ranges.overlapping(addr, end) {
        let start = addr.max(range.base());
        let stop = end.min(range.end());
        let shape = match (start == range.base(), stop == range.end()) {
            (true, true) => CutShape::Whole,
            (true, false) => CutShape::Front,
            (false, true) => CutShape::Back,
            (false, false) => CutShape::Interior,
        };
        cuts.try_reserve(1).map_err(|_| VmError::NoMemory)?;
        cuts.push(Cut { base: range.base(), start, end: stop, shape });
    }

    let wholes = cuts.iter().filter(|cut| cut.shape == CutShape::Whole).count();
    let splits = cuts.iter().filter(|cut| cut.shape == CutShape::Interior).count();
    let after = state.ranges.len() - wholes + splits + reserve;
    if after > state.ranges.capacity() {
        log_warn!(
            target: "vm",
            "VM: munmap {:#x}..{:#x} needs {} records, capacity {}",
            addr,
            end,
            after,
            state.ranges.capacity()
        );
        return Err(VmError::NoMemory);
    }
    for cut in cuts.iter().filter(|cut| cut.shape == CutShape::Interior) {
        if let Some(range) = state.ranges.get(cut.base) {
            range.object().reserve_sharers(1)?;
        }
    }

    let frames = space.frames();
    for cut in cuts {
        let Some(mut range) = state.ranges.remove(cut.base) else { continue };
        for (va, _, _) in state.page_table.leaves_in(cut.start, cut.end) {
            let _ = state.page_table.unmap(va);
        }
        let object = range.object().clone();
        let rel_start = range.object_start() + (cut.start - range.base());
        let rel_end = rel_start + (cut.end - cut.start);
        match cut.shape {
            CutShape::Whole => {
                let remaining = object.detach(range.id());
                drop(range);
                if remaining == 0 {
                    object.retire(frames);
                } else {
                    object.release_uncovered(rel_start, rel_end, frames);
                }
                continue;
            }
            CutShape::Front => {
                range.trim_front(cut.end);
                object.update_window(range.id(), range.window());
            }
            CutShape::Back => {
                range.truncate(cut.start);
                object.update_window(range.id(), range.window());
            }
            CutShape::Interior => {
                let mut tail = range.split_off(cut.start);
                tail.trim_front(cut.end);
                object.split_sharer(range.id(), range.window(), tail.id(), tail.window())?;
                state.ranges.insert(tail)?;
            }
        }
        state.ranges.insert(range)?;
        object.release_uncovered(rel_start, rel_end, frames);
    }
    Ok(())
}

fn verify_locked(state: &SpaceState) {
    if cfg!(any(debug_assertions, feature = "debug_vm_verify")) {
        if let Err(violation) = state.ranges.verify() {
            log_error!(target: "vm", "VM-VERIFY: {}", violation);
        }
    }
}
