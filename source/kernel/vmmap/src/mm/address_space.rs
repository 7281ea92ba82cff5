// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Sv39 address spaces, their mapping registries and ASID allocation
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace, AddressSpaceManager, AsHandle, AddressSpaceError
//! DEPENDS_ON: mm::PageTable, mm::FrameAllocator, vm::{RangeRegistry, MapObject}
//! INVARIANTS:
//!   - Every leaf in the page table lies inside a registered local range
//!   - Page table, registry and placement cursor change only under the state lock
//!   - Dropping or destroying a space detaches all of its records

extern crate alloc;

use alloc::{collections::BTreeSet, sync::Arc, vec::Vec};
use core::num::NonZeroU32;

use spin::{Mutex, MutexGuard};
use thiserror::Error;

use super::frame::FrameAllocator;
use super::page_table::{MapError, PageFlags, PageTable, PAGE_SIZE};
use crate::config::VmConfig;
use crate::vm::{RangeId, RangeRegistry, Sharer, VmError};
use crate::{log_debug, log_info};

/// Maximum ASIDs made available by the allocator.
const MAX_ASIDS: usize = 256;
const WORD_BITS: usize = core::mem::size_of::<u64>() * 8;
const BITMAP_WORDS: usize = (MAX_ASIDS + WORD_BITS - 1) / WORD_BITS;

static_assertions::assert_impl_all!(AddressSpace: Send, Sync);

/// Handle referencing a tracked address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AsHandle(NonZeroU32);

impl AsHandle {
    /// Creates a handle from the backing table index.
    fn from_index(index: usize) -> Self {
        // SAFETY: index is offset by one, ensuring the raw value is never zero.
        unsafe { Self(NonZeroU32::new_unchecked(index as u32 + 1)) }
    }

    /// Returns the table index backing this handle.
    fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    /// Constructs a handle from a raw value provided by userspace.
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Returns the raw representation of the handle.
    pub fn to_raw(self) -> u32 {
        self.0.get()
    }
}

/// Errors reported while managing address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AddressSpaceError {
    /// Provided handle was not recognised.
    #[error("invalid address-space handle")]
    InvalidHandle,
    /// No more ASIDs are available.
    #[error("ASIDs exhausted")]
    AsidExhausted,
    /// Address space still has outstanding task references.
    #[error("address space in use")]
    InUse,
    /// A mapping operation on the space failed.
    #[error("mapping: {0}")]
    Vm(#[from] VmError),
}

impl From<MapError> for AddressSpaceError {
    fn from(value: MapError) -> Self {
        Self::Vm(VmError::Map(value))
    }
}

/// Mutable part of an address space, guarded by its lock.
pub struct SpaceState {
    pub(crate) page_table: PageTable,
    pub(crate) ranges: RangeRegistry,
    /// Next candidate base for non-fixed mappings.
    pub(crate) anon_cursor: usize,
    owners: BTreeSet<u32>,
}

impl SpaceState {
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn ranges(&self) -> &RangeRegistry {
        &self.ranges
    }

    pub fn anon_cursor(&self) -> usize {
        self.anon_cursor
    }
}

/// One user address space.
pub struct AddressSpace {
    asid: u16,
    config: VmConfig,
    frames: Arc<dyn FrameAllocator>,
    state: Mutex<SpaceState>,
}

impl AddressSpace {
    /// Creates a standalone space; [`AddressSpaceManager::create`] is the usual entry point.
    pub fn new(asid: u16, config: VmConfig, frames: Arc<dyn FrameAllocator>) -> Arc<Self> {
        Arc::new(Self {
            asid,
            config,
            frames,
            state: Mutex::new(SpaceState {
                page_table: PageTable::new(),
                ranges: RangeRegistry::new(config.max_ranges),
                anon_cursor: config.anon_base,
                owners: BTreeSet::new(),
            }),
        })
    }

    /// Returns the hardware ASID backing this address space.
    pub fn asid(&self) -> u16 {
        self.asid
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &dyn FrameAllocator {
        &*self.frames
    }

    /// Acquires the state lock.
    pub fn lock(&self) -> MutexGuard<'_, SpaceState> {
        self.state.lock()
    }

    /// Returns the SATP value describing this address space.
    pub fn satp_value(&self) -> usize {
        const MODE_SV39: usize = 8;
        let mode = MODE_SV39 << 60;
        let asid = (self.asid as usize) << 44;
        let ppn = self.state.lock().page_table.root_ppn();
        mode | asid | ppn
    }

    /// Translates a user address through the page table.
    pub fn translate(&self, va: usize) -> Option<usize> {
        self.state.lock().page_table.translate(va)
    }

    /// Leaf flags installed for the page holding `va`.
    pub fn leaf_flags(&self, va: usize) -> Option<PageFlags> {
        self.state.lock().page_table.leaf(va & !(PAGE_SIZE - 1)).map(|(_, flags)| flags)
    }

    pub fn range_count(&self) -> usize {
        self.state.lock().ranges.len()
    }

    /// Maps `pa` at `va` for the record `range`, if that record still covers `va`.
    ///
    /// A leaf that already points at `pa` is accepted; a record that went away in the
    /// meantime is skipped silently.
    pub(crate) fn install_for_range(
        &self,
        range: RangeId,
        va: usize,
        pa: usize,
        flags: PageFlags,
    ) -> Result<(), VmError> {
        let mut state = self.state.lock();
        match state.ranges.locate(va) {
            Some(found) if found.range.id() == range => {}
            _ => return Ok(()),
        }
        match state.page_table.leaf(va) {
            Some((existing, _)) if existing == pa => Ok(()),
            Some(_) => Err(VmError::Map(MapError::Overlap)),
            None => Ok(state.page_table.map(va, pa, flags)?),
        }
    }

    /// Gives `child` a record for every record of `self`, sharing the same objects,
    /// and copies the pages already installed for them.
    fn fork_into(self: &Arc<Self>, child: &Arc<AddressSpace>) -> Result<(), VmError> {
        let parent = self.state.lock();
        let mut state = child.state.lock();
        if !state.ranges.has_room(parent.ranges.len()) {
            return Err(VmError::NoMemory);
        }
        for range in parent.ranges.iter() {
            range.object().reserve_sharers(1)?;
        }
        state.anon_cursor = parent.anon_cursor;

        let mut copies = Vec::new();
        copies.try_reserve(parent.ranges.len()).map_err(|_| VmError::NoMemory)?;
        for range in parent.ranges.iter() {
            let copy = range.duplicate();
            let (id, window, prot) = (copy.id(), copy.window(), copy.prot());
            let object = copy.object().clone();
            state.ranges.insert(copy)?;
            object.attach(Sharer { range: id, space: Arc::downgrade(child), window })?;
            copies.push((object, window, prot));
        }
        drop(parent);

        for (object, window, prot) in copies {
            let Some(flags) = prot.page_flags() else { continue };
            for (va, pa) in object.pages_in(window) {
                match state.page_table.leaf(va) {
                    Some(_) => {}
                    None => state.page_table.map(va, pa, flags)?,
                }
            }
        }
        log_debug!(
            target: "as",
            "AS: fork asid={} -> asid={} ranges={}",
            self.asid,
            child.asid,
            state.ranges.len()
        );
        Ok(())
    }

    /// Unmaps every page and detaches every record from its object.
    pub fn teardown(&self) {
        let mut state = self.state.lock();
        teardown_locked(&mut state, &*self.frames);
    }
}

fn teardown_locked(state: &mut SpaceState, frames: &dyn FrameAllocator) {
    for (va, _, _) in state.page_table.leaves() {
        let _ = state.page_table.unmap(va);
    }
    for range in state.ranges.drain() {
        let object = range.object().clone();
        let window = range.window();
        if object.detach(range.id()) == 0 {
            object.retire(frames);
        } else {
            object.release_uncovered(window.start, window.start + window.length, frames);
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let frames = self.frames.clone();
        teardown_locked(self.state.get_mut(), &*frames);
    }
}

/// Manages the collection of user address spaces and allocates ASIDs.
pub struct AddressSpaceManager {
    spaces: Vec<Option<Arc<AddressSpace>>>,
    asids: AsidAllocator,
    config: VmConfig,
    frames: Arc<dyn FrameAllocator>,
}

impl AddressSpaceManager {
    /// Creates an empty manager with the default placement parameters.
    pub fn new(frames: Arc<dyn FrameAllocator>) -> Self {
        Self::with_config(frames, VmConfig::DEFAULT)
    }

    pub fn with_config(frames: Arc<dyn FrameAllocator>, config: VmConfig) -> Self {
        Self { spaces: Vec::new(), asids: AsidAllocator::new(), config, frames }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Allocates a fresh address space and returns its handle.
    pub fn create(&mut self) -> Result<AsHandle, AddressSpaceError> {
        let asid = self.asids.allocate().ok_or(AddressSpaceError::AsidExhausted)?;
        let space = AddressSpace::new(asid, self.config, self.frames.clone());
        Ok(self.insert(space))
    }

    fn insert(&mut self, space: Arc<AddressSpace>) -> AsHandle {
        for (index, slot) in self.spaces.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(space);
                return AsHandle::from_index(index);
            }
        }
        self.spaces.push(Some(space));
        AsHandle::from_index(self.spaces.len() - 1)
    }

    /// Returns the address space identified by `handle`.
    pub fn get(&self, handle: AsHandle) -> Result<&Arc<AddressSpace>, AddressSpaceError> {
        self.spaces
            .get(handle.index())
            .and_then(|slot| slot.as_ref())
            .ok_or(AddressSpaceError::InvalidHandle)
    }

    /// Records that `pid` references the provided address space.
    #[must_use]
    pub fn attach(&mut self, handle: AsHandle, pid: u32) -> Result<(), AddressSpaceError> {
        self.get(handle)?.state.lock().owners.insert(pid);
        Ok(())
    }

    /// Drops the reference held by `pid` for `handle`.
    #[must_use]
    pub fn detach(&mut self, handle: AsHandle, pid: u32) -> Result<(), AddressSpaceError> {
        self.get(handle)?.state.lock().owners.remove(&pid);
        Ok(())
    }

    /// Creates a child space sharing every mapping object of `parent`.
    pub fn fork(&mut self, parent: AsHandle) -> Result<AsHandle, AddressSpaceError> {
        let parent = self.get(parent)?.clone();
        let asid = self.asids.allocate().ok_or(AddressSpaceError::AsidExhausted)?;
        let child = AddressSpace::new(asid, self.config, self.frames.clone());
        if let Err(err) = parent.fork_into(&child) {
            drop(child);
            self.asids.free(asid);
            return Err(err.into());
        }
        Ok(self.insert(child))
    }

    /// Tears down the space behind `handle` and releases its ASID.
    #[must_use]
    pub fn destroy(&mut self, handle: AsHandle) -> Result<(), AddressSpaceError> {
        let slot = self.spaces.get_mut(handle.index()).ok_or(AddressSpaceError::InvalidHandle)?;
        match slot.as_ref() {
            None => return Err(AddressSpaceError::InvalidHandle),
            Some(space) if !space.state.lock().owners.is_empty() => {
                return Err(AddressSpaceError::InUse)
            }
            Some(_) => {}
        }
        let Some(space) = slot.take() else { return Err(AddressSpaceError::InvalidHandle) };
        space.teardown();
        self.asids.free(space.asid);
        log_info!(target: "as", "AS: destroyed asid={}", space.asid);
        Ok(())
    }
}

struct AsidAllocator {
    bitmap: [u64; BITMAP_WORDS],
    next: usize,
}

impl AsidAllocator {
    const fn new() -> Self {
        let mut bitmap = [0u64; BITMAP_WORDS];
        // ASID 0 stays with the kernel.
        bitmap[0] |= 1;
        Self { bitmap, next: 1 }
    }

    fn allocate(&mut self) -> Option<u16> {
        for _ in 0..MAX_ASIDS {
            let index = self.next % MAX_ASIDS;
            let word = index / WORD_BITS;
            let bit = index % WORD_BITS;
            self.next = (index + 1) % MAX_ASIDS;
            if self.bitmap[word] & (1 << bit) == 0 {
                self.bitmap[word] |= 1 << bit;
                return Some(index as u16);
            }
        }
        None
    }

    fn free(&mut self, asid: u16) {
        let index = asid as usize;
        if index != 0 && index < MAX_ASIDS {
            self.bitmap[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        }
    }
}
