// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Global mapping objects shared by every address space that maps them
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MapObject, Backing, ObjectId
//! DEPENDS_ON: mm::PageTable (shadow), mm::FrameAllocator, mm::AddressSpace
//! INVARIANTS:
//!   - The shadow table holds at most one frame per object page; every sharer that
//!     maps a page maps that frame
//!   - A retired object accepts no further installs and owns no frames
//!   - Lock order: address space -> sharers -> shadow

extern crate alloc;

use alloc::{
    collections::TryReserveError,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::flags::Prot;
use super::range::RangeId;
use super::resource::Resource;
use super::VmError;
use crate::mm::{
    is_page_aligned, AddressSpace, FrameAllocator, MapError, PageFlags, PageTable,
};
use crate::{log_debug, log_warn};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn to_raw(self) -> u64 {
        self.0
    }
}

/// Where the frames of an object come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backing {
    /// Zero-filled frames allocated on first touch and owned by the object.
    Anonymous,
    /// Caller-provided physical pages; never freed by the mapping core.
    Physical,
    /// Pages of an open resource; the resource is told when the object retires.
    Resource,
}

/// Part of an object visible through one local record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Window {
    /// Virtual base of the record in its address space.
    pub base: usize,
    /// Object-relative offset shown at `base`.
    pub start: usize,
    pub length: usize,
}

impl Window {
    pub fn covers(&self, rel: usize) -> bool {
        rel >= self.start && rel - self.start < self.length
    }

    pub fn va_for(&self, rel: usize) -> usize {
        self.base + (rel - self.start)
    }
}

#[derive(Clone)]
pub(crate) struct Sharer {
    pub range: RangeId,
    pub space: Weak<AddressSpace>,
    pub window: Window,
}

struct Shadow {
    table: PageTable,
    retired: bool,
}

/// One logical mapping, shared by every local record created from it.
pub struct MapObject {
    id: ObjectId,
    base: usize,
    length: usize,
    offset: usize,
    backing: Backing,
    resource: Option<Arc<dyn Resource>>,
    sharers: Mutex<Vec<Sharer>>,
    shadow: Mutex<Shadow>,
}

impl MapObject {
    /// Creates an object over `[base, base + length)` using a preallocated shadow table.
    pub(crate) fn new(
        base: usize,
        length: usize,
        offset: usize,
        backing: Backing,
        shadow: PageTable,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
            base,
            length,
            offset,
            backing,
            resource: None,
            sharers: Mutex::new(Vec::new()),
            shadow: Mutex::new(Shadow { table: shadow, retired: false }),
        })
    }

    /// Creates an object backed by `resource` and takes a reference on it.
    // TODO: call from create_mapping once resource page population exists; until
    // then resource-backed requests are refused before an object is built.
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn with_resource(
        base: usize,
        length: usize,
        offset: usize,
        resource: Arc<dyn Resource>,
        shadow: PageTable,
    ) -> Arc<Self> {
        resource.acquire();
        Arc::new(Self {
            id: ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
            base,
            length,
            offset,
            backing: Backing::Resource,
            resource: Some(resource),
            sharers: Mutex::new(Vec::new()),
            shadow: Mutex::new(Shadow { table: shadow, retired: false }),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn backing(&self) -> Backing {
        self.backing
    }

    pub fn sharer_count(&self) -> usize {
        self.sharers.lock().len()
    }

    pub fn is_retired(&self) -> bool {
        self.shadow.lock().retired
    }

    /// Frame installed for the object page at `object_va`, if any.
    pub fn frame_at(&self, object_va: usize) -> Option<usize> {
        self.shadow.lock().table.leaf(object_va).map(|(pa, _)| pa)
    }

    /// Number of pages currently installed.
    pub fn resident_pages(&self) -> usize {
        self.shadow.lock().table.leaves().len()
    }

    /// Makes room for `extra` sharers so later attaches cannot fail.
    pub(crate) fn reserve_sharers(&self, extra: usize) -> Result<(), VmError> {
        self.sharers
            .lock()
            .try_reserve(extra)
            .map_err(|_: TryReserveError| VmError::NoMemory)
    }

    pub(crate) fn attach(&self, sharer: Sharer) -> Result<(), VmError> {
        let mut sharers = self.sharers.lock();
        sharers.try_reserve(1).map_err(|_| VmError::NoMemory)?;
        sharers.push(sharer);
        Ok(())
    }

    pub(crate) fn update_window(&self, range: RangeId, window: Window) {
        if let Some(sharer) = self.sharers.lock().iter_mut().find(|s| s.range == range) {
            sharer.window = window;
        }
    }

    /// Narrows `range` to `window` and registers `tail` as a sharer from the same space.
    pub(crate) fn split_sharer(
        &self,
        range: RangeId,
        window: Window,
        tail: RangeId,
        tail_window: Window,
    ) -> Result<(), VmError> {
        let mut sharers = self.sharers.lock();
        let space = match sharers.iter_mut().find(|s| s.range == range) {
            Some(sharer) => {
                sharer.window = window;
                sharer.space.clone()
            }
            None => return Err(VmError::InvalidArgument),
        };
        sharers.try_reserve(1).map_err(|_| VmError::NoMemory)?;
        sharers.push(Sharer { range: tail, space, window: tail_window });
        Ok(())
    }

    /// Removes the sharer for `range` and returns how many remain.
    pub(crate) fn detach(&self, range: RangeId) -> usize {
        let mut sharers = self.sharers.lock();
        sharers.retain(|s| s.range != range);
        sharers.len()
    }

    /// Installs `phys` for the object page at `object_va` and propagates it to every
    /// sharer whose window covers that page.
    ///
    /// If the page already holds a frame the existing frame wins and is propagated
    /// instead; the return value is the frame that ended up installed, so a caller
    /// that allocated `phys` must release it when the two differ.
    ///
    /// A page no sharer covers any more is refused with `Map(NotMapped)` and the
    /// shadow is left untouched, so `phys` still belongs to the caller.
    pub fn install_page(&self, object_va: usize, phys: usize, prot: Prot) -> Result<usize, VmError> {
        let rel = object_va.wrapping_sub(self.base);
        if !is_page_aligned(object_va) || object_va < self.base || rel >= self.length {
            return Err(VmError::InvalidArgument);
        }
        let flags = prot.page_flags().ok_or(VmError::InvalidArgument)?;
        if prot.violates_wx() {
            return Err(VmError::InvalidArgument);
        }

        let (installed, sharers) = {
            let sharers = self.sharers.lock();
            let covering: Vec<Sharer> =
                sharers.iter().filter(|s| s.window.covers(rel)).cloned().collect();
            if covering.is_empty() {
                return Err(VmError::Map(MapError::NotMapped));
            }
            let mut shadow = self.shadow.lock();
            if shadow.retired {
                return Err(VmError::Map(MapError::NotMapped));
            }
            let installed = match shadow.table.leaf(object_va) {
                Some((existing, _)) => existing,
                None => {
                    shadow.table.map(object_va, phys, flags)?;
                    phys
                }
            };
            (installed, covering)
        };

        let mut first_err = None;
        for sharer in &sharers {
            let Some(space) = sharer.space.upgrade() else { continue };
            let va = sharer.window.va_for(rel);
            if let Err(err) = space.install_for_range(sharer.range, va, installed, flags) {
                log_warn!(
                    target: "vm",
                    "VM: install obj={} va={:#x} into asid={} failed: {}",
                    self.id.0,
                    va,
                    space.asid(),
                    err
                );
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(installed),
        }
    }

    /// Installs `phys` in the shadow only; used while no sharer can observe the object.
    pub(crate) fn install_unpublished(
        &self,
        object_va: usize,
        phys: usize,
        flags: PageFlags,
    ) -> Result<(), VmError> {
        let mut shadow = self.shadow.lock();
        shadow.table.map(object_va, phys, flags)?;
        Ok(())
    }

    /// Copies the installed pages inside `window` as `(va, pa)` pairs in sharer coordinates.
    pub(crate) fn pages_in(&self, window: Window) -> Vec<(usize, usize)> {
        let shadow = self.shadow.lock();
        shadow
            .table
            .leaves()
            .into_iter()
            .filter_map(|(va, pa, _)| {
                let rel = va - self.base;
                window.covers(rel).then(|| (window.va_for(rel), pa))
            })
            .collect()
    }

    /// Drops pages in `[rel_start, rel_end)` that no remaining sharer can reach.
    pub(crate) fn release_uncovered(
        &self,
        rel_start: usize,
        rel_end: usize,
        frames: &dyn FrameAllocator,
    ) {
        let sharers = self.sharers.lock();
        let mut shadow = self.shadow.lock();
        let mut released = 0usize;
        let resident = shadow.table.leaves_in(self.base + rel_start, self.base + rel_end);
        for (va, pa, _) in resident {
            let rel = va - self.base;
            if sharers.iter().any(|s| s.window.covers(rel)) {
                continue;
            }
            if shadow.table.unmap(va).is_ok() {
                if self.backing == Backing::Anonymous {
                    frames.free_frames(pa, 1);
                }
                released += 1;
            }
        }
        if released != 0 {
            log_debug!(
                target: "vm",
                "VM: obj={} released {} orphaned pages",
                self.id.0,
                released
            );
        }
    }

    /// Marks the object dead, returns its anonymous frames and hands resource
    /// pages back through [`Resource::unmap`].
    pub(crate) fn retire(&self, frames: &dyn FrameAllocator) {
        let mut shadow = self.shadow.lock();
        if shadow.retired {
            return;
        }
        shadow.retired = true;
        let leaves = shadow.table.leaves();
        for (va, pa, _) in &leaves {
            let _ = shadow.table.unmap(*va);
            if self.backing == Backing::Anonymous {
                frames.free_frames(*pa, 1);
            }
        }
        log_debug!(
            target: "vm",
            "VM: obj={} retired, {} pages released",
            self.id.0,
            leaves.len()
        );
        if let Some(resource) = &self.resource {
            resource.unmap(self.offset, self.length);
        }
    }
}

impl core::fmt::Debug for MapObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MapObject")
            .field("id", &self.id)
            .field("base", &format_args!("{:#x}", self.base))
            .field("length", &format_args!("{:#x}", self.length))
            .field("backing", &self.backing)
            .finish()
    }
}
