// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-address-space registry of local mapping records
//! OWNERS: @kernel-mm-team
//! PUBLIC API: LocalRange, RangeRegistry, Located, RangeId
//! INVARIANTS: Records are page aligned, non-empty and pairwise disjoint;
//!             the registry never holds more than its capacity

extern crate alloc;

use alloc::{collections::BTreeMap, sync::Arc};
use core::ops::Bound;
use core::sync::atomic::{AtomicU64, Ordering};

use super::flags::{MapFlags, Prot};
use super::object::{MapObject, Window};
use super::VmError;
use crate::mm::{is_page_aligned, MapError, PAGE_SIZE};

static NEXT_RANGE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a local record, stable across splits of its own extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RangeId(u64);

impl RangeId {
    pub(crate) fn next() -> Self {
        Self(NEXT_RANGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }
}

/// One address space's view of a (sub)window of a mapping object.
pub struct LocalRange {
    id: RangeId,
    object: Arc<MapObject>,
    base: usize,
    length: usize,
    offset: usize,
    prot: Prot,
    flags: MapFlags,
}

impl LocalRange {
    pub(crate) fn new(
        object: Arc<MapObject>,
        base: usize,
        length: usize,
        offset: usize,
        prot: Prot,
        flags: MapFlags,
    ) -> Self {
        Self { id: RangeId::next(), object, base, length, offset, prot, flags }
    }

    /// Same window and rights as `self` under a fresh identity, for a forked child.
    pub(crate) fn duplicate(&self) -> Self {
        Self::new(
            self.object.clone(),
            self.base,
            self.length,
            self.offset,
            self.prot,
            self.flags,
        )
    }

    pub fn id(&self) -> RangeId {
        self.id
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn end(&self) -> usize {
        self.base + self.length
    }

    /// Offset of `base` inside the backing resource.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn prot(&self) -> Prot {
        self.prot
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn object(&self) -> &Arc<MapObject> {
        &self.object
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Position of `base` relative to the object's own base.
    pub fn object_start(&self) -> usize {
        self.offset - self.object.offset()
    }

    /// Object coordinate backing the page that holds `addr`.
    pub fn object_va(&self, addr: usize) -> usize {
        let page = (addr - self.base) & !(PAGE_SIZE - 1);
        self.object.base() + self.object_start() + page
    }

    pub(crate) fn window(&self) -> Window {
        Window { base: self.base, start: self.object_start(), length: self.length }
    }

    /// Drops `[self.base, at)` from the record.
    pub(crate) fn trim_front(&mut self, at: usize) {
        let cut = at - self.base;
        self.base = at;
        self.offset += cut;
        self.length -= cut;
    }

    /// Shrinks the record to end at `at`.
    pub(crate) fn truncate(&mut self, at: usize) {
        self.length = at - self.base;
    }

    /// Splits off `[at, end)` as a new record with its own identity.
    pub(crate) fn split_off(&mut self, at: usize) -> LocalRange {
        let mut tail = self.duplicate();
        tail.trim_front(at);
        self.truncate(at);
        tail
    }
}

impl core::fmt::Debug for LocalRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalRange")
            .field("id", &self.id)
            .field("base", &format_args!("{:#x}", self.base))
            .field("length", &format_args!("{:#x}", self.length))
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("prot", &self.prot)
            .field("object", &self.object.id())
            .finish()
    }
}

/// Result of resolving an address to its record.
pub struct Located<'a> {
    pub range: &'a LocalRange,
    /// Page index of the address inside the record.
    pub page_index: usize,
    /// Page index inside the backing resource.
    pub backing_page: usize,
}

/// Ordered, disjoint set of local records keyed by base address.
pub struct RangeRegistry {
    ranges: BTreeMap<usize, LocalRange>,
    capacity: usize,
}

impl RangeRegistry {
    pub fn new(capacity: usize) -> Self {
        Self { ranges: BTreeMap::new(), capacity }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true if `extra` more records fit.
    pub fn has_room(&self, extra: usize) -> bool {
        self.ranges.len().saturating_add(extra) <= self.capacity
    }

    /// Registers `range`, rejecting overlap and exhaustion.
    pub fn insert(&mut self, range: LocalRange) -> Result<(), VmError> {
        if range.length == 0 || !is_page_aligned(range.base) || !is_page_aligned(range.length) {
            return Err(VmError::InvalidArgument);
        }
        if self.overlapping(range.base, range.end()).next().is_some() {
            return Err(VmError::Map(MapError::Overlap));
        }
        if !self.has_room(1) {
            return Err(VmError::NoMemory);
        }
        self.ranges.insert(range.base, range);
        Ok(())
    }

    pub fn remove(&mut self, base: usize) -> Option<LocalRange> {
        self.ranges.remove(&base)
    }

    pub fn get(&self, base: usize) -> Option<&LocalRange> {
        self.ranges.get(&base)
    }

    /// Finds the record containing `addr`.
    pub fn locate(&self, addr: usize) -> Option<Located<'_>> {
        let (_, range) = self.ranges.range(..=addr).next_back()?;
        if !range.contains(addr) {
            return None;
        }
        let page_index = (addr - range.base) / PAGE_SIZE;
        Some(Located { range, page_index, backing_page: range.offset / PAGE_SIZE + page_index })
    }

    /// Records intersecting `[start, end)`, in address order.
    pub fn overlapping(&self, start: usize, end: usize) -> impl Iterator<Item = &LocalRange> {
        let before = self
            .ranges
            .range(..start)
            .next_back()
            .map(|(_, range)| range)
            .filter(move |range| range.end() > start);
        let inside = self
            .ranges
            .range((Bound::Included(start), Bound::Excluded(end)))
            .map(|(_, range)| range);
        before.into_iter().chain(inside)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalRange> {
        self.ranges.values()
    }

    /// Removes every record.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = LocalRange> {
        core::mem::take(&mut self.ranges).into_values()
    }

    /// First free window of `len` bytes at or above `from`, below `limit`.
    ///
    /// Each occupant pushes the candidate past its end plus `guard` bytes.
    pub fn find_free(&self, from: usize, len: usize, guard: usize, limit: usize) -> Option<usize> {
        let mut cursor = from;
        loop {
            let end = cursor.checked_add(len)?;
            if end > limit {
                return None;
            }
            match self.overlapping(cursor, end).last() {
                None => return Some(cursor),
                Some(occupant) => cursor = occupant.end().checked_add(guard)?,
            }
        }
    }

    /// Checks ordering, alignment and disjointness of the records.
    pub fn verify(&self) -> Result<(), &'static str> {
        if self.ranges.len() > self.capacity {
            return Err("registry over capacity");
        }
        let mut prev_end = 0usize;
        for (&key, range) in &self.ranges {
            if key != range.base {
                return Err("record keyed by wrong base");
            }
            if range.length == 0 || !is_page_aligned(range.base) || !is_page_aligned(range.length) {
                return Err("record not page granular");
            }
            if range.base < prev_end {
                return Err("records overlap");
            }
            if range.offset < range.object.offset()
                || range.object_start() + range.length > range.object.length()
            {
                return Err("record outside its object");
            }
            prev_end = range.end();
        }
        Ok(())
    }
}
