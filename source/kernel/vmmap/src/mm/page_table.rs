// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page-table implementation with lazy allocation of intermediate levels.
//!
//! This is the single-page primitive the mapping core is built on: it installs,
//! removes and translates one 4 KiB leaf at a time and never reasons about ranges.

extern crate alloc;

use alloc::{boxed::Box, vec, vec::Vec};
use core::ptr::NonNull;

use bitflags::bitflags;

#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicUsize, Ordering};

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;
/// Number of translation levels.
const LEVELS: usize = 3;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    Unaligned,
    /// Mapping extends beyond the canonical Sv39 range.
    OutOfRange,
    /// Mapping violates the W^X policy.
    PermissionDenied,
    /// Mapping collides with an existing entry.
    Overlap,
    /// Flags do not describe a valid leaf entry.
    InvalidFlags,
    /// No leaf is installed at the address.
    NotMapped,
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            MapError::Unaligned => "address not page aligned",
            MapError::OutOfRange => "address outside the Sv39 range",
            MapError::PermissionDenied => "mapping violates W^X",
            MapError::Overlap => "page already mapped",
            MapError::InvalidFlags => "flags do not describe a leaf",
            MapError::NotMapped => "page not mapped",
        };
        f.write_str(text)
    }
}

impl core::error::Error for MapError {}

#[repr(align(4096))]
struct PageTablePage {
    entries: [usize; PT_ENTRIES],
}

impl PageTablePage {
    const fn new() -> Self {
        Self { entries: [0; PT_ENTRIES] }
    }
}

#[cfg(feature = "failpoints")]
static DENY_MAP_AT: AtomicUsize = AtomicUsize::new(usize::MAX);

/// Three-level Sv39 page table allocating intermediate levels on demand.
pub struct PageTable {
    root: NonNull<PageTablePage>,
    owned: Vec<NonNull<PageTablePage>>,
}

// SAFETY: the table exclusively owns every page reachable from `root`; all access
// goes through `&self`/`&mut self`, callers serialise mutation with their own lock.
unsafe impl Send for PageTable {}

impl PageTable {
    /// Creates an empty Sv39 page table with a fresh root page.
    pub fn new() -> Self {
        let root = Self::alloc_page();
        Self { root, owned: vec![root] }
    }

    /// Returns the physical page number of the root page suitable for SATP.
    pub fn root_ppn(&self) -> usize {
        self.root.as_ptr() as usize / PAGE_SIZE
    }

    /// Looks up the raw leaf entry mapped at `va` if it exists.
    pub fn lookup(&self, va: usize) -> Option<usize> {
        if va % PAGE_SIZE != 0 || !is_canonical_sv39(va) {
            return None;
        }
        let indices = vpn_indices(va);
        let mut table = self.root;
        for (level, index) in indices.iter().enumerate() {
            // SAFETY: `table` is either the root or a page installed by `map`.
            let entry = unsafe { (*table.as_ptr()).entries[*index] };
            if entry & PageFlags::VALID.bits() == 0 {
                return None;
            }
            let is_leaf = entry & LEAF_PERMS.bits() != 0;
            if level == LEVELS - 1 {
                return if is_leaf { Some(entry) } else { None };
            }
            if is_leaf {
                return None;
            }
            table = NonNull::new(entry_target(entry))?;
        }
        None
    }

    /// Returns the physical page and flags of the leaf at `va`.
    pub fn leaf(&self, va: usize) -> Option<(usize, PageFlags)> {
        self.lookup(va)
            .map(|entry| (entry_phys(entry), PageFlags::from_bits_truncate(entry & 0x3ff)))
    }

    /// Translates `va` (any byte offset) to its physical address.
    pub fn translate(&self, va: usize) -> Option<usize> {
        let page = va & !(PAGE_SIZE - 1);
        self.lookup(page).map(|entry| entry_phys(entry) + (va - page))
    }

    /// Installs a 4 KiB mapping from `va` to `pa` using `flags`.
    pub fn map(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        if flags.intersection(LEAF_PERMS).is_empty() || !flags.contains(PageFlags::VALID) {
            return Err(MapError::InvalidFlags);
        }
        if flags.contains(PageFlags::WRITE) && flags.contains(PageFlags::EXECUTE) {
            return Err(MapError::PermissionDenied);
        }
        #[cfg(feature = "failpoints")]
        if DENY_MAP_AT
            .compare_exchange(va, usize::MAX, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Err(MapError::PermissionDenied);
        }

        let indices = vpn_indices(va);
        let mut table = self.root;
        for (level, index) in indices.iter().enumerate() {
            // SAFETY: `table` is the root or a page this table allocated.
            let entry = unsafe { &mut (*table.as_ptr()).entries[*index] };
            if level == LEVELS - 1 {
                if *entry & PageFlags::VALID.bits() != 0 {
                    return Err(MapError::Overlap);
                }
                *entry = ((pa / PAGE_SIZE) << 10) | flags.bits();
                return Ok(());
            }

            if *entry & PageFlags::VALID.bits() != 0 {
                if *entry & LEAF_PERMS.bits() != 0 {
                    return Err(MapError::Overlap);
                }
                table = NonNull::new(entry_target(*entry)).ok_or(MapError::OutOfRange)?;
                continue;
            }

            let next = Self::alloc_page();
            self.owned.push(next);
            let ppn = next.as_ptr() as usize / PAGE_SIZE;
            *entry = (ppn << 10) | PageFlags::VALID.bits();
            table = next;
        }
        Ok(())
    }

    /// Removes the leaf at `va` and returns the physical address it pointed to.
    ///
    /// Intermediate levels stay allocated until the table is dropped.
    pub fn unmap(&mut self, va: usize) -> Result<usize, MapError> {
        if va % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        let indices = vpn_indices(va);
        let mut table = self.root;
        for (level, index) in indices.iter().enumerate() {
            // SAFETY: `table` is the root or a page this table allocated.
            let entry = unsafe { &mut (*table.as_ptr()).entries[*index] };
            if *entry & PageFlags::VALID.bits() == 0 {
                return Err(MapError::NotMapped);
            }
            let is_leaf = *entry & LEAF_PERMS.bits() != 0;
            if level == LEVELS - 1 {
                if !is_leaf {
                    return Err(MapError::NotMapped);
                }
                let pa = entry_phys(*entry);
                *entry = 0;
                return Ok(pa);
            }
            if is_leaf {
                return Err(MapError::NotMapped);
            }
            table = NonNull::new(entry_target(*entry)).ok_or(MapError::NotMapped)?;
        }
        Err(MapError::NotMapped)
    }

    /// Returns every installed leaf as `(va, pa, flags)`, ordered by address.
    pub fn leaves(&self) -> Vec<(usize, usize, PageFlags)> {
        self.leaves_in(0, usize::MAX)
    }

    /// Returns the installed leaves with `start <= va < end`, ordered by address.
    ///
    /// Subtrees outside the window are skipped without being visited, so the cost
    /// follows the populated part of the window rather than its length.
    pub fn leaves_in(&self, start: usize, end: usize) -> Vec<(usize, usize, PageFlags)> {
        let mut out = Vec::new();
        if start >= end {
            return out;
        }
        // SAFETY: every non-leaf entry points to a page owned by this table.
        let root = unsafe { &*self.root.as_ptr() };
        for (i2, &e2) in root.entries.iter().enumerate() {
            let base2 = sign_extend(i2 << 30);
            if !spans(base2, 1 << 30, start, end) {
                continue;
            }
            let Some(mid) = next_level(e2) else { continue };
            for (i1, &e1) in mid.entries.iter().enumerate() {
                let base1 = base2 | (i1 << 21);
                if !spans(base1, 1 << 21, start, end) {
                    continue;
                }
                let Some(leaf) = next_level(e1) else { continue };
                for (i0, &e0) in leaf.entries.iter().enumerate() {
                    let va = base1 | (i0 << 12);
                    if va < start || va >= end {
                        continue;
                    }
                    if e0 & PageFlags::VALID.bits() == 0 || e0 & LEAF_PERMS.bits() == 0 {
                        continue;
                    }
                    out.push((va, entry_phys(e0), PageFlags::from_bits_truncate(e0 & 0x3ff)));
                }
            }
        }
        out
    }

    fn alloc_page() -> NonNull<PageTablePage> {
        let boxed = Box::new(PageTablePage::new());
        // SAFETY: Box never yields a null pointer.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for page in self.owned.drain(..) {
            // SAFETY: every pointer originates from `alloc_page` and is unique.
            unsafe { drop(Box::from_raw(page.as_ptr())) };
        }
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

fn next_level<'a>(entry: usize) -> Option<&'a PageTablePage> {
    if entry & PageFlags::VALID.bits() == 0 || entry & LEAF_PERMS.bits() != 0 {
        return None;
    }
    // SAFETY: non-leaf valid entries are only written by `map` and point at owned pages.
    NonNull::new(entry_target(entry)).map(|page| unsafe { &*page.as_ptr() })
}

fn entry_target(entry: usize) -> *mut PageTablePage {
    entry_phys(entry) as *mut PageTablePage
}

fn entry_phys(entry: usize) -> usize {
    (entry >> 10) << 12
}

fn vpn_indices(va: usize) -> [usize; LEVELS] {
    let vpn0 = (va >> 12) & 0x1ff;
    let vpn1 = (va >> 21) & 0x1ff;
    let vpn2 = (va >> 30) & 0x1ff;
    [vpn2, vpn1, vpn0]
}

/// True if `[base, base + size)` intersects `[start, end)`; `end > start`.
fn spans(base: usize, size: usize, start: usize, end: usize) -> bool {
    base < end && start - base.min(start) < size
}

fn sign_extend(va: usize) -> usize {
    if (va >> 38) & 1 == 1 {
        va | !((1usize << 39) - 1)
    } else {
        va
    }
}

/// Returns true if `va` is a canonical Sv39 address.
pub fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}

#[cfg(feature = "failpoints")]
pub mod failpoints {
    use super::DENY_MAP_AT;
    use core::sync::atomic::Ordering;

    /// Forces the next `map` of exactly `va` to return [`MapError::PermissionDenied`].
    ///
    /// [`MapError::PermissionDenied`]: super::MapError::PermissionDenied
    pub fn deny_next_map_at(va: usize) {
        DENY_MAP_AT.store(va, Ordering::SeqCst);
    }

    /// Clears a pending injection.
    pub fn clear() {
        DENY_MAP_AT.store(usize::MAX, Ordering::SeqCst);
    }
}
