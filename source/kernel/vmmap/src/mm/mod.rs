// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory primitives for Sv39: page tables, frames and address spaces.

pub mod address_space;
pub mod frame;
pub mod page_table;

pub use address_space::{
    AddressSpace, AddressSpaceError, AddressSpaceManager, AsHandle, SpaceState,
};
pub use frame::{FrameAllocator, FramePool};
pub use page_table::{is_canonical_sv39, MapError, PageFlags, PageTable, PAGE_SIZE};

#[cfg(feature = "failpoints")]
pub use page_table::failpoints;

/// Exclusive end of the user half of the Sv39 address space.
pub const USER_TOP: usize = 1 << 38;

static_assertions::const_assert!(PAGE_SIZE.is_power_of_two());
static_assertions::const_assert_eq!(USER_TOP % PAGE_SIZE, 0);

/// Rounds `addr` down to a page boundary.
#[inline]
pub const fn align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `len` up to a page multiple, `None` on overflow.
#[inline]
pub fn align_up(len: usize) -> Option<usize> {
    len.checked_add(PAGE_SIZE - 1).map(align_down)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr % PAGE_SIZE == 0
}

/// Returns true if `[start, start + len)` lies inside user space.
#[inline]
pub fn is_user_range(start: usize, len: usize) -> bool {
    match start.checked_add(len) {
        Some(end) => end <= USER_TOP,
        None => false,
    }
}
