// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Tunables for per-address-space mapping placement and bookkeeping limits
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VmConfig, VmConfig::DEFAULT, VmConfig::new()
//! INVARIANTS: anon window page aligned and inside the Sv39 user half; max_ranges > 0

use crate::mm::{is_page_aligned, PAGE_SIZE, USER_TOP};
use crate::vm::VmError;

/// Placement and capacity parameters applied to every address space created by an
/// [`AddressSpaceManager`](crate::mm::AddressSpaceManager).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// First address handed out for non-fixed anonymous mappings.
    pub anon_base: usize,
    /// Exclusive upper bound for non-fixed anonymous mappings.
    pub anon_limit: usize,
    /// Unmapped pages left after every non-fixed mapping.
    pub guard_pages: usize,
    /// Maximum number of local ranges one address space may hold.
    pub max_ranges: usize,
}

impl VmConfig {
    /// 64 GiB base, one guard page, 1024 ranges.
    pub const DEFAULT: Self = Self {
        anon_base: 0x10_0000_0000,
        anon_limit: USER_TOP,
        guard_pages: 1,
        max_ranges: 1024,
    };

    /// Validates and builds a configuration.
    pub fn new(
        anon_base: usize,
        anon_limit: usize,
        guard_pages: usize,
        max_ranges: usize,
    ) -> Result<Self, VmError> {
        if !is_page_aligned(anon_base) || !is_page_aligned(anon_limit) {
            return Err(VmError::InvalidArgument);
        }
        if anon_base == 0 || anon_base >= anon_limit || anon_limit > USER_TOP {
            return Err(VmError::InvalidArgument);
        }
        if max_ranges == 0 {
            return Err(VmError::InvalidArgument);
        }
        guard_pages.checked_mul(PAGE_SIZE).ok_or(VmError::InvalidArgument)?;
        Ok(Self { anon_base, anon_limit, guard_pages, max_ranges })
    }

    /// Bytes skipped after each non-fixed mapping.
    pub const fn guard_bytes(&self) -> usize {
        self.guard_pages * PAGE_SIZE
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
