// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Protection and mapping flags as passed by `mmap` callers.

use bitflags::bitflags;

use crate::mm::PageFlags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    /// Access rights of a mapping (`PROT_*`).
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    /// Placement and backing flags of a mapping (`MAP_*`).
    pub struct MapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        /// Use the requested address verbatim, replacing any previous occupant.
        const FIXED = 0x10;
        /// No backing resource; pages are zero-filled frames.
        const ANONYMOUS = 0x20;
    }
}

/// Kind of access that triggered a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Prot {
    /// Returns true if both write and execute are requested.
    pub fn violates_wx(self) -> bool {
        self.contains(Prot::WRITE | Prot::EXEC)
    }

    /// Leaf flags for a user page with these rights; `None` for `PROT_NONE`.
    ///
    /// Sv39 reserves write-without-read, so WRITE implies READ.
    pub fn page_flags(self) -> Option<PageFlags> {
        if self.is_empty() {
            return None;
        }
        let mut flags = PageFlags::VALID | PageFlags::USER;
        if self.intersects(Prot::READ | Prot::WRITE) {
            flags |= PageFlags::READ;
        }
        if self.contains(Prot::WRITE) {
            flags |= PageFlags::WRITE;
        }
        if self.contains(Prot::EXEC) {
            flags |= PageFlags::EXECUTE;
        }
        Some(flags)
    }

    /// Returns true if an access of kind `access` is allowed.
    pub fn permits(self, access: Access) -> bool {
        match access {
            Access::Read => self.intersects(Prot::READ | Prot::WRITE),
            Access::Write => self.contains(Prot::WRITE),
            Access::Execute => self.contains(Prot::EXEC),
        }
    }
}

/// Returns true if an installed leaf with `flags` allows `access`.
pub(crate) fn leaf_permits(flags: PageFlags, access: Access) -> bool {
    match access {
        Access::Read => flags.contains(PageFlags::READ),
        Access::Write => flags.contains(PageFlags::WRITE),
        Access::Execute => flags.contains(PageFlags::EXECUTE),
    }
}
