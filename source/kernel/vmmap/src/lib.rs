// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Demand-paged virtual memory mappings for NEURON user address spaces
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! PUBLIC API: mm (page tables, frames, address spaces), vm (mappings, faults), syscall
//! DEPENDS_ON: bitflags, spin, log, thiserror
//! INVARIANTS: Host-testable; no target-specific code outside cfg gates

#![cfg_attr(not(test), no_std)]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod config;
pub mod mm;
pub mod syscall;
pub mod vm;

pub use config::VmConfig;
pub use mm::{AddressSpace, AddressSpaceManager, AsHandle, FrameAllocator, FramePool};
pub use vm::{
    create_mapping, handle_page_fault, install_page, list_ranges, map_physical, remove_mapping,
    FaultOutcome, MapFlags, PageFault, Prot, VmError,
};
