// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Diagnostics for the mapping core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: log_* macros, emit(level,target,args)

mod log;

pub use self::log::{emit, Level};
