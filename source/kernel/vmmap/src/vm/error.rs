// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error kinds reported by the mapping operations and their errno encoding.

use thiserror::Error;

use crate::mm::MapError;

/// `EINVAL`
pub const EINVAL: isize = 22;
/// `ENOMEM`
pub const ENOMEM: isize = 12;
/// `ENODEV`
pub const ENODEV: isize = 19;

/// Failure of a mapping operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum VmError {
    /// Zero length, misalignment, W^X, missing backing or an address outside user space.
    #[error("invalid argument")]
    InvalidArgument,
    /// Frames, bookkeeping slots or address-space room exhausted.
    #[error("out of memory")]
    NoMemory,
    /// The requested backing cannot be mapped.
    #[error("backing does not support mapping")]
    Unsupported,
    /// The page table refused a leaf update.
    #[error("page table: {0}")]
    Map(#[from] MapError),
}

impl VmError {
    /// Positive errno value for the syscall boundary.
    pub fn errno(self) -> isize {
        match self {
            VmError::InvalidArgument | VmError::Map(_) => EINVAL,
            VmError::NoMemory => ENOMEM,
            VmError::Unsupported => ENODEV,
        }
    }
}
