// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and errno encoding for the mapping calls
//! OWNERS: @kernel-mm-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SYSCALL_* IDs, encode()
//! DEPENDS_ON: vm, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs; decode/check/execute discipline

pub mod api;

use thiserror::Error;

use crate::vm::VmError;

/// Maximum number of syscalls supported by the table.
const MAX_SYSCALL: usize = 32;

/// `ENOSYS`
pub const ENOSYS: isize = 38;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers a0-a5.
#[derive(Default, Clone, Copy)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// `mmap(addr, len, prot, flags, fd, offset)`
pub const SYSCALL_MMAP: usize = 9;
/// `munmap(addr, len)`
pub const SYSCALL_MUNMAP: usize = 11;

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    #[error("invalid syscall")]
    InvalidSyscall,
    /// Mapping operation failed.
    #[error("{0}")]
    Vm(#[from] VmError),
}

impl Error {
    /// Positive errno value.
    pub fn errno(self) -> isize {
        match self {
            Error::InvalidSyscall => ENOSYS,
            Error::Vm(err) => err.errno(),
        }
    }
}

/// Folds a handler result into the value returned to userspace: the result on
/// success, the negated errno on failure.
pub fn encode(result: SysResult<usize>) -> isize {
    match result {
        Ok(value) => value as isize,
        Err(err) => -err.errno(),
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut api::Context<'_>,
        args: &Args,
    ) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}
