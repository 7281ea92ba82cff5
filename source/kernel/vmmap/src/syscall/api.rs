// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Syscall handlers for `mmap` and `munmap`.

extern crate alloc;

use alloc::sync::Arc;

use super::{Args, Error, SysResult, SyscallTable, SYSCALL_MMAP, SYSCALL_MUNMAP};
use crate::mm::AddressSpace;
use crate::vm::{self, MapFlags, Prot, ResourceTable, VmError};
use crate::log_debug;

/// State a handler runs against: the caller's address space and descriptors.
pub struct Context<'a> {
    pub space: Arc<AddressSpace>,
    pub resources: &'a dyn ResourceTable,
}

impl<'a> Context<'a> {
    pub fn new(space: Arc<AddressSpace>, resources: &'a dyn ResourceTable) -> Self {
        Self { space, resources }
    }
}

/// Registers the mapping syscalls.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_MMAP, sys_mmap);
    table.register(SYSCALL_MUNMAP, sys_munmap);
}

#[derive(Copy, Clone)]
struct MmapArgsTyped {
    addr: usize,
    len: usize,
    prot: Prot,
    flags: MapFlags,
    fd: i32,
    offset: usize,
}

impl MmapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let prot = u32::try_from(args.get(2))
            .ok()
            .and_then(Prot::from_bits)
            .ok_or(VmError::InvalidArgument)?;
        // Unknown MAP_* bits are malformed, not ignored.
        let flags = u32::try_from(args.get(3))
            .ok()
            .and_then(MapFlags::from_bits)
            .ok_or(VmError::InvalidArgument)?;
        Ok(Self {
            addr: args.get(0),
            len: args.get(1),
            prot,
            flags,
            fd: args.get(4) as i32,
            offset: args.get(5),
        })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if self.len == 0 {
            return Err(VmError::InvalidArgument.into());
        }
        if self.prot.violates_wx() {
            return Err(VmError::InvalidArgument.into());
        }
        // Exactly one of SHARED / PRIVATE.
        if self.flags.contains(MapFlags::SHARED) == self.flags.contains(MapFlags::PRIVATE) {
            return Err(VmError::InvalidArgument.into());
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct MunmapArgsTyped {
    addr: usize,
    len: usize,
}

impl MunmapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self { addr: args.get(0), len: args.get(1) })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if self.len == 0 {
            return Err(VmError::InvalidArgument.into());
        }
        self.addr.checked_add(self.len).ok_or(VmError::InvalidArgument)?;
        Ok(())
    }
}

fn sys_mmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = MmapArgsTyped::decode(args)?;
    typed.check()?;

    let resource = if typed.flags.contains(MapFlags::ANONYMOUS) {
        None
    } else {
        Some(ctx.resources.resource(typed.fd).ok_or(VmError::InvalidArgument)?)
    };
    let base = vm::create_mapping(
        &ctx.space,
        typed.addr,
        typed.len,
        typed.prot,
        typed.flags,
        resource.as_deref(),
        typed.offset,
    )?;
    log_debug!(target: "vm", "SYS: mmap -> {:#x}", base);
    Ok(base)
}

fn sys_munmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = MunmapArgsTyped::decode(args)?;
    typed.check()?;
    vm::remove_mapping(&ctx.space, typed.addr, typed.len)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::mm::{FramePool, PAGE_SIZE};
    use crate::syscall::{encode, ENOSYS};
    use crate::vm::{list_ranges, NoResources, Resource, EINVAL, ENODEV};

    const MAP_PRIVATE_ANON: usize = 0x22;
    const PROT_RW: usize = 0x3;

    struct Framebuffer;

    impl Resource for Framebuffer {
        fn can_mmap(&self) -> bool {
            true
        }

        fn acquire(&self) {}

        fn unmap(&self, _offset: usize, _len: usize) {}
    }

    struct OneDevice;

    impl ResourceTable for OneDevice {
        fn resource(&self, fd: i32) -> Option<Arc<dyn Resource>> {
            (fd == 3).then(|| Arc::new(Framebuffer) as Arc<dyn Resource>)
        }
    }

    fn setup() -> (SyscallTable, Arc<AddressSpace>) {
        let mut table = SyscallTable::new();
        install_handlers(&mut table);
        let pool = Arc::new(FramePool::new(0x8000_0000, 8));
        (table, AddressSpace::new(1, VmConfig::DEFAULT, pool))
    }

    #[test]
    fn mmap_then_munmap() {
        let (table, space) = setup();
        let mut ctx = Context::new(space.clone(), &NoResources);
        let args = Args::new([0, 3 * PAGE_SIZE, PROT_RW, MAP_PRIVATE_ANON, usize::MAX, 0]);
        let base = table.dispatch(SYSCALL_MMAP, &mut ctx, &args).unwrap();
        assert_eq!(base, VmConfig::DEFAULT.anon_base);
        assert_eq!(list_ranges(&space).len(), 1);

        let args = Args::new([base, 3 * PAGE_SIZE, 0, 0, 0, 0]);
        assert_eq!(table.dispatch(SYSCALL_MUNMAP, &mut ctx, &args), Ok(0));
        assert!(list_ranges(&space).is_empty());
    }

    #[test]
    fn errors_encode_as_negative_errno() {
        let (table, space) = setup();
        let mut ctx = Context::new(space, &NoResources);

        let zero = Args::new([0, 0, PROT_RW, MAP_PRIVATE_ANON, 0, 0]);
        assert_eq!(encode(table.dispatch(SYSCALL_MMAP, &mut ctx, &zero)), -EINVAL);

        let both = Args::new([0, PAGE_SIZE, PROT_RW, 0x23, 0, 0]);
        assert_eq!(encode(table.dispatch(SYSCALL_MMAP, &mut ctx, &both)), -EINVAL);

        let bad_prot = Args::new([0, PAGE_SIZE, 0x80, MAP_PRIVATE_ANON, 0, 0]);
        assert_eq!(encode(table.dispatch(SYSCALL_MMAP, &mut ctx, &bad_prot)), -EINVAL);

        let unknown_fd = Args::new([0, PAGE_SIZE, PROT_RW, 0x01, 5, 0]);
        assert_eq!(encode(table.dispatch(SYSCALL_MMAP, &mut ctx, &unknown_fd)), -EINVAL);

        assert_eq!(encode(table.dispatch(3, &mut ctx, &Args::default())), -ENOSYS);
    }

    #[test]
    fn out_of_range_prot_and_flag_bits_are_einval() {
        let (table, space) = setup();
        let mut ctx = Context::new(space.clone(), &NoResources);

        let high_prot = Args::new([0, PAGE_SIZE, (1 << 32) | PROT_RW, MAP_PRIVATE_ANON, 0, 0]);
        assert_eq!(encode(table.dispatch(SYSCALL_MMAP, &mut ctx, &high_prot)), -EINVAL);

        let high_flags = Args::new([0, PAGE_SIZE, PROT_RW, (1 << 32) | MAP_PRIVATE_ANON, 0, 0]);
        assert_eq!(encode(table.dispatch(SYSCALL_MMAP, &mut ctx, &high_flags)), -EINVAL);

        // MAP_POPULATE is not a flag this kernel knows.
        let unknown_flag = Args::new([0, PAGE_SIZE, PROT_RW, 0x8000 | MAP_PRIVATE_ANON, 0, 0]);
        assert_eq!(encode(table.dispatch(SYSCALL_MMAP, &mut ctx, &unknown_flag)), -EINVAL);

        assert!(list_ranges(&space).is_empty());
    }

    #[test]
    fn device_backed_mmap_is_enodev() {
        let (table, space) = setup();
        let mut ctx = Context::new(space.clone(), &OneDevice);
        let args = Args::new([0, PAGE_SIZE, PROT_RW, 0x01, 3, 0]);
        assert_eq!(encode(table.dispatch(SYSCALL_MMAP, &mut ctx, &args)), -ENODEV);
        assert!(list_ranges(&space).is_empty());
    }

    #[test]
    fn successful_result_passes_through() {
        assert_eq!(encode(Ok(0x4000)), 0x4000);
        assert_eq!(encode(Err(Error::Vm(VmError::NoMemory))), -12);
    }
}
