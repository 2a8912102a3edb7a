//! Memory syscalls: brk, mprotect.

use norn_core::addr::VirtAddr;
use norn_mm::buddy::GlobalFrameSource;
use norn_mm::vma::VmFlags;
use norn_syscall::Errno;
use norn_syscall::syscall_handler;

use super::mm_errno;
use crate::proc::with_current_process;

/// `PROT_READ`.
const PROT_READ: u64 = 1;
/// `PROT_WRITE`.
const PROT_WRITE: u64 = 2;
/// `PROT_EXEC`.
const PROT_EXEC: u64 = 4;

fn vm_flags_of(prot: u64) -> Result<VmFlags, Errno> {
    if prot & !(PROT_READ | PROT_WRITE | PROT_EXEC) != 0 {
        return Err(Errno::EINVAL);
    }
    let mut flags = VmFlags::empty();
    if prot & PROT_READ != 0 {
        flags |= VmFlags::READ;
    }
    if prot & PROT_WRITE != 0 {
        flags |= VmFlags::WRITE;
    }
    if prot & PROT_EXEC != 0 {
        flags |= VmFlags::EXEC;
    }
    Ok(flags)
}

syscall_handler!(pub(super) fn sys_brk(addr: VirtAddr) -> Result<VirtAddr, Errno> {
    // brk never fails towards userspace: shrink requests, conflicts and
    // allocator failures all return the current break unchanged.
    with_current_process(|p| p.mm.brk(addr, &mut GlobalFrameSource))
        .ok_or(Errno::ESRCH)
});

syscall_handler!(pub(super) fn sys_mprotect(addr: VirtAddr, len: usize, prot: u64) -> Result<usize, Errno> {
    let flags = vm_flags_of(prot)?;
    with_current_process(|p| p.mm.mprotect(addr, len, flags))
        .ok_or(Errno::ESRCH)?
        .map_err(mm_errno)?;
    Ok(0)
});
