//! Process-scoped syscalls.

use core::sync::atomic::{AtomicU64, Ordering};

use norn_core::addr::VirtAddr;
use norn_core::kinfo;
use norn_syscall::Errno;
use norn_syscall::syscall_handler;

use crate::proc::with_current_process;

/// `arch_prctl` code: set the FS segment base.
const ARCH_SET_FS: u64 = 0x1002;

syscall_handler!(pub(super) fn sys_getuid() -> i64 {
    // Everything runs as root in this minimal scope.
    0
});

syscall_handler!(pub(super) fn sys_exit_group(status: i64) -> i64 {
    kinfo!("exit_group(status={status})");
    crate::proc::exit_current_thread()
});

syscall_handler!(pub(super) fn sys_set_tid_address(tidptr: VirtAddr) -> Result<usize, Errno> {
    with_current_process(|p| {
        p.tid_address = Some(tidptr);
    });
    // The caller expects its own tid; a single-threaded process is its
    // thread group leader.
    Ok(1)
});

syscall_handler!(pub(super) fn sys_arch_prctl(code: u64, addr: u64) -> Result<usize, Errno> {
    match code {
        ARCH_SET_FS => {
            crate::arch::x86_64::instructions::set_fs_base(addr);
            Ok(0)
        }
        _ => Err(Errno::EINVAL),
    }
});

syscall_handler!(pub(super) fn sys_prlimit64(_pid: u64, _resource: u64, new_limit: *const u8, _old_limit: *mut u8) -> Result<usize, Errno> {
    // Limits are neither enforced nor tracked; setting is refused,
    // queries report "no limit" by leaving the buffer untouched.
    if !new_limit.is_null() {
        return Err(Errno::EPERM);
    }
    Ok(0)
});

/// Xorshift state for `getrandom`. Seeded once from the cycle counter.
static RANDOM_STATE: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

fn next_random() -> u64 {
    let mut x = RANDOM_STATE.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    RANDOM_STATE.store(x, Ordering::Relaxed);
    x
}

syscall_handler!(pub(super) fn sys_getrandom(buf: *mut u8, buflen: usize, _flags: u64) -> Result<usize, Errno> {
    if buf.is_null() {
        return Err(Errno::EFAULT);
    }
    let mut written = 0usize;
    while written < buflen {
        let word = next_random().to_le_bytes();
        let chunk = (buflen - written).min(8);
        // SAFETY: The user buffer holds `buflen` writable bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(word.as_ptr(), buf.add(written), chunk);
        }
        written += chunk;
    }
    Ok(buflen)
});

syscall_handler!(pub(super) fn sys_rseq(_rseq: u64, _rseq_len: u64, _flags: u64, _sig: u64) -> Result<usize, Errno> {
    // Restartable sequences are accepted and never consulted: there is
    // no CPU migration to restart over.
    Ok(0)
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_stream_advances() {
        let a = next_random();
        let b = next_random();
        assert_ne!(a, b);
        assert_ne!(a, 0);
    }
}
