//! I/O syscalls: write, writev, ioctl, dlog.

use norn_core::{kinfo, kprint};
use norn_syscall::Errno;
use norn_syscall::syscall_handler;

use super::user_slice;

/// Standard output and error descriptors, wired to the kernel console.
const STDOUT: i32 = 1;
const STDERR: i32 = 2;

/// One element of a `writev` vector, ABI-compatible with Linux `iovec`.
#[repr(C)]
#[derive(Clone, Copy)]
struct IoVec {
    base: *const u8,
    len: usize,
}

fn write_console(bytes: &[u8]) -> usize {
    if let Ok(s) = core::str::from_utf8(bytes) {
        kprint!("{s}");
    } else {
        // Replace undecodable output byte-wise.
        for &b in bytes {
            kprint!("{}", b as char);
        }
    }
    bytes.len()
}

syscall_handler!(pub(super) fn sys_write(fd: i32, buf: *const u8, count: usize) -> Result<usize, Errno> {
    // SAFETY: User pointers are valid in the current address space; the
    // syscall entry ran in that process context.
    let bytes = unsafe { user_slice(buf, count) };
    match fd {
        STDOUT | STDERR => Ok(write_console(bytes)),
        // The initramfs surface is read-only; nothing else is writable.
        _ => Err(Errno::EBADF),
    }
});

syscall_handler!(pub(super) fn sys_writev(fd: i32, iov: *const u8, iovcnt: usize) -> Result<usize, Errno> {
    if fd != STDOUT && fd != STDERR {
        return Err(Errno::EBADF);
    }
    if iov.is_null() || iovcnt > 1024 {
        return Err(Errno::EINVAL);
    }
    let mut total = 0usize;
    for i in 0..iovcnt {
        // SAFETY: The iovec array is user memory of `iovcnt` entries.
        let entry = unsafe { iov.cast::<IoVec>().add(i).read() };
        // SAFETY: Each entry references readable user bytes.
        let bytes = unsafe { user_slice(entry.base, entry.len) };
        total += write_console(bytes);
    }
    Ok(total)
});

syscall_handler!(pub(super) fn sys_ioctl(fd: i32, _request: u64, _arg: u64) -> Result<usize, Errno> {
    // No terminal devices expose control operations yet.
    if fd == STDOUT || fd == STDERR {
        Err(Errno::ENOTTY)
    } else {
        Err(Errno::EBADF)
    }
});

syscall_handler!(pub(super) fn sys_dlog(buf: *const u8, len: usize) -> Result<usize, Errno> {
    // SAFETY: User pointer valid in the current address space.
    let bytes = unsafe { user_slice(buf, len.min(1024)) };
    match core::str::from_utf8(bytes) {
        Ok(s) => {
            kinfo!("dlog: {}", s.trim_end());
            Ok(len)
        }
        Err(_) => Err(Errno::EINVAL),
    }
});
