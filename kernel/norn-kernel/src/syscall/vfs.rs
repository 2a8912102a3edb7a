//! Filesystem syscalls: openat, read, fstat, newfstatat, readlinkat.

use norn_fs::NodeKind;
use norn_fs::fd::File;
use norn_fs::vfs::{self, Stat};
use norn_syscall::Errno;
use norn_syscall::syscall_handler;

use super::{fs_errno, user_cstr};
use crate::proc::with_current_process;

/// `AT_FDCWD`: resolve relative to the working directory.
const AT_FDCWD: i32 = -100;

/// Longest accepted path.
const PATH_MAX: usize = 512;

/// Userspace `struct stat`, Linux x86_64 layout (144 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct UserStat {
    st_dev: u64,
    st_ino: u64,
    st_nlink: u64,
    st_mode: u32,
    st_uid: u32,
    st_gid: u32,
    _pad0: u32,
    st_rdev: u64,
    st_size: i64,
    st_blksize: i64,
    st_blocks: i64,
    st_atime: [i64; 2],
    st_mtime: [i64; 2],
    st_ctime: [i64; 2],
    _reserved: [i64; 3],
}

const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;

fn user_stat_of(stat: Stat) -> UserStat {
    let mode = match stat.kind {
        NodeKind::File => S_IFREG | 0o444,
        NodeKind::Dir => S_IFDIR | 0o555,
        NodeKind::CharDev => S_IFCHR | 0o666,
    };
    UserStat {
        st_nlink: 1,
        st_mode: mode,
        st_size: stat.size as i64,
        st_blksize: 4096,
        st_blocks: (stat.size as i64 + 511) / 512,
        ..UserStat::default()
    }
}

/// Writes a [`UserStat`] to a user pointer.
///
/// # Safety
///
/// `dst` must reference 144 writable bytes in the current address space.
unsafe fn write_stat(dst: *mut u8, stat: Stat) -> Result<usize, Errno> {
    if dst.is_null() {
        return Err(Errno::EFAULT);
    }
    // SAFETY: Per this function's contract.
    unsafe { dst.cast::<UserStat>().write_unaligned(user_stat_of(stat)) };
    Ok(0)
}

fn resolve_at(dirfd: i32, path: &str) -> Result<alloc::sync::Arc<vfs::Dentry>, Errno> {
    // Only absolute paths are supported; the dirfd is ignored for them,
    // which covers the AT_FDCWD convention.
    if !path.starts_with('/') {
        return Err(if dirfd == AT_FDCWD {
            Errno::ENOENT
        } else {
            Errno::EBADF
        });
    }
    vfs::resolve(path).map_err(fs_errno)
}

syscall_handler!(pub(super) fn sys_openat(dirfd: i32, pathname: *const u8, _flags: u64, _mode: u64) -> Result<usize, Errno> {
    // SAFETY: User pointer valid in the current address space.
    let path = unsafe { user_cstr(pathname, PATH_MAX) }?;
    let dentry = resolve_at(dirfd, path)?;
    let file = File::open(dentry).map_err(fs_errno)?;
    with_current_process(|p| p.fds.install(file).map_err(fs_errno))
        .ok_or(Errno::ESRCH)?
});

syscall_handler!(pub(super) fn sys_read(fd: i32, buf: *mut u8, count: usize) -> Result<usize, Errno> {
    if fd < 0 {
        return Err(Errno::EBADF);
    }
    if buf.is_null() {
        return Err(Errno::EFAULT);
    }
    // SAFETY: The user buffer holds `count` writable bytes.
    let out = unsafe { core::slice::from_raw_parts_mut(buf, count) };
    with_current_process(|p| {
        let file = p.fds.get_mut(fd as usize).map_err(fs_errno)?;
        file.read(out).map_err(fs_errno)
    })
    .ok_or(Errno::ESRCH)?
});

syscall_handler!(pub(super) fn sys_fstat(fd: i32, statbuf: *mut u8) -> Result<usize, Errno> {
    if fd < 0 {
        return Err(Errno::EBADF);
    }
    let stat = with_current_process(|p| p.fds.get_mut(fd as usize).map(|f| File::stat(f)).map_err(fs_errno))
        .ok_or(Errno::ESRCH)??;
    // SAFETY: The user buffer holds a writable struct stat.
    unsafe { write_stat(statbuf, stat) }
});

syscall_handler!(pub(super) fn sys_newfstatat(dirfd: i32, pathname: *const u8, statbuf: *mut u8, _flags: u64) -> Result<usize, Errno> {
    // SAFETY: User pointer valid in the current address space.
    let path = unsafe { user_cstr(pathname, PATH_MAX) }?;
    let dentry = resolve_at(dirfd, path)?;
    let stat = (dentry.ops.stat)(&dentry);
    // SAFETY: The user buffer holds a writable struct stat.
    unsafe { write_stat(statbuf, stat) }
});

syscall_handler!(pub(super) fn sys_readlinkat(_dirfd: i32, _pathname: *const u8, _buf: *mut u8, _bufsiz: usize) -> Result<usize, Errno> {
    // The initramfs tree carries no symlinks.
    Err(Errno::EINVAL)
});
