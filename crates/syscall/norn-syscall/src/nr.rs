//! Syscall numbers.
//!
//! Linux-compatible where the calls overlap; `DLOG` (500) is Norn's
//! debug-log call.

/// Number of slots in the dispatch table.
pub const MAX_NR: usize = 512;

/// `read(fd, buf, count)`.
pub const READ: usize = 0;
/// `write(fd, buf, count)`.
pub const WRITE: usize = 1;
/// `fstat(fd, statbuf)`.
pub const FSTAT: usize = 5;
/// `mprotect(addr, len, prot)`.
pub const MPROTECT: usize = 10;
/// `brk(addr)`.
pub const BRK: usize = 12;
/// `ioctl(fd, request, arg)`.
pub const IOCTL: usize = 16;
/// `writev(fd, iov, iovcnt)`.
pub const WRITEV: usize = 20;
/// `getuid()`.
pub const GETUID: usize = 102;
/// `arch_prctl(code, addr)`.
pub const ARCH_PRCTL: usize = 158;
/// `set_tid_address(tidptr)`.
pub const SET_TID_ADDRESS: usize = 218;
/// `exit_group(status)`.
pub const EXIT_GROUP: usize = 231;
/// `openat(dirfd, pathname, flags, mode)`.
pub const OPENAT: usize = 257;
/// `newfstatat(dirfd, pathname, statbuf, flags)`.
pub const NEWFSTATAT: usize = 262;
/// `readlinkat(dirfd, pathname, buf, bufsiz)`.
pub const READLINKAT: usize = 267;
/// `prlimit64(pid, resource, new_limit, old_limit)`.
pub const PRLIMIT64: usize = 302;
/// `getrandom(buf, buflen, flags)`.
pub const GETRANDOM: usize = 318;
/// `rseq(rseq, rseq_len, flags, sig)`.
pub const RSEQ: usize = 334;
/// `dlog(buf, len)` — Norn-specific debug log.
pub const DLOG: usize = 500;
