//! The syscall surface.
//!
//! The dispatch table is assembled at compile time from the handler
//! modules below; every slot the table does not name traces and returns
//! `-Unimplemented`. Handlers convert subsystem errors into [`Errno`]
//! right here at the boundary; no error aborts the calling task.

mod io;
mod memory;
mod process;
mod vfs;

use norn_fs::FsError;
use norn_mm::MmError;
use norn_syscall::table::Entry;
use norn_syscall::{Errno, SyscallArgs, SyscallTable, nr};

/// Maps filesystem surface errors onto errno values.
pub(crate) fn fs_errno(e: FsError) -> Errno {
    match e {
        FsError::NotFound => Errno::ENOENT,
        FsError::AlreadyExists => Errno::EEXIST,
        FsError::BadFileDescriptor => Errno::EBADF,
        FsError::InvalidArgument => Errno::EINVAL,
        FsError::DescriptorFull => Errno::EMFILE,
    }
}

/// Maps memory subsystem errors onto errno values.
pub(crate) fn mm_errno(e: MmError) -> Errno {
    match e {
        MmError::OutOfMemory => Errno::ENOMEM,
        MmError::InvalidRegion | MmError::NotMapped | MmError::InvalidArgument => Errno::EINVAL,
    }
}

/// The kernel syscall table.
static TABLE: SyscallTable = SyscallTable::build(&[
    Entry {
        name: "read",
        nr: nr::READ,
        handler: vfs::sys_read,
    },
    Entry {
        name: "write",
        nr: nr::WRITE,
        handler: io::sys_write,
    },
    Entry {
        name: "fstat",
        nr: nr::FSTAT,
        handler: vfs::sys_fstat,
    },
    Entry {
        name: "mprotect",
        nr: nr::MPROTECT,
        handler: memory::sys_mprotect,
    },
    Entry {
        name: "brk",
        nr: nr::BRK,
        handler: memory::sys_brk,
    },
    Entry {
        name: "ioctl",
        nr: nr::IOCTL,
        handler: io::sys_ioctl,
    },
    Entry {
        name: "writev",
        nr: nr::WRITEV,
        handler: io::sys_writev,
    },
    Entry {
        name: "getuid",
        nr: nr::GETUID,
        handler: process::sys_getuid,
    },
    Entry {
        name: "arch_prctl",
        nr: nr::ARCH_PRCTL,
        handler: process::sys_arch_prctl,
    },
    Entry {
        name: "set_tid_address",
        nr: nr::SET_TID_ADDRESS,
        handler: process::sys_set_tid_address,
    },
    Entry {
        name: "exit_group",
        nr: nr::EXIT_GROUP,
        handler: process::sys_exit_group,
    },
    Entry {
        name: "openat",
        nr: nr::OPENAT,
        handler: vfs::sys_openat,
    },
    Entry {
        name: "newfstatat",
        nr: nr::NEWFSTATAT,
        handler: vfs::sys_newfstatat,
    },
    Entry {
        name: "readlinkat",
        nr: nr::READLINKAT,
        handler: vfs::sys_readlinkat,
    },
    Entry {
        name: "prlimit64",
        nr: nr::PRLIMIT64,
        handler: process::sys_prlimit64,
    },
    Entry {
        name: "getrandom",
        nr: nr::GETRANDOM,
        handler: process::sys_getrandom,
    },
    Entry {
        name: "rseq",
        nr: nr::RSEQ,
        handler: process::sys_rseq,
    },
    Entry {
        name: "dlog",
        nr: nr::DLOG,
        handler: io::sys_dlog,
    },
]);

/// Syscall entry point, called by the SYSCALL path with the six
/// argument registers.
pub fn dispatch(nr: usize, args: &SyscallArgs) -> i64 {
    TABLE.dispatch(nr, args)
}

/// Name registered for a syscall number (tracing).
pub fn name(nr: usize) -> &'static str {
    TABLE.name(nr)
}

/// Reads a user byte slice.
///
/// # Safety
///
/// `ptr` must reference `len` readable bytes in the current address
/// space for the duration of the borrow.
pub(crate) unsafe fn user_slice<'a>(ptr: *const u8, len: usize) -> &'a [u8] {
    if ptr.is_null() || len == 0 {
        return &[];
    }
    // SAFETY: Per this function's contract.
    unsafe { core::slice::from_raw_parts(ptr, len) }
}

/// Reads a user NUL-terminated string of at most `max` bytes.
///
/// # Safety
///
/// `ptr` must reference a NUL-terminated byte sequence readable in the
/// current address space.
pub(crate) unsafe fn user_cstr<'a>(ptr: *const u8, max: usize) -> Result<&'a str, Errno> {
    if ptr.is_null() {
        return Err(Errno::EFAULT);
    }
    let mut len = 0;
    // SAFETY: Per this function's contract.
    while len < max && unsafe { *ptr.add(len) } != 0 {
        len += 1;
    }
    if len == max {
        return Err(Errno::EINVAL);
    }
    // SAFETY: The range up to `len` was just probed.
    core::str::from_utf8(unsafe { core::slice::from_raw_parts(ptr, len) })
        .map_err(|_| Errno::EINVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(regs: [u64; 6]) -> SyscallArgs {
        SyscallArgs::new(regs)
    }

    #[test]
    fn unknown_syscall_traces_unimplemented() {
        assert_eq!(dispatch(411, &args([0; 6])), Errno::Unimplemented.as_ret());
        assert_eq!(name(411), "unhandled");
    }

    #[test]
    fn known_slots_are_named() {
        assert_eq!(name(nr::WRITE), "write");
        assert_eq!(name(nr::BRK), "brk");
        assert_eq!(name(nr::DLOG), "dlog");
    }

    #[test]
    fn getuid_is_root() {
        assert_eq!(dispatch(nr::GETUID, &args([0; 6])), 0);
    }

    #[test]
    fn write_to_stdout_counts_bytes() {
        let msg = b"hello syscall";
        let a = args([1, msg.as_ptr() as u64, msg.len() as u64, 0, 0, 0]);
        assert_eq!(dispatch(nr::WRITE, &a), msg.len() as i64);
    }

    #[test]
    fn write_to_bad_fd_fails() {
        let msg = b"x";
        let a = args([33, msg.as_ptr() as u64, 1, 0, 0, 0]);
        assert_eq!(dispatch(nr::WRITE, &a), Errno::EBADF.as_ret());
    }

    #[test]
    fn writev_sums_vectors() {
        #[repr(C)]
        struct IoVec {
            base: *const u8,
            len: usize,
        }
        let a_buf = b"abc";
        let b_buf = b"defgh";
        let iov = [
            IoVec {
                base: a_buf.as_ptr(),
                len: a_buf.len(),
            },
            IoVec {
                base: b_buf.as_ptr(),
                len: b_buf.len(),
            },
        ];
        let a = args([1, iov.as_ptr() as u64, 2, 0, 0, 0]);
        assert_eq!(dispatch(nr::WRITEV, &a), 8);
    }

    #[test]
    fn rseq_and_prlimit_succeed_quietly() {
        assert_eq!(dispatch(nr::RSEQ, &args([0; 6])), 0);
        assert_eq!(dispatch(nr::PRLIMIT64, &args([0; 6])), 0);
    }

    #[test]
    fn getrandom_fills_buffer() {
        let mut buf = [0u8; 32];
        let a = args([buf.as_mut_ptr() as u64, buf.len() as u64, 0, 0, 0, 0]);
        assert_eq!(dispatch(nr::GETRANDOM, &a), 32);
        // Not all zero with overwhelming probability.
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn error_mappings() {
        assert_eq!(fs_errno(FsError::NotFound), Errno::ENOENT);
        assert_eq!(fs_errno(FsError::DescriptorFull), Errno::EMFILE);
        assert_eq!(mm_errno(MmError::OutOfMemory), Errno::ENOMEM);
        assert_eq!(mm_errno(MmError::InvalidRegion), Errno::EINVAL);
    }

    #[test]
    fn cstr_reader() {
        let s = b"/bin/sh\0";
        // SAFETY: s is a valid NUL-terminated buffer.
        let parsed = unsafe { user_cstr(s.as_ptr(), 64) }.unwrap();
        assert_eq!(parsed, "/bin/sh");

        let unterminated = b"xxxx";
        // SAFETY: max stops the probe within the buffer.
        assert_eq!(
            unsafe { user_cstr(unterminated.as_ptr(), 4) },
            Err(Errno::EINVAL)
        );
    }
}
