//! Single source of truth for Norn syscall definitions.
//!
//! Syscall numbers are Linux-compatible where the two systems overlap;
//! the dlog call (500) is Norn-specific. The dispatch table is built at
//! compile time from a static entry list ([`table::SyscallTable::build`]),
//! with unlisted slots falling through to a tracing "unhandled" handler.
//! Typed handlers of 0 to 6 arguments are wrapped into the erased
//! register-file signature by [`syscall_handler!`].

#![cfg_attr(not(test), no_std)]

pub mod errno;
pub mod nr;
pub mod table;

pub use errno::Errno;
pub use table::{Entry, SyscallArgs, SyscallTable};
