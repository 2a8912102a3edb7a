//! The compile-time syscall dispatch table and arity-erased wrappers.
//!
//! A static list of [`Entry`] records (name, number, handler) turns into
//! a full `[Slot; MAX_NR]` table in a `const` context; unlisted numbers
//! get the tracing [`unhandled`] handler. Typed handlers declare 0 to 6
//! arguments and are adapted to the erased register-file signature by
//! the [`syscall_handler!`] macro, which extracts the right number of
//! slots from the six-register ABI (`rdi, rsi, rdx, r10, r8, r9`) and
//! performs the primitive conversions.

use norn_core::addr::VirtAddr;

use crate::errno::Errno;
use crate::nr::MAX_NR;

/// The six argument registers of a syscall, in ABI order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallArgs {
    /// `rdi, rsi, rdx, r10, r8, r9`.
    pub regs: [u64; 6],
}

impl SyscallArgs {
    /// Packs explicit register values.
    pub const fn new(regs: [u64; 6]) -> Self {
        Self { regs }
    }
}

/// Erased handler signature: the slot number plus the register file.
pub type Handler = fn(usize, &SyscallArgs) -> i64;

/// One table-construction record.
#[derive(Clone, Copy)]
pub struct Entry {
    /// Human-readable name for tracing.
    pub name: &'static str,
    /// Syscall number.
    pub nr: usize,
    /// Erased handler.
    pub handler: Handler,
}

/// One resolved table slot.
#[derive(Clone, Copy)]
pub struct Slot {
    /// Name for tracing ("unhandled" for default slots).
    pub name: &'static str,
    /// Erased handler.
    pub handler: Handler,
}

/// The tracing handler filling every slot no entry names.
///
/// Logs the number and returns `-Unimplemented`; the caller is never
/// aborted by an unknown call.
pub fn unhandled(nr: usize, _args: &SyscallArgs) -> i64 {
    norn_core::kwarn!("unhandled syscall nr={nr}");
    Errno::Unimplemented.as_ret()
}

/// The dispatch table.
pub struct SyscallTable {
    slots: [Slot; MAX_NR],
}

impl SyscallTable {
    /// Builds a table from an entry list in a `const` context.
    ///
    /// # Panics
    ///
    /// Compile-time panic when an entry number exceeds [`MAX_NR`] or two
    /// entries claim the same slot.
    pub const fn build(entries: &[Entry]) -> Self {
        let mut slots = [const {
            Slot {
                name: "unhandled",
                handler: unhandled as Handler,
            }
        }; MAX_NR];
        let mut i = 0;
        while i < entries.len() {
            let entry = &entries[i];
            assert!(entry.nr < MAX_NR, "syscall number out of table range");
            // Two entries for one slot is a table-definition bug.
            let mut j = 0;
            while j < i {
                assert!(entries[j].nr != entry.nr, "duplicate syscall number");
                j += 1;
            }
            slots[entry.nr] = Slot {
                name: entry.name,
                handler: entry.handler,
            };
            i += 1;
        }
        Self { slots }
    }

    /// Routes one call. Out-of-range numbers trace and return
    /// `-Unimplemented` like any unlisted slot.
    pub fn dispatch(&self, nr: usize, args: &SyscallArgs) -> i64 {
        if nr >= MAX_NR {
            return unhandled(nr, args);
        }
        (self.slots[nr].handler)(nr, args)
    }

    /// The name registered for `nr`.
    pub fn name(&self, nr: usize) -> &'static str {
        if nr >= MAX_NR {
            "unhandled"
        } else {
            self.slots[nr].name
        }
    }
}

// ---------------------------------------------------------------------------
// Argument and return conversions
// ---------------------------------------------------------------------------

/// Conversion from a raw argument register.
pub trait FromSyscallArg: Sized {
    /// Interprets the raw register value.
    fn from_arg(raw: u64) -> Self;
}

impl FromSyscallArg for u64 {
    fn from_arg(raw: u64) -> Self {
        raw
    }
}

impl FromSyscallArg for usize {
    fn from_arg(raw: u64) -> Self {
        raw as usize
    }
}

impl FromSyscallArg for i64 {
    fn from_arg(raw: u64) -> Self {
        raw as i64
    }
}

impl FromSyscallArg for u32 {
    fn from_arg(raw: u64) -> Self {
        raw as u32
    }
}

impl FromSyscallArg for i32 {
    fn from_arg(raw: u64) -> Self {
        raw as i32
    }
}

impl FromSyscallArg for VirtAddr {
    fn from_arg(raw: u64) -> Self {
        VirtAddr::new(raw)
    }
}

impl<T> FromSyscallArg for *const T {
    fn from_arg(raw: u64) -> Self {
        raw as *const T
    }
}

impl<T> FromSyscallArg for *mut T {
    fn from_arg(raw: u64) -> Self {
        raw as *mut T
    }
}

/// Conversion of a typed handler result into the `rax` return value.
pub trait IntoSyscallRet {
    /// Encodes the value (non-negative success, `-errno` failure).
    fn into_ret(self) -> i64;
}

impl IntoSyscallRet for i64 {
    fn into_ret(self) -> i64 {
        self
    }
}

impl IntoSyscallRet for usize {
    fn into_ret(self) -> i64 {
        self as i64
    }
}

impl IntoSyscallRet for u64 {
    fn into_ret(self) -> i64 {
        self as i64
    }
}

impl IntoSyscallRet for VirtAddr {
    fn into_ret(self) -> i64 {
        self.as_u64() as i64
    }
}

impl IntoSyscallRet for () {
    fn into_ret(self) -> i64 {
        0
    }
}

impl<T: IntoSyscallRet> IntoSyscallRet for Result<T, Errno> {
    fn into_ret(self) -> i64 {
        match self {
            Ok(v) => v.into_ret(),
            Err(e) => e.as_ret(),
        }
    }
}

/// Wraps a typed handler of 0 to 6 arguments into the erased [`Handler`]
/// signature.
///
/// ```ignore
/// syscall_handler!(fn sys_write(fd: i32, buf: *const u8, count: usize) -> Result<usize, Errno> {
///     ...
/// });
/// ```
#[macro_export]
macro_rules! syscall_handler {
    ($(#[$attr:meta])* $vis:vis fn $name:ident($($arg:ident : $ty:ty),* $(,)?) -> $ret:ty $body:block) => {
        $(#[$attr])*
        $vis fn $name(_nr: usize, args: &$crate::table::SyscallArgs) -> i64 {
            #[allow(unused_mut)]
            let mut _regs = args.regs.iter();
            $(
                let $arg: $ty = $crate::table::FromSyscallArg::from_arg(
                    _regs.next().copied().unwrap_or(0),
                );
            )*
            let result: $ret = (|| $body)();
            $crate::table::IntoSyscallRet::into_ret(result)
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nr;

    syscall_handler!(fn sys_nop() -> i64 {
        7
    });

    syscall_handler!(fn sys_add2(a: u64, b: u64) -> u64 {
        a + b
    });

    syscall_handler!(fn sys_types(addr: VirtAddr, signed: i32, ptr: *const u8) -> i64 {
        assert_eq!(addr.as_u64(), 0x8000_0000);
        assert_eq!(signed, -5);
        assert_eq!(ptr as usize, 0xDEAD_F000);
        1
    });

    syscall_handler!(fn sys_six(a: u64, b: u64, c: u64, d: u64, e: u64, f: u64) -> u64 {
        a + 2 * b + 3 * c + 4 * d + 5 * e + 6 * f
    });

    syscall_handler!(fn sys_failing(code: u64) -> Result<usize, Errno> {
        if code == 0 {
            Err(Errno::EINVAL)
        } else {
            Ok(code as usize)
        }
    });

    const ENTRIES: &[Entry] = &[
        Entry {
            name: "nop",
            nr: nr::GETUID,
            handler: sys_nop,
        },
        Entry {
            name: "add2",
            nr: nr::WRITE,
            handler: sys_add2,
        },
        Entry {
            name: "types",
            nr: nr::BRK,
            handler: sys_types,
        },
        Entry {
            name: "six",
            nr: nr::RSEQ,
            handler: sys_six,
        },
        Entry {
            name: "failing",
            nr: nr::IOCTL,
            handler: sys_failing,
        },
    ];

    static TABLE: SyscallTable = SyscallTable::build(ENTRIES);

    fn args(regs: [u64; 6]) -> SyscallArgs {
        SyscallArgs::new(regs)
    }

    #[test]
    fn zero_arg_dispatch() {
        assert_eq!(TABLE.dispatch(nr::GETUID, &args([0; 6])), 7);
    }

    #[test]
    fn two_arg_dispatch() {
        assert_eq!(TABLE.dispatch(nr::WRITE, &args([30, 12, 0, 0, 0, 0])), 42);
    }

    #[test]
    fn typed_conversions() {
        let a = args([0x8000_0000, (-5i64) as u64, 0xDEAD_F000, 0, 0, 0]);
        assert_eq!(TABLE.dispatch(nr::BRK, &a), 1);
    }

    #[test]
    fn six_arg_dispatch() {
        let a = args([1, 1, 1, 1, 1, 1]);
        assert_eq!(TABLE.dispatch(nr::RSEQ, &a), 21);
    }

    #[test]
    fn result_conversion() {
        assert_eq!(
            TABLE.dispatch(nr::IOCTL, &args([0; 6])),
            Errno::EINVAL.as_ret()
        );
        assert_eq!(TABLE.dispatch(nr::IOCTL, &args([9, 0, 0, 0, 0, 0])), 9);
    }

    #[test]
    fn unlisted_slot_returns_unimplemented() {
        assert_eq!(
            TABLE.dispatch(nr::GETRANDOM, &args([0; 6])),
            Errno::Unimplemented.as_ret()
        );
        assert_eq!(TABLE.name(nr::GETRANDOM), "unhandled");
    }

    #[test]
    fn out_of_range_number() {
        assert_eq!(
            TABLE.dispatch(MAX_NR + 100, &args([0; 6])),
            Errno::Unimplemented.as_ret()
        );
    }

    #[test]
    fn names_are_registered() {
        assert_eq!(TABLE.name(nr::WRITE), "add2");
        assert_eq!(TABLE.name(nr::GETUID), "nop");
    }
}
