//! Initial user stack construction.
//!
//! Builds the System-V style startup stack bottom-up (addresses
//! descend) inside the stack VMA's backing memory:
//!
//! ```text
//! low                                                          high
//! argc | argv[..] NULL | envp[..] NULL | auxv.. AT_NULL | pad | blobs | 0
//! ```
//!
//! Every fixed-size push is 8-byte aligned, opaque blobs are 16-byte
//! aligned, and the final stack pointer handed to user code is 16-byte
//! aligned. Handle-type auxv entries are patched with the recorded
//! user-space address of their blob.

use norn_core::addr::VirtAddr;

/// Auxiliary vector terminator.
pub const AT_NULL: u64 = 0;
/// Program header table address.
pub const AT_PHDR: u64 = 3;
/// Program header entry size.
pub const AT_PHENT: u64 = 4;
/// Number of program headers.
pub const AT_PHNUM: u64 = 5;
/// System page size.
pub const AT_PAGESZ: u64 = 6;
/// Interpreter base address.
pub const AT_BASE: u64 = 7;
/// Program entry point.
pub const AT_ENTRY: u64 = 9;
/// Real user id.
pub const AT_UID: u64 = 11;
/// Effective user id.
pub const AT_EUID: u64 = 12;
/// Real group id.
pub const AT_GID: u64 = 13;
/// Effective group id.
pub const AT_EGID: u64 = 14;
/// Address of 16 random bytes.
pub const AT_RANDOM: u64 = 25;

/// An immediate auxiliary vector entry.
#[derive(Debug, Clone, Copy)]
pub struct AuxEntry {
    /// `AT_*` type id.
    pub key: u64,
    /// Immediate value.
    pub value: u64,
}

/// Errors from stack construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    /// The stack VMA cannot hold the requested content.
    Overflow,
    /// More strings than the address recorder can hold.
    TooManyStrings,
}

/// Upper bound on argv/envp entries.
const MAX_STRINGS: usize = 64;

/// Builds the initial user stack inside a writable VMA image.
pub struct StackCreator<'a> {
    /// Backing bytes of the stack VMA.
    mem: &'a mut [u8],
    /// User address of `mem[0]`.
    base_va: VirtAddr,
    /// Current stack top as a byte offset; descends.
    sp: usize,
}

impl<'a> StackCreator<'a> {
    /// Starts a stack at the top of `mem`, writing the 8-byte NULL
    /// endmark.
    ///
    /// `base_va` is the user address of `mem[0]` and must be 16-byte
    /// aligned (stack VMAs are page-aligned).
    pub fn new(mem: &'a mut [u8], base_va: VirtAddr) -> Result<Self, StackError> {
        debug_assert!(base_va.is_aligned(16));
        debug_assert!(mem.len() % 16 == 0);
        let mut creator = Self {
            sp: mem.len(),
            mem,
            base_va,
        };
        creator.push_u64(0)?;
        Ok(creator)
    }

    /// User address of the current stack top.
    fn sp_va(&self) -> VirtAddr {
        self.base_va + self.sp as u64
    }

    fn push_bytes(&mut self, data: &[u8]) -> Result<(), StackError> {
        if self.sp < data.len() {
            return Err(StackError::Overflow);
        }
        self.sp -= data.len();
        self.mem[self.sp..self.sp + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn push_u64(&mut self, value: u64) -> Result<(), StackError> {
        debug_assert!(self.sp % 8 == 0, "unaligned 8-byte push");
        self.push_bytes(&value.to_le_bytes())
    }

    /// Pushes an opaque blob, 16-byte aligned, and records its address.
    fn push_blob(&mut self, data: &[u8]) -> Result<VirtAddr, StackError> {
        if self.sp < data.len() {
            return Err(StackError::Overflow);
        }
        self.sp = (self.sp - data.len()) & !15;
        self.mem[self.sp..self.sp + data.len()].copy_from_slice(data);
        Ok(self.sp_va())
    }

    /// Pushes a NUL-terminated string and records its address.
    fn push_str(&mut self, s: &str) -> Result<VirtAddr, StackError> {
        self.push_bytes(&[0])?;
        self.push_bytes(s.as_bytes())?;
        Ok(self.sp_va())
    }

    /// Lays out the remaining stack content and returns the final,
    /// 16-byte aligned user stack pointer.
    ///
    /// `handle_auxv` entries carry the blob bytes their value should
    /// point to; the recorded blob addresses are patched in.
    pub fn finalize(
        mut self,
        argv: &[&str],
        envp: &[&str],
        imm_auxv: &[AuxEntry],
        handle_auxv: &[(u64, &[u8])],
    ) -> Result<VirtAddr, StackError> {
        if argv.len() > MAX_STRINGS || envp.len() > MAX_STRINGS {
            return Err(StackError::TooManyStrings);
        }

        // Opaque blobs referenced by handle auxv entries.
        let mut blob_addrs = [VirtAddr::zero(); MAX_STRINGS];
        for (i, (_key, blob)) in handle_auxv.iter().enumerate() {
            if i >= MAX_STRINGS {
                return Err(StackError::TooManyStrings);
            }
            blob_addrs[i] = self.push_blob(blob)?;
        }

        // envp then argv strings, each group pushed in reverse so the
        // recorded addresses ascend in element order.
        let mut envp_addrs = [VirtAddr::zero(); MAX_STRINGS];
        for (i, s) in envp.iter().enumerate().rev() {
            envp_addrs[i] = self.push_str(s)?;
        }
        let mut argv_addrs = [VirtAddr::zero(); MAX_STRINGS];
        for (i, s) in argv.iter().enumerate().rev() {
            argv_addrs[i] = self.push_str(s)?;
        }

        // Fixed-size tail: auxv entries (16 bytes each, plus AT_NULL),
        // both pointer arrays with their NULL terminators, and argc.
        let fixed = (imm_auxv.len() + handle_auxv.len() + 1) * 16
            + (envp.len() + 1) * 8
            + (argv.len() + 1) * 8
            + 8;
        if self.sp < fixed {
            return Err(StackError::Overflow);
        }
        // Pad so the stack pointer is 16-byte aligned after every push.
        self.sp -= (self.sp - fixed) % 16;

        // Auxiliary vector, terminator first (pushes descend), then the
        // immediate entries, then the handle entries with their values
        // replaced by the recorded blob addresses.
        self.push_u64(AT_NULL)?;
        self.push_u64(AT_NULL)?;
        for entry in imm_auxv.iter().rev() {
            self.push_u64(entry.value)?;
            self.push_u64(entry.key)?;
        }
        for (i, (key, _blob)) in handle_auxv.iter().enumerate().rev() {
            self.push_u64(blob_addrs[i].as_u64())?;
            self.push_u64(*key)?;
        }

        // envp pointer array.
        self.push_u64(0)?;
        for i in (0..envp.len()).rev() {
            self.push_u64(envp_addrs[i].as_u64())?;
        }

        // argv pointer array and argc.
        self.push_u64(0)?;
        for i in (0..argv.len()).rev() {
            self.push_u64(argv_addrs[i].as_u64())?;
        }
        self.push_u64(argv.len() as u64)?;

        debug_assert!(self.sp_va().is_aligned(16));
        Ok(self.sp_va())
    }
}
