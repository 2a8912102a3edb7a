//! Kernel image layout symbols.
//!
//! The linker script delimits the image sections and the early boot
//! stack; the core assumes these symbols exist and are 4 KiB aligned.
//! Host builds substitute empty ranges so callers compile and test
//! unchanged.

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod imp {
    unsafe extern "C" {
        static __text_start: u8;
        static __text_end: u8;
        static __rodata_start: u8;
        static __rodata_end: u8;
        static __data_start: u8;
        static __bss_end: u8;
        static __early_stack_bottom: u8;
        static __early_stack_top: u8;
    }

    /// `[start, end)` of the kernel `.text` section.
    pub fn text_range() -> (u64, u64) {
        // SAFETY: Linker-provided symbols; only their addresses are read.
        unsafe {
            (
                core::ptr::addr_of!(__text_start) as u64,
                core::ptr::addr_of!(__text_end) as u64,
            )
        }
    }

    /// `[start, end)` of `.rodata`.
    pub fn rodata_range() -> (u64, u64) {
        // SAFETY: As above.
        unsafe {
            (
                core::ptr::addr_of!(__rodata_start) as u64,
                core::ptr::addr_of!(__rodata_end) as u64,
            )
        }
    }

    /// `[start, end)` of `.data` through `.bss`.
    pub fn data_bss_range() -> (u64, u64) {
        // SAFETY: As above.
        unsafe {
            (
                core::ptr::addr_of!(__data_start) as u64,
                core::ptr::addr_of!(__bss_end) as u64,
            )
        }
    }

    /// `[bottom, top)` of the early boot stack.
    pub fn early_stack_range() -> (u64, u64) {
        // SAFETY: As above.
        unsafe {
            (
                core::ptr::addr_of!(__early_stack_bottom) as u64,
                core::ptr::addr_of!(__early_stack_top) as u64,
            )
        }
    }
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
mod imp {
    /// Host stand-in: there is no kernel image.
    pub fn text_range() -> (u64, u64) {
        (0, 0)
    }

    /// Host stand-in.
    pub fn rodata_range() -> (u64, u64) {
        (0, 0)
    }

    /// Host stand-in.
    pub fn data_bss_range() -> (u64, u64) {
        (0, 0)
    }

    /// Host stand-in.
    pub fn early_stack_range() -> (u64, u64) {
        (0, 0)
    }
}

pub use imp::{data_bss_range, early_stack_range, rodata_range, text_range};

/// Returns `true` if `addr` lies in the kernel text section.
pub fn text_contains(addr: u64) -> bool {
    let (start, end) = text_range();
    addr >= start && addr < end
}
