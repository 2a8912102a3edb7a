//! Hardware instruction wrappers.
//!
//! Everything here is gated on a kernel target; host builds see inert
//! fallbacks so the callers compile and test unchanged.

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod imp {
    use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

    /// TSC ticks per microsecond, measured against the PM timer during
    /// boot calibration.
    static TSC_PER_US: AtomicU64 = AtomicU64::new(0);

    /// Registered LAPIC EOI function (the APIC driver owns the MMIO).
    static EOI_FN: AtomicPtr<()> = AtomicPtr::new(nop_eoi as *mut ());

    fn nop_eoi() {}

    /// Stores the boot-time TSC calibration result.
    pub fn set_tsc_calibration(ticks_per_us: u64) {
        TSC_PER_US.store(ticks_per_us, Ordering::Release);
    }

    /// Registers the LAPIC EOI routine.
    pub fn register_eoi(f: fn()) {
        EOI_FN.store(f as *mut (), Ordering::Release);
    }

    /// Reads the time-stamp counter.
    #[inline]
    pub fn rdtsc() -> u64 {
        let lo: u32;
        let hi: u32;
        // SAFETY: RDTSC has no side effects.
        unsafe {
            core::arch::asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack));
        }
        (u64::from(hi) << 32) | u64::from(lo)
    }

    /// Monotonic nanoseconds derived from the calibrated TSC.
    pub fn tsc_ns() -> u64 {
        let per_us = TSC_PER_US.load(Ordering::Acquire);
        if per_us == 0 {
            return 0;
        }
        rdtsc() * 1000 / per_us
    }

    /// Signals end-of-interrupt through the registered routine.
    pub fn lapic_eoi() {
        let ptr = EOI_FN.load(Ordering::Acquire);
        // SAFETY: Only `nop_eoi` or a registered `fn()` is ever stored.
        let f: fn() = unsafe { core::mem::transmute(ptr) };
        f();
    }

    /// Writes the FS segment base (TLS pointer for user code).
    pub fn set_fs_base(base: u64) {
        const IA32_FS_BASE: u32 = 0xC000_0100;
        // SAFETY: Writing IA32_FS_BASE is safe in ring 0; user code only
        // observes its own TLS pointer.
        unsafe {
            core::arch::asm!(
                "wrmsr",
                in("ecx") IA32_FS_BASE,
                in("eax") base as u32,
                in("edx") (base >> 32) as u32,
                options(nomem, nostack, preserves_flags),
            );
        }
    }

    /// Halts until the next interrupt.
    #[inline]
    pub fn hlt() {
        // SAFETY: HLT in ring 0 just waits for an interrupt.
        unsafe { core::arch::asm!("hlt", options(nomem, nostack, preserves_flags)) };
    }

    /// Disables interrupts and halts forever.
    pub fn halt_forever() -> ! {
        loop {
            // SAFETY: Final parking of a dead CPU.
            unsafe {
                core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
                core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
            }
        }
    }
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
mod imp {
    /// Host stand-in: calibration is meaningless off-target.
    pub fn set_tsc_calibration(_ticks_per_us: u64) {}

    /// Host stand-in: there is no interrupt controller.
    pub fn register_eoi(_f: fn()) {}

    /// Host stand-in for the TSC.
    pub fn tsc_ns() -> u64 {
        0
    }

    /// Host stand-in for EOI.
    pub fn lapic_eoi() {}

    /// Host stand-in for the FS base write.
    pub fn set_fs_base(_base: u64) {}

    /// Host stand-in for `hlt`.
    pub fn hlt() {}

    /// Host stand-in: panics instead of parking the CPU.
    pub fn halt_forever() -> ! {
        panic!("halt_forever on a host build");
    }
}

pub use imp::{
    halt_forever, hlt, lapic_eoi, register_eoi, set_fs_base, set_tsc_calibration, tsc_ns,
};
