//! Local interrupt state control.
//!
//! On kernel targets this reads and writes RFLAGS.IF with `pushfq`/`cli`/
//! `sti`. On host targets a process-global flag stands in so that the
//! IRQ-save/restore discipline of [`IrqSpinLock`](super::IrqSpinLock) can
//! be exercised by unit tests.

/// Saved interrupt state, as returned by [`save_and_disable`].
pub type IrqFlags = u64;

/// RFLAGS interrupt-enable bit.
const IF_BIT: u64 = 1 << 9;

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod imp {
    use super::{IF_BIT, IrqFlags};

    #[inline]
    pub fn save_and_disable() -> IrqFlags {
        let flags: u64;
        // SAFETY: Reading RFLAGS and disabling interrupts is safe in ring 0.
        unsafe {
            core::arch::asm!(
                "pushfq",
                "pop {}",
                "cli",
                out(reg) flags,
                options(nomem),
            );
        }
        flags
    }

    #[inline]
    pub fn restore(flags: IrqFlags) {
        // Only the IF bit matters; re-enable iff it was enabled before.
        if flags & IF_BIT != 0 {
            // SAFETY: Restoring a previously captured enabled state.
            unsafe {
                core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
            }
        }
    }

    #[inline]
    pub fn enabled() -> bool {
        let flags: u64;
        // SAFETY: Reading RFLAGS has no side effects.
        unsafe {
            core::arch::asm!(
                "pushfq",
                "pop {}",
                out(reg) flags,
                options(nomem),
            );
        }
        flags & IF_BIT != 0
    }

    #[inline]
    pub fn disable() {
        // SAFETY: Disabling interrupts is safe in ring 0.
        unsafe {
            core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
        }
    }

    #[inline]
    pub fn enable() {
        // SAFETY: The caller is responsible for only enabling interrupts when
        // the IDT is configured.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
mod imp {
    use super::{IF_BIT, IrqFlags};
    use core::sync::atomic::{AtomicBool, Ordering};

    /// Simulated interrupt-enable flag for host builds.
    static IRQ_ENABLED: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn save_and_disable() -> IrqFlags {
        let was_enabled = IRQ_ENABLED.swap(false, Ordering::AcqRel);
        if was_enabled { IF_BIT } else { 0 }
    }

    #[inline]
    pub fn restore(flags: IrqFlags) {
        if flags & IF_BIT != 0 {
            IRQ_ENABLED.store(true, Ordering::Release);
        }
    }

    #[inline]
    pub fn enabled() -> bool {
        IRQ_ENABLED.load(Ordering::Acquire)
    }

    #[inline]
    pub fn disable() {
        IRQ_ENABLED.store(false, Ordering::Release);
    }

    #[inline]
    pub fn enable() {
        IRQ_ENABLED.store(true, Ordering::Release);
    }
}

/// Captures the current interrupt state and disables interrupts.
#[inline]
pub fn save_and_disable() -> IrqFlags {
    imp::save_and_disable()
}

/// Restores interrupt state captured by [`save_and_disable`].
///
/// Interrupts are re-enabled only if they were enabled at capture time.
#[inline]
pub fn restore(flags: IrqFlags) {
    imp::restore(flags);
}

/// Returns `true` if interrupts are currently enabled on this CPU.
#[inline]
pub fn enabled() -> bool {
    imp::enabled()
}

/// Disables interrupts on this CPU.
#[inline]
pub fn disable() {
    imp::disable();
}

/// Enables interrupts on this CPU.
#[inline]
pub fn enable() {
    imp::enable();
}
