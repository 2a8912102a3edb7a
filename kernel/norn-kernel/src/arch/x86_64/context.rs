//! Context-switch contract and initial stack frames.
//!
//! The switch itself is an assembly stub with a fixed calling
//! convention; this module owns the Rust side of that contract: the
//! [`SwitchFrame`] layout the stub pushes and pops, construction of the
//! initial frame a fresh thread starts from, and the [`SchedArch`]
//! implementation the scheduler drives.
//!
//! # Switch stub contract
//!
//! `norn_context_switch(prev, next)` receives two `&mut ArchContext`
//! (offset 0 is the saved stack pointer). It pushes the callee-saved
//! registers (`rbx`, `rbp`, `r12`–`r15`) onto the current stack, stores
//! `rsp` into `prev.kernel_sp`, loads `rsp` from `next.kernel_sp`, pops
//! the callee-saved registers and returns — on the next thread's stack.
//! A fresh thread's stack is pre-seeded so that this `ret` lands in
//! [`kernel_thread_trampoline`].

use norn_core::addr::VirtAddr;

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
use core::ptr::NonNull;
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
use norn_sched::scheduler::SchedArch;
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
use norn_sched::thread::Thread;

/// The frame the switch stub pushes: callee-saved registers below the
/// return address, ascending addresses.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SwitchFrame {
    /// Saved `r15`.
    pub r15: u64,
    /// Saved `r14`.
    pub r14: u64,
    /// Saved `r13`.
    pub r13: u64,
    /// Saved `r12`.
    pub r12: u64,
    /// Saved `rbp`.
    pub rbp: u64,
    /// Saved `rbx`.
    pub rbx: u64,
    /// Return address the stub's `ret` consumes.
    pub rip: u64,
}

/// Seeds a fresh kernel stack so the first switch into the thread
/// "returns" to `entry_rip`.
///
/// `stack` is the writable image of the stack pages; `stack_top_va` is
/// the address the stack top will have when the thread runs. Returns the
/// initial saved stack pointer to store in the thread's context.
pub fn seed_switch_frame(stack: &mut [u8], stack_top_va: VirtAddr, entry_rip: u64) -> VirtAddr {
    let frame_size = core::mem::size_of::<SwitchFrame>();
    assert!(stack.len() >= frame_size, "stack too small for a switch frame");

    let frame = SwitchFrame {
        rip: entry_rip,
        ..SwitchFrame::default()
    };
    let offset = stack.len() - frame_size;
    // SAFETY: `offset` leaves exactly `frame_size` bytes inside `stack`,
    // and SwitchFrame is plain-old-data.
    unsafe {
        stack
            .as_mut_ptr()
            .add(offset)
            .cast::<SwitchFrame>()
            .write_unaligned(frame);
    }
    stack_top_va - frame_size as u64
}

/// First code a kernel thread executes, reached by the switch stub's
/// `ret`. Calls the thread's entry function and exits.
pub extern "C" fn kernel_thread_trampoline() -> ! {
    let entry = crate::proc::current_thread_entry();
    if let Some(entry) = entry {
        entry();
    }
    crate::proc::exit_current_thread()
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
unsafe extern "C" {
    /// The assembly switch stub (see the module docs for the contract).
    pub fn norn_context_switch(
        prev: *mut norn_sched::thread::ArchContext,
        next: *mut norn_sched::thread::ArchContext,
    );

    /// Loads the context of `next` without saving anything, for the
    /// first task of a CPU. Does not return.
    pub fn norn_initial_switch(next: *mut norn_sched::thread::ArchContext) -> !;
}

/// The hardware [`SchedArch`] implementation.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub struct X86SchedArch;

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
impl SchedArch for X86SchedArch {
    unsafe fn switch_to(&mut self, prev: NonNull<Thread>, next: NonNull<Thread>) {
        // SAFETY: The scheduler guarantees both contexts are valid; the
        // stub honours the documented contract.
        unsafe {
            norn_context_switch(
                &raw mut (*prev.as_ptr()).arch,
                &raw mut (*next.as_ptr()).arch,
            );
        }
    }

    unsafe fn initial_switch_to(&mut self, next: NonNull<Thread>) {
        // SAFETY: As above; this never returns.
        unsafe { norn_initial_switch(&raw mut (*next.as_ptr()).arch) }
    }

    fn now_ns(&self) -> u64 {
        super::instructions::tsc_ns()
    }

    fn send_eoi(&mut self) {
        super::instructions::lapic_eoi();
    }
}
