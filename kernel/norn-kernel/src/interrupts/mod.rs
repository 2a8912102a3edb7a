//! Interrupt dispatch core.
//!
//! A fixed table of 256 handler slots, written only during
//! initialisation and read lock-free afterwards. [`Dispatcher::call`] is
//! the single entry all assembly stubs funnel into: it maintains the
//! current task's `in_irq` flag around the handler and, for hardware
//! interrupts (vector >= 0x20) that raised `need_resched` while
//! preemption is allowed, runs the preemption sequence on the way out.
//!
//! Vector 0xFF is reserved for spurious interrupts. Exceptions without a
//! registered handler fall through to the fault dump and halt the CPU.

pub mod fault;

use core::sync::atomic::{AtomicPtr, Ordering};

use norn_core::{kinfo, kwarn};

use fault::RegisterFile;

/// Number of interrupt vectors.
pub const NUM_VECTORS: usize = 256;

/// Vectors below this are CPU exceptions, not hardware interrupts.
pub const EXCEPTION_LIMIT: u8 = 0x20;

/// Reserved spurious-interrupt vector.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// First vector available to [`Dispatcher::alloc_vector`].
pub const DYNAMIC_START: u8 = 0x30;

/// Last vector available to [`Dispatcher::alloc_vector`].
pub const DYNAMIC_END: u8 = 0xEF;

/// Errors from handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptError {
    /// A handler is already registered for this vector.
    AlreadyRegistered,
    /// No free vector in the dynamic range.
    VectorExhausted,
}

impl core::fmt::Display for InterruptError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyRegistered => write!(f, "handler already registered"),
            Self::VectorExhausted => write!(f, "no free vectors in dynamic range"),
        }
    }
}

/// Snapshot of the faulting context an assembly stub hands over.
#[derive(Debug, Clone, Default)]
pub struct IrqContext {
    /// The raised vector.
    pub vector: u8,
    /// Hardware error code (exceptions that push one), else 0.
    pub error_code: u64,
    /// Faulting address for page faults (CR2).
    pub fault_addr: Option<u64>,
    /// Register file at entry.
    pub regs: RegisterFile,
}

/// An interrupt handler.
pub type IrqHandler = fn(&mut IrqContext);

/// Plain-data description of the current task for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct TaskSummary {
    /// Thread id.
    pub tid: u64,
    /// NUL-padded thread name.
    pub name: [u8; 16],
    /// Kernel stack base (lowest mapped address), 0 if none.
    pub kstack_base: u64,
    /// Kernel stack size in bytes.
    pub kstack_size: u64,
}

/// Scheduler-side hooks the dispatcher calls.
///
/// The kernel installs an implementation bridging the per-CPU scheduler;
/// tests substitute mocks.
pub trait TaskHooks {
    /// Sets the current task's `in_irq` flag, returning the previous
    /// value (acquire/release).
    fn swap_in_irq(&self, value: bool) -> bool;

    /// Reads the current task's reschedule request.
    fn need_resched(&self) -> bool;

    /// Returns `true` when the preemption counter permits a switch.
    fn preemption_allowed(&self) -> bool;

    /// Runs the preemption sequence (counter up, IRQs on, schedule,
    /// IRQs off, counter down). The scheduler sends the EOI on this
    /// path.
    fn preempt_schedule(&self);

    /// Signals end-of-interrupt when the epilogue does not reschedule.
    fn send_eoi(&self);

    /// Describes the current task for fault dumps.
    fn current_task(&self) -> Option<TaskSummary>;
}

/// The handler table.
pub struct Dispatcher {
    handlers: [AtomicPtr<()>; NUM_VECTORS],
}

impl Dispatcher {
    /// Creates a table of empty slots.
    pub const fn new() -> Self {
        Self {
            handlers: [const { AtomicPtr::new(core::ptr::null_mut()) }; NUM_VECTORS],
        }
    }

    /// Registers `handler` for `vector`.
    ///
    /// Fails with [`InterruptError::AlreadyRegistered`] when the slot is
    /// not in its default state.
    pub fn set_handler(&self, vector: u8, handler: IrqHandler) -> Result<(), InterruptError> {
        let slot = &self.handlers[vector as usize];
        slot.compare_exchange(
            core::ptr::null_mut(),
            handler as *mut (),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map(|_| ())
        .map_err(|_| InterruptError::AlreadyRegistered)
    }

    /// Finds a free vector in the dynamic range.
    pub fn alloc_vector(&self) -> Result<u8, InterruptError> {
        for vector in DYNAMIC_START..=DYNAMIC_END {
            if self.handlers[vector as usize]
                .load(Ordering::Acquire)
                .is_null()
            {
                return Ok(vector);
            }
        }
        Err(InterruptError::VectorExhausted)
    }

    /// Dispatches one interrupt or exception.
    ///
    /// Saves and restores the task's `in_irq` flag around the handler;
    /// afterwards, if this was an outermost hardware interrupt and the
    /// handler raised `need_resched`, runs the preemption sequence.
    pub fn call(&self, hooks: &dyn TaskHooks, ctx: &mut IrqContext) {
        let was_in_irq = hooks.swap_in_irq(true);

        let ptr = self.handlers[ctx.vector as usize].load(Ordering::Acquire);
        if ptr.is_null() {
            default_handler(hooks, ctx);
        } else {
            // SAFETY: Only valid `IrqHandler` pointers are stored by
            // `set_handler`.
            let handler: IrqHandler = unsafe { core::mem::transmute(ptr) };
            handler(ctx);
        }

        hooks.swap_in_irq(was_in_irq);

        if ctx.vector >= EXCEPTION_LIMIT && ctx.vector != SPURIOUS_VECTOR {
            // Exactly one EOI per hardware interrupt: either the
            // reschedule path sends it, or we do. The spurious handler
            // already sent its own.
            if !was_in_irq && hooks.need_resched() && hooks.preemption_allowed() {
                hooks.preempt_schedule();
            } else {
                hooks.send_eoi();
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Fallback for vectors without a registered handler.
///
/// Exceptions produce a structured fault dump and halt this CPU;
/// unexpected hardware interrupts only log.
fn default_handler(hooks: &dyn TaskHooks, ctx: &mut IrqContext) {
    if ctx.vector < EXCEPTION_LIMIT {
        fault::report(ctx, hooks.current_task().as_ref());
        crate::arch::x86_64::instructions::halt_forever();
    }
    kwarn!("unhandled interrupt vector {:#x}", ctx.vector);
}

/// Handler for the reserved spurious vector: log and EOI.
pub fn spurious_handler(ctx: &mut IrqContext) {
    kinfo!("spurious interrupt (vector {:#x})", ctx.vector);
    crate::arch::x86_64::instructions::lapic_eoi();
}

// ---------------------------------------------------------------------------
// Global dispatcher
// ---------------------------------------------------------------------------

/// The kernel's dispatcher instance.
static DISPATCHER: Dispatcher = Dispatcher::new();

/// Registers a handler with the global dispatcher.
pub fn set_handler(vector: u8, handler: IrqHandler) -> Result<(), InterruptError> {
    DISPATCHER.set_handler(vector, handler)
}

/// Allocates a free vector from the global dispatcher.
pub fn alloc_vector() -> Result<u8, InterruptError> {
    DISPATCHER.alloc_vector()
}

/// Dispatches through the global table (called by the assembly stubs).
pub fn dispatch(hooks: &dyn TaskHooks, ctx: &mut IrqContext) {
    DISPATCHER.call(hooks, ctx);
}
