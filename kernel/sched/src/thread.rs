//! Thread objects.
//!
//! A [`Thread`] is heap-allocated; the scheduler holds it by raw pointer
//! while it is linked into a run or wait queue, and destruction is
//! deferred until the thread is `Dead` and a later scheduling pass reaps
//! it. The single intrusive `link` field serves whichever queue currently
//! holds the thread: a running thread is in neither.

use alloc::boxed::Box;
use core::ffi::c_void;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use norn_core::addr::VirtAddr;
use norn_noalloc::list::ListNode;
use norn_noalloc::list_adapter;

/// Kernel stack size in pages.
pub const KERNEL_STACK_PAGES: usize = 2;

/// Size of the unmapped guard page below a kernel stack.
///
/// The fault handler treats a fault within this window below the stack
/// base as a kernel stack overflow.
pub const STACK_GUARD_SIZE: usize = 4096;

/// Fixed thread-name storage, NUL padded.
pub const THREAD_NAME_LEN: usize = 16;

/// Unique thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u64);

/// Tid of the per-CPU idle thread.
pub const IDLE_TID: Tid = Tid(0);

/// Monotonically increasing tid source. 0 is reserved for idle threads.
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

fn alloc_tid() -> Tid {
    Tid(NEXT_TID.fetch_add(1, Ordering::Relaxed))
}

/// Thread lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Alive. May or may not be runnable (a thread parked on a wait queue
    /// stays `Running` but non-runnable).
    Running,
    /// Exited; storage is reclaimed by a later scheduling pass.
    Dead,
}

/// CPU time accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuTime {
    /// Nanoseconds attributed to user mode.
    pub user_ns: u64,
    /// Nanoseconds attributed to kernel mode.
    pub kernel_ns: u64,
    /// Timestamp at which user-time accumulation started.
    pub last_enter_user: u64,
}

/// A kernel stack: [`KERNEL_STACK_PAGES`] mapped pages above an unmapped
/// guard page.
#[derive(Debug, Clone, Copy)]
pub struct KernelStack {
    /// Lowest mapped address.
    pub base: VirtAddr,
    /// Mapped size in bytes.
    pub size: usize,
}

impl KernelStack {
    /// Initial stack pointer (top of the mapped range).
    pub fn top(&self) -> VirtAddr {
        self.base + self.size as u64
    }

    /// Returns `true` if `addr` falls in the guard window below the base.
    pub fn in_guard(&self, addr: VirtAddr) -> bool {
        addr < self.base && self.base - addr <= STACK_GUARD_SIZE as u64
    }
}

/// Architecture context of a suspended thread.
///
/// The register file snapshot lives on the thread's kernel stack; only
/// the saved stack pointer and the FPU state handle are carried here.
/// The layout is part of the context-switch assembly contract.
#[derive(Debug, Default)]
#[repr(C)]
pub struct ArchContext {
    /// Saved kernel stack pointer (offset 0, read by the switch stub).
    pub kernel_sp: u64,
    /// Opaque FPU/extended-state save area handle, if allocated.
    pub fpu_state: u64,
}

/// A kernel or user thread.
pub struct Thread {
    /// Unique id. 0 is the idle thread.
    pub tid: Tid,
    name: [u8; THREAD_NAME_LEN],
    /// Lifecycle state.
    pub state: ThreadState,
    /// Eligible to run. Cleared while parked on a wait queue.
    pub runnable: bool,
    /// The kernel stack, absent only for the boot thread which runs on
    /// the early boot stack.
    pub kstack: Option<KernelStack>,
    /// Saved context for the switch primitive.
    pub arch: ArchContext,
    /// Entry point for kernel threads (trampoline target).
    pub entry: Option<fn()>,
    /// Type-erased pointer to the owning process memory map; `None` for
    /// pure kernel threads. The proc layer owns the concrete type.
    pub mm: Option<NonNull<c_void>>,
    /// CPU time accounting.
    pub cpu_time: CpuTime,
    /// While non-zero, the interrupt epilogue must not reschedule.
    pub preempt_count: u32,
    /// Set by the timer interrupt to request a reschedule.
    pub need_resched: AtomicBool,
    /// Set while the thread executes an interrupt handler.
    pub in_irq: AtomicBool,
    link: ListNode,
}

list_adapter!(pub ThreadAdapter for Thread { node = link });

impl Thread {
    /// Allocates a thread with a fresh tid.
    pub fn new(name: &str) -> Box<Thread> {
        Self::with_tid(alloc_tid(), name)
    }

    /// Allocates the idle thread (tid 0) for a CPU.
    pub fn new_idle() -> Box<Thread> {
        Self::with_tid(IDLE_TID, "idle")
    }

    fn with_tid(tid: Tid, name: &str) -> Box<Thread> {
        let mut fixed = [0u8; THREAD_NAME_LEN];
        let len = name.len().min(THREAD_NAME_LEN);
        fixed[..len].copy_from_slice(&name.as_bytes()[..len]);
        Box::new(Thread {
            tid,
            name: fixed,
            state: ThreadState::Running,
            runnable: true,
            kstack: None,
            arch: ArchContext::default(),
            entry: None,
            mm: None,
            cpu_time: CpuTime::default(),
            preempt_count: 0,
            need_resched: AtomicBool::new(false),
            in_irq: AtomicBool::new(false),
            link: ListNode::new(),
        })
    }

    /// The thread name up to the first NUL.
    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(THREAD_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("<invalid>")
    }

    /// Returns `true` for the per-CPU idle thread.
    pub fn is_idle(&self) -> bool {
        self.tid == IDLE_TID
    }

    /// Reads the reschedule request flag.
    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    /// Sets or clears the reschedule request flag.
    pub fn set_need_resched(&self, value: bool) {
        self.need_resched.store(value, Ordering::Release);
    }

    /// Reads the in-interrupt flag.
    pub fn in_irq(&self) -> bool {
        self.in_irq.load(Ordering::Acquire)
    }

    /// Sets the in-interrupt flag, returning the previous value.
    pub fn set_in_irq(&self, value: bool) -> bool {
        self.in_irq.swap(value, Ordering::AcqRel)
    }
}
