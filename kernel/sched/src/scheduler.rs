//! The per-CPU scheduler.
//!
//! FIFO, no priorities. The running thread is held in the `current` slot
//! and is never linked into the run queue; the per-CPU idle thread
//! (tid 0) runs only when nothing else is runnable and is itself never
//! enqueued. Dead threads are parked in a graveyard and destroyed by a
//! later scheduling pass, so a thread never frees the stack it is
//! standing on.
//!
//! The scheduler is not a coroutine system: each thread owns a kernel
//! stack and [`SchedArch::switch_to`] is a stack-swap primitive that
//! saves the callee-saved registers plus `rbp` and the stack pointer.

use alloc::boxed::Box;
use core::ptr::NonNull;

use norn_core::sync::irq;
use norn_noalloc::list::List;

use crate::thread::{Thread, ThreadAdapter, ThreadState};

/// Architecture operations the scheduler depends on.
pub trait SchedArch {
    /// Swaps stacks from `prev` to `next`.
    ///
    /// Returns (much) later, when `prev` is scheduled again.
    ///
    /// # Safety
    ///
    /// Both threads must have valid saved contexts; `next` must not be
    /// running on any CPU.
    unsafe fn switch_to(&mut self, prev: NonNull<Thread>, next: NonNull<Thread>);

    /// Enters the first thread on this CPU without saving a previous
    /// context. Does not return on hardware; mocks return.
    ///
    /// # Safety
    ///
    /// `next` must have a valid initial context.
    unsafe fn initial_switch_to(&mut self, next: NonNull<Thread>);

    /// Monotonic timestamp in nanoseconds.
    fn now_ns(&self) -> u64;

    /// Signals end-of-interrupt to the local interrupt controller.
    fn send_eoi(&mut self);
}

/// A per-CPU scheduler instance.
pub struct CpuScheduler<A: SchedArch> {
    arch: A,
    run_queue: List<ThreadAdapter>,
    graveyard: List<ThreadAdapter>,
    current: Option<NonNull<Thread>>,
    idle: Option<NonNull<Thread>>,
}

impl<A: SchedArch> CpuScheduler<A> {
    /// Creates a scheduler without an idle thread installed.
    pub fn new(arch: A) -> Self {
        Self {
            arch,
            run_queue: List::new(),
            graveyard: List::new(),
            current: None,
            idle: None,
        }
    }

    /// Installs the idle thread (tid 0) and makes it current.
    ///
    /// # Panics
    ///
    /// Panics if called twice or with a non-idle thread.
    pub fn init_idle(&mut self, idle: Box<Thread>) {
        assert!(self.idle.is_none(), "idle thread already installed");
        assert!(idle.is_idle(), "idle thread must have tid 0");
        let ptr = NonNull::from(Box::leak(idle));
        self.idle = Some(ptr);
        self.current = Some(ptr);
    }

    /// Takes ownership of a thread and makes it runnable.
    pub fn spawn(&mut self, thread: Box<Thread>) -> NonNull<Thread> {
        let ptr = NonNull::from(Box::leak(thread));
        // SAFETY: Freshly leaked, not linked anywhere.
        unsafe { self.enqueue_raw(ptr) };
        ptr
    }

    /// Links an unlinked runnable thread at the run-queue tail.
    ///
    /// # Safety
    ///
    /// `thread` must be alive and not linked into any queue.
    pub(crate) unsafe fn enqueue_raw(&mut self, thread: NonNull<Thread>) {
        debug_assert!(!unsafe { thread.as_ref() }.is_idle(), "idle is never enqueued");
        // SAFETY: Per this function's contract.
        unsafe { self.run_queue.append(thread) };
    }

    /// The thread executing on this CPU.
    pub fn current(&self) -> Option<NonNull<Thread>> {
        self.current
    }

    /// Ready threads excluding `current`.
    pub fn runnable_count(&self) -> usize {
        self.run_queue.len()
    }

    /// Mutable access to the arch seam.
    pub fn arch_mut(&mut self) -> &mut A {
        &mut self.arch
    }

    /// Timer-tick hook: requests a reschedule of the running thread.
    pub fn timer_tick(&mut self) {
        if let Some(cur) = self.current {
            // SAFETY: current is alive while scheduled.
            unsafe { cur.as_ref() }.set_need_resched(true);
        }
    }

    /// Returns `true` when the running thread may be preempted.
    pub fn preemption_allowed(&self) -> bool {
        match self.current {
            // SAFETY: current is alive while scheduled.
            Some(cur) => unsafe { cur.as_ref() }.preempt_count == 0,
            None => false,
        }
    }

    /// Picks and switches to the next thread.
    ///
    /// `from_irq` is set when called from an interrupt epilogue; the
    /// EOI is sent before the switch so the controller is released even
    /// if this thread stays suspended for a long time.
    pub fn schedule(&mut self, from_irq: bool) {
        let flags = irq::save_and_disable();
        if from_irq {
            self.arch.send_eoi();
        }
        self.reap_dead();

        let Some(current) = self.current else {
            irq::restore(flags);
            return;
        };

        // SAFETY: current is alive while scheduled.
        let (state, runnable, is_idle) = {
            let cur = unsafe { current.as_ref() };
            (cur.state, cur.runnable, cur.is_idle())
        };

        let next = match self.run_queue.pop_first() {
            Some(next) => next,
            None => {
                if is_idle || (state == ThreadState::Running && runnable) {
                    // Nothing else to run; keep running.
                    irq::restore(flags);
                    return;
                }
                self.idle.expect("idle thread not installed")
            }
        };

        // Park the outgoing thread.
        // SAFETY: current is alive and not linked into any queue.
        unsafe { current.as_ref() }.set_need_resched(false);
        match state {
            ThreadState::Running if runnable && !is_idle => {
                // SAFETY: current is unlinked (it was never enqueued
                // while running).
                unsafe { self.run_queue.append(current) };
            }
            // Idle never queues; a non-runnable thread was already
            // linked into its wait queue by `wait_on`.
            ThreadState::Running => {}
            // SAFETY: As above.
            ThreadState::Dead => unsafe { self.graveyard.append(current) },
        }

        // Account the elapsed slice to the outgoing thread and start a
        // fresh accumulation for the incoming one.
        let now = self.arch.now_ns();
        // SAFETY: Both threads are alive; they cannot alias because
        // current was never in the run queue.
        unsafe {
            let cur = current.as_ptr();
            (*cur).cpu_time.user_ns += now.saturating_sub((*cur).cpu_time.last_enter_user);
            (*next.as_ptr()).cpu_time.last_enter_user = now;
        }

        self.current = Some(next);
        // SAFETY: next has a valid saved context per the spawn protocol.
        unsafe { self.arch.switch_to(current, next) };
        irq::restore(flags);
    }

    /// Enters the first thread on a freshly booted CPU.
    ///
    /// # Safety
    ///
    /// `first` must have a valid initial context and must not be linked
    /// into any queue.
    pub unsafe fn initial_switch_to(&mut self, first: NonNull<Thread>) {
        let now = self.arch.now_ns();
        // SAFETY: Per this function's contract.
        unsafe { (*first.as_ptr()).cpu_time.last_enter_user = now };
        self.current = Some(first);
        // SAFETY: Per this function's contract.
        unsafe { self.arch.initial_switch_to(first) };
    }

    /// The interrupt-epilogue preemption sequence.
    ///
    /// Blocks nested preemption via the per-task counter, re-enables
    /// interrupts for the switch, and restores the counter afterwards.
    pub fn preempt_schedule(&mut self) {
        let Some(cur) = self.current else { return };
        // SAFETY: current is alive while scheduled.
        unsafe { (*cur.as_ptr()).preempt_count += 1 };
        irq::enable();
        self.schedule(true);
        irq::disable();
        // SAFETY: The thread is running again, hence alive.
        unsafe { (*cur.as_ptr()).preempt_count -= 1 };
    }

    /// Destroys threads that died since the last pass.
    fn reap_dead(&mut self) {
        while let Some(dead) = self.graveyard.pop_first() {
            // SAFETY: The thread was leaked by `spawn` and unlinked from
            // every queue; this is the single reclamation point.
            drop(unsafe { Box::from_raw(dead.as_ptr()) });
        }
    }
}

impl<A: SchedArch> Drop for CpuScheduler<A> {
    fn drop(&mut self) {
        self.reap_dead();
        while let Some(t) = self.run_queue.pop_first() {
            // SAFETY: Leaked by `spawn`, reclaimed once.
            drop(unsafe { Box::from_raw(t.as_ptr()) });
        }
        if let Some(cur) = self.current.take() {
            if Some(cur) != self.idle {
                // SAFETY: Leaked by `spawn`, reclaimed once.
                drop(unsafe { Box::from_raw(cur.as_ptr()) });
            }
        }
        if let Some(idle) = self.idle.take() {
            // SAFETY: Leaked by `init_idle`, reclaimed once.
            drop(unsafe { Box::from_raw(idle.as_ptr()) });
        }
    }
}

/// Recording mock of the arch seam, shared by scheduler and wait-queue
/// tests.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::{NonNull, SchedArch, Thread};
    use crate::thread::Tid;

    #[derive(Default)]
    pub struct MockArch {
        pub switches: Vec<(Tid, Tid)>,
        pub now: u64,
        pub eois: usize,
    }

    impl SchedArch for MockArch {
        unsafe fn switch_to(&mut self, prev: NonNull<Thread>, next: NonNull<Thread>) {
            // SAFETY: The scheduler passes live threads.
            let (p, n) = unsafe { (prev.as_ref().tid, next.as_ref().tid) };
            self.switches.push((p, n));
        }

        unsafe fn initial_switch_to(&mut self, next: NonNull<Thread>) {
            // SAFETY: The scheduler passes a live thread.
            let n = unsafe { next.as_ref().tid };
            self.switches.push((Tid(u64::MAX), n));
        }

        fn now_ns(&self) -> u64 {
            self.now
        }

        fn send_eoi(&mut self) {
            self.eois += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::MockArch;
    use super::*;
    use crate::thread::Tid;

    fn sched_with_idle() -> CpuScheduler<MockArch> {
        let mut s = CpuScheduler::new(MockArch::default());
        s.init_idle(Thread::new_idle());
        s
    }

    fn last_switch(s: &mut CpuScheduler<MockArch>) -> (Tid, Tid) {
        *s.arch_mut().switches.last().unwrap()
    }

    #[test]
    fn fifo_round_robin() {
        let mut s = sched_with_idle();
        let a = s.spawn(Thread::new("a"));
        let b = s.spawn(Thread::new("b"));
        let (a_tid, b_tid) = unsafe { (a.as_ref().tid, b.as_ref().tid) };

        s.schedule(false); // idle -> a
        assert_eq!(last_switch(&mut s).1, a_tid);
        s.schedule(false); // a -> b, a re-enqueued at the tail
        assert_eq!(last_switch(&mut s), (a_tid, b_tid));
        s.schedule(false); // b -> a
        assert_eq!(last_switch(&mut s), (b_tid, a_tid));
    }

    #[test]
    fn idle_keeps_running_when_queue_empty() {
        let mut s = sched_with_idle();
        s.schedule(false);
        assert!(s.arch_mut().switches.is_empty(), "no switch away from idle");
        // Idle was never enqueued.
        assert_eq!(s.runnable_count(), 0);
    }

    #[test]
    fn running_thread_keeps_cpu_without_competitors() {
        let mut s = sched_with_idle();
        let a = s.spawn(Thread::new("a"));
        s.schedule(false); // idle -> a
        let before = s.arch_mut().switches.len();
        s.schedule(false); // nothing else runnable: no switch
        assert_eq!(s.arch_mut().switches.len(), before);
        assert_eq!(s.current(), Some(a));
    }

    #[test]
    fn idle_never_appears_in_run_queue() {
        let mut s = sched_with_idle();
        let _a = s.spawn(Thread::new("a"));
        for _ in 0..5 {
            s.schedule(false);
            assert!(
                s.run_queue.iter().all(|t| !t.is_idle()),
                "idle thread found in run queue"
            );
        }
    }

    #[test]
    fn dead_thread_is_reaped_on_a_later_pass() {
        let mut s = sched_with_idle();
        let a = s.spawn(Thread::new("a"));
        s.schedule(false); // idle -> a
        // SAFETY: a is current, alive.
        unsafe { (*a.as_ptr()).state = ThreadState::Dead };
        s.schedule(false); // a -> idle, a moves to the graveyard
        assert_eq!(s.graveyard.len(), 1);
        s.schedule(false); // the next pass destroys it
        assert_eq!(s.graveyard.len(), 0);
    }

    #[test]
    fn eoi_sent_only_from_irq_epilogue() {
        let mut s = sched_with_idle();
        let _a = s.spawn(Thread::new("a"));
        s.schedule(false);
        assert_eq!(s.arch_mut().eois, 0);
        s.schedule(true);
        assert_eq!(s.arch_mut().eois, 1);
    }

    #[test]
    fn timer_tick_sets_and_schedule_clears_need_resched() {
        let mut s = sched_with_idle();
        let a = s.spawn(Thread::new("a"));
        s.schedule(false); // idle -> a
        s.timer_tick();
        // SAFETY: a is alive.
        assert!(unsafe { a.as_ref() }.need_resched());
        let _b = s.spawn(Thread::new("b"));
        s.schedule(false); // a -> b
        assert!(!unsafe { a.as_ref() }.need_resched());
    }

    #[test]
    fn preempt_schedule_restores_counter_and_irqs() {
        let mut s = sched_with_idle();
        let a = s.spawn(Thread::new("a"));
        s.schedule(false); // idle -> a
        let _b = s.spawn(Thread::new("b"));

        irq::disable();
        s.preempt_schedule();
        // Counter restored; EOI sent; the switch happened.
        // SAFETY: a is alive.
        assert_eq!(unsafe { a.as_ref() }.preempt_count, 0);
        assert_eq!(s.arch_mut().eois, 1);
        assert_eq!(last_switch(&mut s).0, unsafe { a.as_ref() }.tid);
        irq::enable();
    }

    #[test]
    fn cpu_time_attribution() {
        let mut s = sched_with_idle();
        let a = s.spawn(Thread::new("a"));
        s.arch_mut().now = 1_000;
        s.schedule(false); // idle -> a at t=1000
        s.arch_mut().now = 4_500;
        let _b = s.spawn(Thread::new("b"));
        s.schedule(false); // a -> b at t=4500
        // SAFETY: a is alive.
        assert_eq!(unsafe { a.as_ref() }.cpu_time.user_ns, 3_500);
    }

    #[test]
    fn fairness_over_timer_ticks() {
        // Three runnable threads over 12 ticks: each must be scheduled at
        // least ceil(12 / 3) = 4 times.
        let mut s = sched_with_idle();
        let threads = [
            s.spawn(Thread::new("a")),
            s.spawn(Thread::new("b")),
            s.spawn(Thread::new("c")),
        ];
        s.schedule(false); // enter the first thread

        let ticks = 12;
        for _ in 0..ticks {
            s.timer_tick();
            s.preempt_schedule();
        }

        let mut counts = std::collections::HashMap::new();
        for (_, to) in &s.arch_mut().switches {
            *counts.entry(*to).or_insert(0usize) += 1;
        }
        for t in threads {
            // SAFETY: All spawned threads stay alive.
            let tid = unsafe { t.as_ref() }.tid;
            assert!(
                counts.get(&tid).copied().unwrap_or(0) >= ticks / 3,
                "thread {tid:?} starved: {counts:?}"
            );
        }
    }

    #[test]
    fn initial_switch_enters_first_task() {
        let mut s = sched_with_idle();
        let a = s.spawn(Thread::new("a"));
        // Take it off the queue as the boot path does.
        let first = s.run_queue.pop_first().unwrap();
        assert_eq!(first, a);
        // SAFETY: Mock context; thread unlinked.
        unsafe { s.initial_switch_to(first) };
        assert_eq!(s.current(), Some(a));
        assert_eq!(last_switch(&mut s), (Tid(u64::MAX), unsafe { a.as_ref() }.tid));
    }
}
