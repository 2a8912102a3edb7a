//! Wait queues.
//!
//! A [`WaitQueue`] parks blocked threads until some condition holds.
//! It carries no lock of its own: the resource the queue guards already
//! has one, and interrupts are disabled across the link-and-yield inside
//! [`WaitQueue::wait_on`], which makes the park atomic with respect to
//! wakeups from interrupt context on this CPU.
//!
//! There are no timeouts: a `wait_on` without a matching `wakeup` blocks
//! forever.

use core::ptr::NonNull;

use norn_core::sync::irq;
use norn_noalloc::list::List;

use crate::scheduler::{CpuScheduler, SchedArch};
use crate::thread::{Thread, ThreadAdapter};

/// A FIFO of blocked threads.
pub struct WaitQueue {
    waiters: List<ThreadAdapter>,
}

impl WaitQueue {
    /// Creates an empty queue.
    pub const fn new() -> Self {
        Self {
            waiters: List::new(),
        }
    }

    /// Number of parked threads.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Returns `true` if no thread is parked.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Parks the current thread on this queue and yields.
    ///
    /// Returns when a later [`wakeup`](Self::wakeup) reschedules the
    /// thread.
    pub fn wait_on<A: SchedArch>(&mut self, sched: &mut CpuScheduler<A>) {
        let flags = irq::save_and_disable();
        if let Some(current) = sched.current() {
            // SAFETY: current is alive and, being the running thread, not
            // linked into any queue.
            unsafe {
                (*current.as_ptr()).runnable = false;
                self.waiters.append(current);
            }
            sched.schedule(false);
        }
        irq::restore(flags);
    }

    /// Moves every parked thread back to the run queue.
    pub fn wakeup<A: SchedArch>(&mut self, sched: &mut CpuScheduler<A>) {
        let flags = irq::save_and_disable();
        while let Some(thread) = self.waiters.pop_first() {
            // SAFETY: The thread was unlinked from this queue and is alive
            // (blocked threads cannot die).
            unsafe {
                (*thread.as_ptr()).runnable = true;
                sched.enqueue_raw(thread);
            }
        }
        irq::restore(flags);
    }

    /// Parks an explicit thread without yielding.
    ///
    /// Used when the blocking decision is made on behalf of another
    /// thread (it must already be off the run queue).
    ///
    /// # Safety
    ///
    /// `thread` must be alive and not linked into any queue.
    pub unsafe fn park(&mut self, thread: NonNull<Thread>) {
        // SAFETY: Per this function's contract.
        unsafe {
            (*thread.as_ptr()).runnable = false;
            self.waiters.append(thread);
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests_support::MockArch;
    use crate::thread::Thread;

    fn sched() -> CpuScheduler<MockArch> {
        let mut s = CpuScheduler::new(MockArch::default());
        s.init_idle(Thread::new_idle());
        s
    }

    #[test]
    fn wait_parks_and_switches_away() {
        let mut s = sched();
        let a = s.spawn(Thread::new("a"));
        let _b = s.spawn(Thread::new("b"));
        s.schedule(false); // idle -> a

        let mut wq = WaitQueue::new();
        wq.wait_on(&mut s); // a parks; b runs
        assert_eq!(wq.len(), 1);
        assert_ne!(s.current(), Some(a));
        // SAFETY: a is alive, parked on wq.
        assert!(!unsafe { a.as_ref() }.runnable);
    }

    #[test]
    fn wakeup_requeues_all_in_fifo_order() {
        let mut s = sched();
        let a = s.spawn(Thread::new("a"));
        let b = s.spawn(Thread::new("b"));
        let mut wq = WaitQueue::new();

        // Park both from the scheduler's perspective: run each, wait.
        s.schedule(false); // idle -> a
        wq.wait_on(&mut s); // a parks; b runs
        wq.wait_on(&mut s); // b parks; idle runs
        assert_eq!(wq.len(), 2);
        assert_eq!(s.runnable_count(), 0);

        wq.wakeup(&mut s);
        assert!(wq.is_empty());
        assert_eq!(s.runnable_count(), 2);
        // FIFO: a was parked first, so it runs first.
        s.schedule(false);
        assert_eq!(s.current(), Some(a));
        s.schedule(false);
        assert_eq!(s.current(), Some(b));
    }

    #[test]
    fn wakeup_empty_queue_is_noop() {
        let mut s = sched();
        let mut wq = WaitQueue::new();
        wq.wakeup(&mut s);
        assert!(wq.is_empty());
    }

    #[test]
    fn woken_thread_is_runnable_again() {
        let mut s = sched();
        let a = s.spawn(Thread::new("a"));
        s.schedule(false); // idle -> a
        let mut wq = WaitQueue::new();
        wq.wait_on(&mut s); // a parks; idle runs
        wq.wakeup(&mut s);
        // SAFETY: a is alive.
        assert!(unsafe { a.as_ref() }.runnable);
        s.schedule(false);
        assert_eq!(s.current(), Some(a));
    }
}
