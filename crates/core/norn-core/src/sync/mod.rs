//! Synchronization primitives.

pub mod irq;
mod irq_spinlock;
mod spinlock;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};

/// Serializes tests that manipulate the process-global simulated IRQ state.
#[cfg(test)]
pub(crate) static TEST_IRQ_STATE: std::sync::Mutex<()> = std::sync::Mutex::new(());
