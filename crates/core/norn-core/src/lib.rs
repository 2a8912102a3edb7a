//! Core types and primitives for the Norn kernel.
//!
//! This crate contains the host-testable foundation the rest of the kernel
//! builds on: typed physical/virtual addresses with the fixed Norn memory
//! layout, bit manipulation helpers, spin locks (plain and IRQ-saving),
//! the kernel logging interface, and per-CPU storage.
//!
//! By living outside the kernel crate, these types can be tested with
//! `cargo test` on the host without a kernel target. Architecture-specific
//! paths (RFLAGS save/restore, GS-base access) are gated on
//! `target_os = "none"` with host fallbacks.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod bits;
pub mod log;
pub mod percpu;
pub mod sync;
