//! Architecture layer.
//!
//! Norn targets x86_64 only. The modules under `x86_64` divide into two
//! groups: pure-memory code (the page-table mapper, switch-frame
//! construction) that also compiles and tests on the host, and
//! hardware-touching code (MSRs, `hlt`, the context-switch stub contract)
//! gated on `target_os = "none"`.

pub mod x86_64;

pub use x86_64::paging::PageTableMapper;
