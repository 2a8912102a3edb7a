//! Architecture-independent page mapping interface.
//!
//! Provides [`PageAttr`], [`MapFlush`] and the [`PageMapper`] contract so
//! that the VMA layer can manipulate page tables without knowing the
//! underlying architecture. The x86_64 implementation lives in the kernel
//! crate; host tests substitute a recording mock.
//!
//! # TLB flush decoupling
//!
//! The architecture-specific TLB flush is registered at boot via
//! [`register_tlb_flush`]. Before registration, flushes are no-ops, which
//! is safe during early boot where no stale TLB entries exist, and is the
//! default in host tests.

use core::sync::atomic::{AtomicPtr, Ordering};

use norn_core::addr::{PhysAddr, VirtAddr};

use crate::MmError;

bitflags::bitflags! {
    /// Architecture-independent page attributes.
    ///
    /// Readability is implied by presence; the rest maps onto the
    /// architecture's writable / no-execute / user bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageAttr: u64 {
        /// Page is writable.
        const WRITABLE      = 1 << 0;
        /// Page is executable.
        const EXECUTABLE    = 1 << 1;
        /// Page is accessible from user mode.
        const USER          = 1 << 2;
        /// Global page (survives address-space switches).
        const GLOBAL        = 1 << 3;
        /// Caching disabled (device memory).
        const CACHE_DISABLE = 1 << 4;
    }
}

// ---------------------------------------------------------------------------
// Registered TLB flush callback
// ---------------------------------------------------------------------------

static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush as fn(VirtAddr) as *mut ());

fn nop_flush(_virt: VirtAddr) {}

/// Registers the architecture-specific single-page TLB flush.
///
/// Must run during early boot, before any page-table modification that
/// needs invalidation.
pub fn register_tlb_flush(f: fn(VirtAddr)) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn arch_flush_page(virt: VirtAddr) {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    // SAFETY: Only `nop_flush` or a function registered through
    // `register_tlb_flush` is ever stored.
    let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
    f(virt);
}

/// A pending TLB flush for a single page.
///
/// Flushes on drop unless [`flush`](Self::flush) or
/// [`ignore`](Self::ignore) is called first.
#[must_use = "TLB flush is pending; call .flush() or .ignore()"]
pub struct MapFlush {
    virt: VirtAddr,
    needs_flush: bool,
}

impl MapFlush {
    /// Creates a pending flush for `virt`.
    pub fn new(virt: VirtAddr) -> Self {
        Self {
            virt,
            needs_flush: true,
        }
    }

    /// Flushes the TLB entry immediately.
    pub fn flush(mut self) {
        self.needs_flush = false;
        arch_flush_page(self.virt);
    }

    /// Opts out of flushing (fresh mappings never entered the TLB).
    pub fn ignore(mut self) {
        self.needs_flush = false;
    }
}

impl Drop for MapFlush {
    fn drop(&mut self) {
        if self.needs_flush {
            arch_flush_page(self.virt);
        }
    }
}

/// Architecture-independent 4 KiB page table manipulation.
///
/// # Safety
///
/// Implementations must correctly manipulate the hardware page tables
/// rooted at the `root` argument of each call.
pub unsafe trait PageMapper {
    /// Maps `virt` to `phys` with the given attributes, allocating
    /// intermediate table pages from `alloc` as needed.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid top-level page table and `alloc` must
    /// return zeroed pages.
    unsafe fn map(
        &mut self,
        root: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        attr: PageAttr,
        alloc: &mut dyn FnMut() -> Result<PhysAddr, MmError>,
    ) -> Result<MapFlush, MmError>;

    /// Unmaps `virt`, returning the frame that was mapped.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid top-level page table.
    unsafe fn unmap(
        &mut self,
        root: PhysAddr,
        virt: VirtAddr,
    ) -> Result<(PhysAddr, MapFlush), MmError>;

    /// Rewrites the attributes of the existing mapping at `virt`.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid top-level page table.
    unsafe fn update_attr(
        &mut self,
        root: PhysAddr,
        virt: VirtAddr,
        attr: PageAttr,
    ) -> Result<MapFlush, MmError>;

    /// Translates `virt`, returning the mapped frame and its attributes.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid top-level page table.
    unsafe fn translate(&self, root: PhysAddr, virt: VirtAddr) -> Option<(PhysAddr, PageAttr)>;
}
