//! The kernel heap: `GlobalAlloc` over the bin and buddy allocators.
//!
//! Sub-page requests go to the bin allocator; anything larger takes
//! whole pages straight from the buddy allocator through the direct
//! map. Only registered as the global allocator on kernel targets; host
//! tests run on the host heap.

use core::alloc::{GlobalAlloc, Layout};

use norn_core::addr::{DIRECT_MAP_BASE, PhysAddr};
use norn_core::sync::IrqSpinLock;
use norn_mm::bin::BinAllocator;
use norn_mm::buddy::{self, GlobalFrameSource};
use norn_mm::zone::Zone;
use norn_mm::PAGE_SIZE;

/// Largest request served by the bin allocator.
const BIN_MAX: usize = 4096;

/// The kernel heap allocator.
pub struct KernelAllocator {
    bins: IrqSpinLock<BinAllocator>,
}

impl KernelAllocator {
    /// Creates the (empty) kernel heap.
    pub const fn new() -> Self {
        Self {
            bins: IrqSpinLock::new(BinAllocator::new()),
        }
    }
}

impl Default for KernelAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Both underlying allocators hand out exclusively owned memory;
// their state is lock-protected.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() <= BIN_MAX && layout.align() <= BIN_MAX {
            return match self.bins.lock().alloc(layout, &mut GlobalFrameSource) {
                Ok(ptr) => ptr,
                Err(_) => core::ptr::null_mut(),
            };
        }
        // Multi-page allocation straight from the buddy allocator.
        let pages = layout.size().div_ceil(PAGE_SIZE);
        match buddy::with(|b| b.alloc_pages(pages, Zone::Normal)) {
            Ok(phys) => (DIRECT_MAP_BASE + phys.as_u64()) as *mut u8,
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() <= BIN_MAX && layout.align() <= BIN_MAX {
            // SAFETY: The block came from the bin allocator with this
            // layout.
            unsafe { self.bins.lock().dealloc(ptr, layout) };
            return;
        }
        let pages = layout.size().div_ceil(PAGE_SIZE);
        let phys = PhysAddr::new(ptr as u64 - DIRECT_MAP_BASE);
        // SAFETY: The block came from the buddy allocator with this size
        // and is no longer referenced.
        buddy::with(|b| unsafe { b.free_pages(phys, pages) });
    }
}

/// The global kernel heap instance.
#[cfg_attr(all(target_os = "none", target_arch = "x86_64"), global_allocator)]
pub static HEAP: KernelAllocator = KernelAllocator::new();
