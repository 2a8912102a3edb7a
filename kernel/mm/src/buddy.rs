//! Zoned buddy allocator.
//!
//! Owns all physical memory after page-table reconstruction. Free blocks
//! are tracked per `(zone, order)` in intrusive free lists whose nodes live
//! inside the free pages themselves, reached through the direct map. Lists
//! are kept sorted by ascending physical address, which makes the layout
//! deterministic and buddy lookups a bounded scan.
//!
//! Freed blocks coalesce: while the aligned buddy of a block is free at
//! the same order and in the same zone, the pair merges upward.
//!
//! The global instance is guarded by a single IRQ-saving spin lock; the
//! allocator is reachable from interrupt context.

use core::ptr::NonNull;

use norn_boot::memmap::MemoryMap;
use norn_core::addr::{DIRECT_MAP_BASE, PhysAddr};
use norn_core::sync::IrqSpinLock;
use norn_noalloc::list::{List, ListNode};
use norn_noalloc::list_adapter;

use crate::zone::{NUM_ZONES, Zone};
use crate::{FrameSource, MmError, PAGE_SIZE};

/// Number of orders: a block of order `k` spans `2^k` pages, `k < MAX_ORDER`.
pub const MAX_ORDER: usize = 11;

/// Free-block header written into the first bytes of each free block.
struct FreeBlock {
    link: ListNode,
}

list_adapter!(FreeBlockAdapter for FreeBlock { node = link });

/// Pages in a block of the given order.
const fn pages_in(order: usize) -> usize {
    1 << order
}

/// Bytes in a block of the given order.
const fn bytes_in(order: usize) -> u64 {
    (pages_in(order) * PAGE_SIZE) as u64
}

/// Order for an `n`-page request: `ceil(log2(n))`, clamped to the maximum.
pub fn order_for(n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let order = (usize::BITS - (n - 1).leading_zeros()) as usize;
    order.min(MAX_ORDER - 1)
}

/// Per-zone free lists.
struct ZoneLists {
    lists: [List<FreeBlockAdapter>; MAX_ORDER],
    free_pages: usize,
}

impl ZoneLists {
    const fn new() -> Self {
        Self {
            lists: [const { List::new() }; MAX_ORDER],
            free_pages: 0,
        }
    }
}

/// The buddy allocator.
pub struct BuddyAllocator {
    zones: [ZoneLists; NUM_ZONES],
    /// Offset from physical address to CPU-visible address.
    dm_offset: u64,
}

// SAFETY: The allocator owns the free blocks its lists point into; access
// is serialised by the global lock.
unsafe impl Send for BuddyAllocator {}

impl BuddyAllocator {
    /// Creates an empty allocator.
    ///
    /// `dm_offset` is added to physical addresses to reach the memory
    /// (the direct-map base in the kernel).
    pub const fn new(dm_offset: u64) -> Self {
        Self {
            zones: [const { ZoneLists::new() }; NUM_ZONES],
            dm_offset,
        }
    }

    /// Seeds the allocator from the boot memory map.
    ///
    /// Usable descriptors are split along zone boundaries and carved into
    /// maximal aligned power-of-two blocks. `reserved` is the bootstrap
    /// allocator's issued prefix, which stays excluded.
    ///
    /// # Safety
    ///
    /// The map must describe real, unused physical memory reachable at
    /// `dm_offset`, and this must be called before any allocation.
    pub unsafe fn init_from_map(
        &mut self,
        map: &MemoryMap,
        reserved: Option<(PhysAddr, usize)>,
    ) {
        for desc in map.iter().filter(|d| d.is_usable()) {
            let start = desc.start();
            let end = start + desc.size();
            match reserved {
                Some((rs, rpages)) => {
                    let re = rs + (rpages * PAGE_SIZE) as u64;
                    // Overlap with the reserved range splits the region in
                    // up to two usable pieces.
                    if re <= start || rs >= end {
                        // SAFETY: Per this function's contract.
                        unsafe { self.add_region(start, end) };
                    } else {
                        if start < rs {
                            // SAFETY: Per this function's contract.
                            unsafe { self.add_region(start, rs) };
                        }
                        if re < end {
                            // SAFETY: Per this function's contract.
                            unsafe { self.add_region(re, end) };
                        }
                    }
                }
                None => {
                    // SAFETY: Per this function's contract.
                    unsafe { self.add_region(start, end) };
                }
            }
        }
    }

    /// Adds `[start, end)` to the free lists, splitting along zone
    /// boundaries and carving maximal aligned blocks.
    ///
    /// # Safety
    ///
    /// The range must be real, unused physical memory reachable at
    /// `dm_offset`.
    pub unsafe fn add_region(&mut self, start: PhysAddr, end: PhysAddr) {
        let start = start.align_up(PAGE_SIZE as u64);
        let end = end.align_down(PAGE_SIZE as u64);
        if start >= end {
            return;
        }
        for zone in Zone::all() {
            let Some((zs, ze)) = zone.clamp(start, end) else {
                continue;
            };
            let mut cursor = zs.as_u64();
            while cursor < ze.as_u64() {
                let by_align = if cursor == 0 {
                    MAX_ORDER - 1
                } else {
                    ((cursor.trailing_zeros() as usize).saturating_sub(12)).min(MAX_ORDER - 1)
                };
                let remaining_pages = ((ze.as_u64() - cursor) as usize) / PAGE_SIZE;
                let by_size = (usize::BITS - 1 - remaining_pages.leading_zeros()) as usize;
                let order = by_align.min(by_size).min(MAX_ORDER - 1);
                // SAFETY: The block lies in the caller-guaranteed range.
                unsafe { self.insert_free(zone, order, PhysAddr::new(cursor)) };
                cursor += bytes_in(order);
            }
        }
    }

    /// Allocates `n` pages from `zone`.
    ///
    /// The returned block is aligned to `2^order` pages where
    /// `order = ceil(log2(n))`.
    pub fn alloc_pages(&mut self, n: usize, zone: Zone) -> Result<PhysAddr, MmError> {
        if n == 0 {
            return Err(MmError::InvalidRegion);
        }
        let order = order_for(n);
        let zi = zone as usize;

        if let Some(phys) = self.pop_first(zi, order) {
            return Ok(phys);
        }

        // Split the smallest larger block, returning upper halves.
        for source in order + 1..MAX_ORDER {
            let Some(phys) = self.pop_first(zi, source) else {
                continue;
            };
            let mut k = source;
            while k > order {
                k -= 1;
                let upper = phys + bytes_in(k);
                // SAFETY: `upper` is the second half of a block that was
                // just on the free list.
                unsafe { self.insert_free(zone, k, upper) };
            }
            return Ok(phys);
        }
        Err(MmError::OutOfMemory)
    }

    /// Frees the `n`-page block at `addr`.
    ///
    /// The zone is derived from the address and the order from the length.
    /// The block coalesces with its buddy while possible.
    ///
    /// # Safety
    ///
    /// The block must have been returned by [`alloc_pages`](Self::alloc_pages)
    /// with the same size, and must no longer be in use.
    pub unsafe fn free_pages(&mut self, addr: PhysAddr, n: usize) {
        let zone = Zone::of(addr);
        let mut order = order_for(n);
        let mut phys = addr;
        debug_assert!(phys.is_aligned(bytes_in(order)));

        while order + 1 < MAX_ORDER {
            let buddy = PhysAddr::new(phys.as_u64() ^ bytes_in(order));
            if Zone::of(buddy) != zone {
                break;
            }
            if !self.remove_if_free(zone, order, buddy) {
                break;
            }
            phys = PhysAddr::new(phys.as_u64() & !bytes_in(order));
            order += 1;
        }
        // SAFETY: The block is unused per this function's contract.
        unsafe { self.insert_free(zone, order, phys) };
    }

    /// Free pages currently held for `zone`.
    pub fn free_pages_in(&self, zone: Zone) -> usize {
        self.zones[zone as usize].free_pages
    }

    /// Offset from physical address to CPU-visible address.
    pub fn dm_offset(&self) -> u64 {
        self.dm_offset
    }

    fn block_phys(&self, block: NonNull<FreeBlock>) -> u64 {
        block.as_ptr() as u64 - self.dm_offset
    }

    /// Pops the lowest-address block of the given order, if any.
    fn pop_first(&mut self, zi: usize, order: usize) -> Option<PhysAddr> {
        let block = self.zones[zi].lists[order].pop_first()?;
        self.zones[zi].free_pages -= pages_in(order);
        Some(PhysAddr::new(self.block_phys(block)))
    }

    /// Writes a free-block header at `phys` and links it, keeping the
    /// list sorted by ascending physical address.
    ///
    /// # Safety
    ///
    /// `phys` must be unused memory reachable at `dm_offset`.
    unsafe fn insert_free(&mut self, zone: Zone, order: usize, phys: PhysAddr) {
        let ptr = (self.dm_offset + phys.as_u64()) as *mut FreeBlock;
        // SAFETY: The block memory is unused per the caller's contract.
        unsafe {
            ptr.write(FreeBlock {
                link: ListNode::new(),
            });
        }
        // SAFETY: Just written, non-null.
        let block = unsafe { NonNull::new_unchecked(ptr) };

        let dm = self.dm_offset;
        let list = &mut self.zones[zone as usize].lists[order];
        let mut anchor = None;
        for item in list.iter() {
            let item_phys = NonNull::from(item).as_ptr() as u64 - dm;
            if item_phys > phys.as_u64() {
                anchor = Some(NonNull::from(item));
                break;
            }
        }
        match anchor {
            // SAFETY: anchor is linked in this list; block is unlinked.
            Some(a) => unsafe { list.insert_before(a, block) },
            // SAFETY: block is unlinked.
            None => unsafe { list.append(block) },
        }
        self.zones[zone as usize].free_pages += pages_in(order);
    }

    /// Removes the block at `phys` from the free list of `order` if
    /// present. Returns whether it was found.
    fn remove_if_free(&mut self, zone: Zone, order: usize, phys: PhysAddr) -> bool {
        let dm = self.dm_offset;
        let list = &mut self.zones[zone as usize].lists[order];
        let mut found = None;
        for item in list.iter() {
            let item_phys = NonNull::from(item).as_ptr() as u64 - dm;
            if item_phys == phys.as_u64() {
                found = Some(NonNull::from(item));
                break;
            }
            if item_phys > phys.as_u64() {
                // Sorted list: the buddy cannot appear later.
                break;
            }
        }
        match found {
            Some(block) => {
                // SAFETY: The block was found linked in this list.
                unsafe { list.remove(block) };
                self.zones[zone as usize].free_pages -= pages_in(order);
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Global allocator instance
// ---------------------------------------------------------------------------

/// Global buddy allocator, IRQ-save locked: it is reached from interrupt
/// context (e.g. deferred frees in the scheduler).
static BUDDY: IrqSpinLock<Option<BuddyAllocator>> = IrqSpinLock::new(None);

/// Installs the global buddy allocator.
///
/// # Panics
///
/// Panics if called twice.
pub fn init(allocator: BuddyAllocator) {
    let mut buddy = BUDDY.lock();
    assert!(buddy.is_none(), "buddy allocator already initialized");
    *buddy = Some(allocator);
}

/// Executes a closure with exclusive access to the global allocator.
///
/// # Panics
///
/// Panics if the allocator has not been initialized.
pub fn with<R>(f: impl FnOnce(&mut BuddyAllocator) -> R) -> R {
    let mut buddy = BUDDY.lock();
    f(buddy.as_mut().expect("buddy allocator not initialized"))
}

/// A [`FrameSource`] drawing order-0 pages from the global allocator.
pub struct GlobalFrameSource;

impl FrameSource for GlobalFrameSource {
    fn alloc_page(&mut self) -> Result<PhysAddr, MmError> {
        with(|b| b.alloc_pages(1, Zone::Normal))
    }

    fn free_page(&mut self, page: PhysAddr) {
        // SAFETY: The page came from `alloc_page` and the caller no longer
        // uses it.
        with(|b| unsafe { b.free_pages(page, 1) });
    }

    fn dm_offset(&self) -> u64 {
        DIRECT_MAP_BASE
    }
}
