//! Per-process virtual memory maps.
//!
//! A [`MemoryMap`] holds the process's ordered list of VM areas, the
//! physical address of its top-level page table, and the `code`/`data`/
//! `brk` region markers. Areas are page-aligned, pairwise disjoint, and
//! their flags always match the page-table attributes of every page they
//! cover.
//!
//! Heap growth (`brk`) only extends upward; shrinking is not supported.
//! `mprotect` splits areas at intersection boundaries so that protection
//! changes apply to exactly the requested range. A failure in the middle
//! of an `mprotect` walk leaves the already-updated areas in place; no
//! rollback is attempted.

use alloc::boxed::Box;
use core::ptr::NonNull;

use norn_core::addr::{PhysAddr, VirtAddr};
use norn_noalloc::list::{List, ListNode};
use norn_noalloc::list_adapter;

use crate::mapper::{PageAttr, PageMapper};
use crate::{FrameSource, MmError, PAGE_SIZE};

/// Default base of the heap region for new processes.
pub const DEFAULT_BRK_BASE: u64 = 0x8000_0000;

bitflags::bitflags! {
    /// Protection flags of a VM area.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u8 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXEC = 1 << 2;
    }
}

impl VmFlags {
    /// Read-write, the flags of anonymous data mappings.
    pub const RW: Self = Self::READ.union(Self::WRITE);

    /// Page-table attributes for a user mapping with these flags.
    pub fn attr(self) -> PageAttr {
        let mut attr = PageAttr::USER;
        if self.contains(Self::WRITE) {
            attr |= PageAttr::WRITABLE;
        }
        if self.contains(Self::EXEC) {
            attr |= PageAttr::EXECUTABLE;
        }
        attr
    }
}

/// A contiguous virtual range `[start, end)` with uniform protection.
#[derive(Debug)]
pub struct VmArea {
    /// First address (page-aligned).
    pub start: VirtAddr,
    /// One past the last address (page-aligned).
    pub end: VirtAddr,
    /// Protection flags.
    pub flags: VmFlags,
    link: ListNode,
}

list_adapter!(pub VmaAdapter for VmArea { node = link });

impl VmArea {
    /// Creates an unlinked area.
    pub fn new(start: VirtAddr, end: VirtAddr, flags: VmFlags) -> Box<Self> {
        debug_assert!(start.is_aligned(PAGE_SIZE as u64));
        debug_assert!(end.is_aligned(PAGE_SIZE as u64));
        debug_assert!(start < end);
        Box::new(Self {
            start,
            end,
            flags,
            link: ListNode::new(),
        })
    }

    /// Returns `true` if `addr` falls inside this area.
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Size in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the area is empty (never true for linked areas).
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Start/end marker of a process region (code, data, heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First address.
    pub start: VirtAddr,
    /// One past the last address.
    pub end: VirtAddr,
}

impl Region {
    /// An empty region at `addr`.
    pub const fn at(addr: VirtAddr) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }
}

/// A per-process virtual memory map.
pub struct MemoryMap<M: PageMapper> {
    areas: List<VmaAdapter>,
    mapper: M,
    /// Physical address of the top-level page table.
    root: PhysAddr,
    /// Program text region marker.
    pub code: Region,
    /// Initialised/bss data region marker.
    pub data: Region,
    /// Heap region marker. `start` is fixed; `end` grows monotonically.
    pub brk: Region,
}

impl<M: PageMapper> MemoryMap<M> {
    /// Creates an empty map over the given page table.
    pub fn new(mapper: M, root: PhysAddr) -> Self {
        let brk_base = VirtAddr::new(DEFAULT_BRK_BASE);
        Self {
            areas: List::new(),
            mapper,
            root,
            code: Region::at(VirtAddr::zero()),
            data: Region::at(VirtAddr::zero()),
            brk: Region::at(brk_base),
        }
    }

    /// The page-table root this map manipulates.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Borrow of the underlying mapper.
    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Iterates the areas in address order.
    pub fn areas(&self) -> impl Iterator<Item = &VmArea> {
        self.areas.iter()
    }

    /// Number of areas.
    pub fn area_count(&self) -> usize {
        self.areas.len()
    }

    /// Finds the area containing `addr`.
    pub fn find(&self, addr: VirtAddr) -> Option<&VmArea> {
        self.areas.iter().find(|a| a.contains(addr))
    }

    /// Translates an address through the page table.
    pub fn translate(&self, addr: VirtAddr) -> Option<(PhysAddr, PageAttr)> {
        // SAFETY: `root` is this map's valid page-table root.
        unsafe {
            self.mapper
                .translate(self.root, addr.align_down(PAGE_SIZE as u64))
        }
        .map(|(p, a)| (p + addr.page_offset(), a))
    }

    /// Allocates, zeroes and maps `[vaddr, vaddr + size)` (aligned
    /// outward to page boundaries) and returns the new area.
    ///
    /// The area is not yet linked; pass it to [`insert`](Self::insert).
    pub fn map(
        &mut self,
        vaddr: VirtAddr,
        size: usize,
        flags: VmFlags,
        frames: &mut impl FrameSource,
    ) -> Result<Box<VmArea>, MmError> {
        if size == 0 {
            return Err(MmError::InvalidRegion);
        }
        let start = vaddr.align_down(PAGE_SIZE as u64);
        let end = (vaddr + size as u64).align_up(PAGE_SIZE as u64);
        self.map_pages(start, end, flags, frames)?;
        Ok(VmArea::new(start, end, flags))
    }

    /// Links an area into the list, keeping address order.
    pub fn insert(&mut self, vma: Box<VmArea>) -> NonNull<VmArea> {
        let start = vma.start;
        debug_assert!(
            self.areas.iter().all(|a| a.end <= start || a.start >= vma.end),
            "inserting an overlapping area"
        );
        // The list owns the allocation from here; freed in Drop.
        let ptr = NonNull::from(Box::leak(vma));
        let anchor = self
            .areas
            .iter()
            .find(|a| a.start > start)
            .map(NonNull::from);
        match anchor {
            // SAFETY: anchor is linked in this list; ptr is unlinked.
            Some(a) => unsafe { self.areas.insert_before(a, ptr) },
            // SAFETY: ptr is unlinked.
            None => unsafe { self.areas.append(ptr) },
        }
        ptr
    }

    /// Maps zeroed pages over `[start, end)` with the attributes of
    /// `flags`. On failure, pages mapped by this call are unmapped and
    /// freed before the error is returned.
    fn map_pages(
        &mut self,
        start: VirtAddr,
        end: VirtAddr,
        flags: VmFlags,
        frames: &mut impl FrameSource,
    ) -> Result<(), MmError> {
        let attr = flags.attr();
        let mut va = start;
        while va < end {
            let result = frames.alloc_page().and_then(|page| {
                let dst = (frames.dm_offset() + page.as_u64()) as *mut u8;
                // SAFETY: The frame source hands out unused pages reachable
                // at its dm offset.
                unsafe { core::ptr::write_bytes(dst, 0, PAGE_SIZE) };
                // SAFETY: `root` is this map's valid page-table root.
                unsafe {
                    self.mapper
                        .map(self.root, va, page, attr, &mut || frames.alloc_page())
                }
                .inspect_err(|_| frames.free_page(page))
            });
            match result {
                Ok(flush) => {
                    // Fresh mapping, never in the TLB.
                    flush.ignore();
                    va = va + PAGE_SIZE as u64;
                }
                Err(e) => {
                    self.unmap_pages(start, va, frames);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Unmaps `[start, end)` and returns the frames to the source.
    fn unmap_pages(&mut self, start: VirtAddr, end: VirtAddr, frames: &mut impl FrameSource) {
        let mut va = start;
        while va < end {
            // SAFETY: `root` is this map's valid page-table root.
            if let Ok((page, flush)) = unsafe { self.mapper.unmap(self.root, va) } {
                flush.flush();
                frames.free_page(page);
            }
            va = va + PAGE_SIZE as u64;
        }
    }

    /// Grows the heap to `requested`, returning the resulting break.
    ///
    /// Follows the Linux contract: shrink requests and failures return
    /// the current break unchanged. Growth over a mapping that does not
    /// belong to the heap is rejected (also surfacing as an unchanged
    /// break).
    pub fn brk(&mut self, requested: VirtAddr, frames: &mut impl FrameSource) -> VirtAddr {
        let current = self.brk.end;
        if requested <= self.brk.start || requested <= current {
            return current;
        }
        let rounded = requested.align_up(PAGE_SIZE as u64);

        // The heap area mapping the highest address, if any.
        let last = self
            .areas
            .iter()
            .filter(|a| a.start >= self.brk.start && a.start < self.brk.end)
            .max_by_key(|a| a.end)
            .map(NonNull::from);

        let grow_from = match last {
            Some(a) => {
                // SAFETY: `a` came from the live list.
                unsafe { a.as_ref().end }
            }
            None => self.brk.start,
        };

        // A foreign mapping inside the growth range rejects the call.
        let conflict = self
            .areas
            .iter()
            .any(|area| area.start < rounded && area.end > grow_from);
        if conflict {
            return current;
        }

        match last {
            Some(mut area) => {
                if self.map_pages(grow_from, rounded, VmFlags::RW, frames).is_err() {
                    return current;
                }
                // SAFETY: The area stays linked; only its end moves.
                unsafe { area.as_mut().end = rounded };
            }
            None => {
                let vma = match self.map(
                    self.brk.start,
                    (rounded - self.brk.start) as usize,
                    VmFlags::RW,
                    frames,
                ) {
                    Ok(vma) => vma,
                    Err(_) => return current,
                };
                self.insert(vma);
            }
        }
        self.brk.end = rounded;
        rounded
    }

    /// Changes the protection of `[addr, addr + len)` to `prot`.
    ///
    /// Areas partially covered by the range are split at the intersection
    /// boundaries. A mid-walk failure leaves already-updated areas with
    /// their new protection.
    pub fn mprotect(
        &mut self,
        addr: VirtAddr,
        len: usize,
        prot: VmFlags,
    ) -> Result<(), MmError> {
        if !addr.is_aligned(PAGE_SIZE as u64) || len == 0 || len % PAGE_SIZE != 0 {
            return Err(MmError::InvalidRegion);
        }
        let end = addr + len as u64;

        let mut cursor = self.areas.first();
        while let Some(area_ptr) = cursor {
            // SAFETY: The cursor always points at a linked area.
            let (a_start, a_end, a_flags) = {
                let area = unsafe { area_ptr.as_ref() };
                (area.start, area.end, area.flags)
            };
            if a_start >= end {
                break;
            }
            // SAFETY: area_ptr is linked in this list.
            let next = unsafe { self.areas.next_of(area_ptr) };
            if a_end <= addr || a_flags == prot {
                cursor = next;
                continue;
            }

            // Trim to the intersection by splitting at each boundary.
            let mut target = area_ptr;
            if a_start < addr {
                target = self.split_vma(target, addr);
            }
            // SAFETY: target is linked; split keeps it valid.
            if unsafe { target.as_ref().end } > end {
                self.split_vma(target, end);
            }

            // SAFETY: target is linked and exclusively referenced here.
            let (t_start, t_end) = unsafe {
                let t = target.as_ptr();
                (*t).flags = prot;
                ((*t).start, (*t).end)
            };
            let attr = prot.attr();
            let mut va = t_start;
            while va < t_end {
                // SAFETY: `root` is this map's valid page-table root.
                let flush = unsafe { self.mapper.update_attr(self.root, va, attr) }?;
                flush.flush();
                va = va + PAGE_SIZE as u64;
            }

            // SAFETY: target is linked in this list.
            cursor = unsafe { self.areas.next_of(target) };
        }
        Ok(())
    }

    /// Splits the area at `at`, which must lie strictly inside it.
    ///
    /// The original keeps `[start, at)`; the returned area covers
    /// `[at, end)` with the same flags and shares the backing pages.
    pub fn split_vma(&mut self, area: NonNull<VmArea>, at: VirtAddr) -> NonNull<VmArea> {
        debug_assert!(at.is_aligned(PAGE_SIZE as u64));
        // SAFETY: The caller hands a linked area; we hold &mut self.
        let (end, flags) = unsafe {
            let a = area.as_ptr();
            debug_assert!((*a).start < at && at < (*a).end);
            let end = (*a).end;
            let flags = (*a).flags;
            (*a).end = at;
            (end, flags)
        };
        let second = NonNull::from(Box::leak(VmArea::new(at, end, flags)));
        // SAFETY: area is linked; second is unlinked.
        unsafe { self.areas.insert_after(area, second) };
        second
    }

    /// Unmaps every area and returns all frames to the source.
    pub fn teardown(&mut self, frames: &mut impl FrameSource) {
        while let Some(area) = self.areas.pop_first() {
            // SAFETY: pop_first unlinked the area; the box was leaked by
            // `insert`/`split_vma` and is reclaimed exactly once here.
            let area = unsafe { Box::from_raw(area.as_ptr()) };
            self.unmap_pages(area.start, area.end, frames);
        }
    }
}

impl<M: PageMapper> Drop for MemoryMap<M> {
    fn drop(&mut self) {
        // Frames are reclaimed via `teardown`; here only the area
        // allocations are released.
        while let Some(area) = self.areas.pop_first() {
            // SAFETY: Leaked by `insert`/`split_vma`, reclaimed once.
            drop(unsafe { Box::from_raw(area.as_ptr()) });
        }
    }
}
