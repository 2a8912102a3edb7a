//! 4-level page table manipulation.
//!
//! Implements the [`PageMapper`] contract over the x86_64 PML4 hierarchy
//! with 4 KiB pages. Table frames are reached by adding a direct-map
//! offset to their physical addresses; during page-table reconstruction
//! (before the direct map exists) the UEFI identity mapping is still
//! active and the offset is zero.
//!
//! Intermediate entries are created maximally permissive (present,
//! writable, user); the leaf entry carries the real protection, which is
//! the convention the permission check hardware expects.

use norn_core::addr::{PhysAddr, VirtAddr};
use norn_mm::mapper::{MapFlush, PageAttr, PageMapper};
use norn_mm::{MmError, PAGE_SIZE};

/// Entries per table at every level.
const ENTRIES: usize = 512;

/// Page-table entry bits.
mod bits {
    pub const PRESENT: u64 = 1 << 0;
    pub const WRITABLE: u64 = 1 << 1;
    pub const USER: u64 = 1 << 2;
    pub const CACHE_DISABLE: u64 = 1 << 4;
    pub const GLOBAL: u64 = 1 << 8;
    pub const NO_EXECUTE: u64 = 1 << 63;
    /// Physical frame mask (bits 12..52).
    pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
}

/// One page-table entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
struct Entry(u64);

impl Entry {
    const fn empty() -> Self {
        Self(0)
    }

    fn is_present(self) -> bool {
        self.0 & bits::PRESENT != 0
    }

    fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & bits::ADDR_MASK)
    }

    fn leaf(frame: PhysAddr, attr: PageAttr) -> Self {
        let mut raw = (frame.as_u64() & bits::ADDR_MASK) | bits::PRESENT | bits::NO_EXECUTE;
        if attr.contains(PageAttr::WRITABLE) {
            raw |= bits::WRITABLE;
        }
        if attr.contains(PageAttr::EXECUTABLE) {
            raw &= !bits::NO_EXECUTE;
        }
        if attr.contains(PageAttr::USER) {
            raw |= bits::USER;
        }
        if attr.contains(PageAttr::GLOBAL) {
            raw |= bits::GLOBAL;
        }
        if attr.contains(PageAttr::CACHE_DISABLE) {
            raw |= bits::CACHE_DISABLE;
        }
        Self(raw)
    }

    fn table(frame: PhysAddr) -> Self {
        Self((frame.as_u64() & bits::ADDR_MASK) | bits::PRESENT | bits::WRITABLE | bits::USER)
    }

    fn attr(self) -> PageAttr {
        let mut attr = PageAttr::empty();
        if self.0 & bits::WRITABLE != 0 {
            attr |= PageAttr::WRITABLE;
        }
        if self.0 & bits::NO_EXECUTE == 0 {
            attr |= PageAttr::EXECUTABLE;
        }
        if self.0 & bits::USER != 0 {
            attr |= PageAttr::USER;
        }
        if self.0 & bits::GLOBAL != 0 {
            attr |= PageAttr::GLOBAL;
        }
        if self.0 & bits::CACHE_DISABLE != 0 {
            attr |= PageAttr::CACHE_DISABLE;
        }
        attr
    }
}

/// Table index of `virt` at `level` (3 = PML4 down to 0 = PT).
fn index_at(virt: VirtAddr, level: usize) -> usize {
    ((virt.as_u64() >> (12 + 9 * level)) as usize) & (ENTRIES - 1)
}

/// The x86_64 page-table mapper.
#[derive(Debug, Clone, Copy)]
pub struct PageTableMapper {
    /// Offset added to physical addresses to reach table memory.
    dm_offset: u64,
}

impl PageTableMapper {
    /// Creates a mapper reaching table frames at `dm_offset`.
    pub const fn new(dm_offset: u64) -> Self {
        Self { dm_offset }
    }

    fn table_ptr(&self, frame: PhysAddr) -> *mut Entry {
        (self.dm_offset + frame.as_u64()) as *mut Entry
    }

    /// Returns the entry slot for `virt` at the leaf level, descending
    /// from `root` and creating missing tables from `alloc` when
    /// `create` is set.
    ///
    /// # Safety
    ///
    /// `root` must be a valid table frame reachable at `dm_offset`.
    unsafe fn walk(
        &self,
        root: PhysAddr,
        virt: VirtAddr,
        create: bool,
        alloc: &mut dyn FnMut() -> Result<PhysAddr, MmError>,
    ) -> Result<*mut Entry, MmError> {
        let mut table = root;
        for level in (1..=3).rev() {
            let slot = unsafe { self.table_ptr(table).add(index_at(virt, level)) };
            // SAFETY: The slot lies within the table frame.
            let entry = unsafe { slot.read() };
            table = if entry.is_present() {
                entry.frame()
            } else {
                if !create {
                    return Err(MmError::NotMapped);
                }
                let fresh = alloc()?;
                // SAFETY: The allocator returns zeroed frames; the write
                // stays within the table frame.
                unsafe { slot.write(Entry::table(fresh)) };
                fresh
            };
        }
        Ok(unsafe { self.table_ptr(table).add(index_at(virt, 0)) })
    }
}

// SAFETY: Walks and edits hardware-format tables through the direct map,
// one entry at a time, exactly as the contract requires.
unsafe impl PageMapper for PageTableMapper {
    unsafe fn map(
        &mut self,
        root: PhysAddr,
        virt: VirtAddr,
        phys: PhysAddr,
        attr: PageAttr,
        alloc: &mut dyn FnMut() -> Result<PhysAddr, MmError>,
    ) -> Result<MapFlush, MmError> {
        debug_assert!(virt.is_aligned(PAGE_SIZE as u64));
        debug_assert!(phys.is_aligned(PAGE_SIZE as u64));
        // SAFETY: Per the trait contract.
        let slot = unsafe { self.walk(root, virt, true, alloc) }?;
        // SAFETY: `walk` returns an in-table slot.
        unsafe {
            if slot.read().is_present() {
                return Err(MmError::InvalidRegion);
            }
            slot.write(Entry::leaf(phys, attr));
        }
        Ok(MapFlush::new(virt))
    }

    unsafe fn unmap(
        &mut self,
        root: PhysAddr,
        virt: VirtAddr,
    ) -> Result<(PhysAddr, MapFlush), MmError> {
        let mut no_alloc = || Err(MmError::NotMapped);
        // SAFETY: Per the trait contract.
        let slot = unsafe { self.walk(root, virt, false, &mut no_alloc) }?;
        // SAFETY: `walk` returns an in-table slot.
        unsafe {
            let entry = slot.read();
            if !entry.is_present() {
                return Err(MmError::NotMapped);
            }
            slot.write(Entry::empty());
            Ok((entry.frame(), MapFlush::new(virt)))
        }
    }

    unsafe fn update_attr(
        &mut self,
        root: PhysAddr,
        virt: VirtAddr,
        attr: PageAttr,
    ) -> Result<MapFlush, MmError> {
        let mut no_alloc = || Err(MmError::NotMapped);
        // SAFETY: Per the trait contract.
        let slot = unsafe { self.walk(root, virt, false, &mut no_alloc) }?;
        // SAFETY: `walk` returns an in-table slot.
        unsafe {
            let entry = slot.read();
            if !entry.is_present() {
                return Err(MmError::NotMapped);
            }
            slot.write(Entry::leaf(entry.frame(), attr));
        }
        Ok(MapFlush::new(virt))
    }

    unsafe fn translate(&self, root: PhysAddr, virt: VirtAddr) -> Option<(PhysAddr, PageAttr)> {
        let mut no_alloc = || Err(MmError::NotMapped);
        // SAFETY: Per the trait contract.
        let slot = unsafe { self.walk(root, virt, false, &mut no_alloc) }.ok()?;
        // SAFETY: `walk` returns an in-table slot.
        let entry = unsafe { slot.read() };
        if !entry.is_present() {
            return None;
        }
        Some((entry.frame(), entry.attr()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use norn_mm::FrameSource;
    use std::alloc::Layout;

    /// Zeroed page-aligned frames from a host buffer.
    struct TestFrames {
        base: *mut u8,
        layout: Layout,
        pages: usize,
        next: usize,
    }

    impl TestFrames {
        fn new(pages: usize) -> Self {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: Non-zero, valid layout.
            let base = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!base.is_null());
            Self {
                base,
                layout,
                pages,
                next: 0,
            }
        }
    }

    impl Drop for TestFrames {
        fn drop(&mut self) {
            // SAFETY: Allocated with the stored layout.
            unsafe { std::alloc::dealloc(self.base, self.layout) };
        }
    }

    impl FrameSource for TestFrames {
        fn alloc_page(&mut self) -> Result<PhysAddr, MmError> {
            if self.next == self.pages {
                return Err(MmError::OutOfMemory);
            }
            let addr = PhysAddr::new((self.next * PAGE_SIZE) as u64);
            self.next += 1;
            Ok(addr)
        }

        fn free_page(&mut self, _page: PhysAddr) {}

        fn dm_offset(&self) -> u64 {
            self.base as u64
        }
    }

    fn setup() -> (TestFrames, PageTableMapper, PhysAddr) {
        let mut frames = TestFrames::new(32);
        let mapper = PageTableMapper::new(frames.dm_offset());
        let root = frames.alloc_page().unwrap();
        (frames, mapper, root)
    }

    #[test]
    fn map_then_translate() {
        let (mut frames, mut mapper, root) = setup();
        let virt = VirtAddr::new(0x40_0000);
        let phys = frames.alloc_page().unwrap();
        // SAFETY: Test tables in a host buffer.
        unsafe {
            mapper
                .map(root, virt, phys, PageAttr::WRITABLE | PageAttr::USER, &mut || {
                    frames.alloc_page()
                })
                .unwrap()
                .ignore();
            let (out_phys, attr) = mapper.translate(root, virt).unwrap();
            assert_eq!(out_phys, phys);
            assert!(attr.contains(PageAttr::WRITABLE));
            assert!(attr.contains(PageAttr::USER));
            assert!(!attr.contains(PageAttr::EXECUTABLE));
        }
    }

    #[test]
    fn translate_unmapped_is_none() {
        let (_frames, mapper, root) = setup();
        // SAFETY: Test tables in a host buffer.
        assert!(unsafe { mapper.translate(root, VirtAddr::new(0x1000)) }.is_none());
    }

    #[test]
    fn double_map_is_rejected() {
        let (mut frames, mut mapper, root) = setup();
        let virt = VirtAddr::new(0x1000);
        let phys = frames.alloc_page().unwrap();
        // SAFETY: Test tables in a host buffer.
        unsafe {
            mapper
                .map(root, virt, phys, PageAttr::USER, &mut || frames.alloc_page())
                .unwrap()
                .ignore();
            assert_eq!(
                mapper
                    .map(root, virt, phys, PageAttr::USER, &mut || frames.alloc_page())
                    .map(|f| f.ignore()),
                Err(MmError::InvalidRegion)
            );
        }
    }

    #[test]
    fn unmap_returns_frame() {
        let (mut frames, mut mapper, root) = setup();
        let virt = VirtAddr::new(0x7F00_2000);
        let phys = frames.alloc_page().unwrap();
        // SAFETY: Test tables in a host buffer.
        unsafe {
            mapper
                .map(root, virt, phys, PageAttr::USER, &mut || frames.alloc_page())
                .unwrap()
                .ignore();
            let (freed, flush) = mapper.unmap(root, virt).unwrap();
            flush.flush();
            assert_eq!(freed, phys);
            assert!(mapper.translate(root, virt).is_none());
            // Unmapping again reports NotMapped.
            assert!(matches!(mapper.unmap(root, virt), Err(MmError::NotMapped)));
        }
    }

    #[test]
    fn update_attr_rewrites_leaf() {
        let (mut frames, mut mapper, root) = setup();
        let virt = VirtAddr::new(0x2000);
        let phys = frames.alloc_page().unwrap();
        // SAFETY: Test tables in a host buffer.
        unsafe {
            mapper
                .map(
                    root,
                    virt,
                    phys,
                    PageAttr::WRITABLE | PageAttr::USER,
                    &mut || frames.alloc_page(),
                )
                .unwrap()
                .ignore();
            mapper
                .update_attr(root, virt, PageAttr::EXECUTABLE | PageAttr::USER)
                .unwrap()
                .flush();
            let (out_phys, attr) = mapper.translate(root, virt).unwrap();
            assert_eq!(out_phys, phys);
            assert!(attr.contains(PageAttr::EXECUTABLE));
            assert!(!attr.contains(PageAttr::WRITABLE));
        }
    }

    #[test]
    fn distinct_pml4_slots() {
        // Two addresses far apart exercise separate PML4 entries.
        let (mut frames, mut mapper, root) = setup();
        let low = VirtAddr::new(0x1000);
        let high = VirtAddr::new(0x0000_7F00_0000_1000);
        let p1 = frames.alloc_page().unwrap();
        let p2 = frames.alloc_page().unwrap();
        // SAFETY: Test tables in a host buffer.
        unsafe {
            mapper
                .map(root, low, p1, PageAttr::USER, &mut || frames.alloc_page())
                .unwrap()
                .ignore();
            mapper
                .map(root, high, p2, PageAttr::USER, &mut || frames.alloc_page())
                .unwrap()
                .ignore();
            assert_eq!(mapper.translate(root, low).unwrap().0, p1);
            assert_eq!(mapper.translate(root, high).unwrap().0, p2);
        }
    }

    #[test]
    fn table_allocation_failure_propagates() {
        let mut frames = TestFrames::new(2); // root + one table only
        let mapper_dm = frames.dm_offset();
        let mut mapper = PageTableMapper::new(mapper_dm);
        let root = frames.alloc_page().unwrap();
        // Mapping needs three intermediate tables; only one frame remains.
        // SAFETY: Test tables in a host buffer.
        let result = unsafe {
            mapper.map(
                root,
                VirtAddr::new(0x1000),
                PhysAddr::new(0x10_0000),
                PageAttr::USER,
                &mut || frames.alloc_page(),
            )
        };
        assert!(matches!(result.map(|f| f.ignore()), Err(MmError::OutOfMemory)));
    }
}
