//! Bootstrap bump allocator.
//!
//! Alive only between boot handoff and buddy-allocator initialisation: the
//! page-table reconstruction needs pages before any real allocator exists.
//! Pages are bumped from the start of the first usable UEFI region, and the
//! issued prefix is recorded so [`buddy`](crate::buddy) can exclude it at
//! handoff. There is no free.

use norn_boot::memmap::MemoryMap;
use norn_core::addr::PhysAddr;

use crate::{MmError, PAGE_SIZE};

/// The bootstrap allocator.
#[derive(Debug)]
pub struct BumpAllocator {
    region_start: PhysAddr,
    region_pages: usize,
    pages_issued: usize,
}

impl BumpAllocator {
    /// Creates a bump allocator over the first usable region of the boot
    /// memory map.
    pub fn new(map: &MemoryMap) -> Result<Self, MmError> {
        let region = map
            .iter()
            .find(|d| d.is_usable() && d.number_of_pages > 0)
            .ok_or(MmError::OutOfMemory)?;
        Ok(Self {
            region_start: region.start(),
            region_pages: region.number_of_pages as usize,
            pages_issued: 0,
        })
    }

    /// Allocates `n` contiguous pages from the region prefix.
    pub fn alloc_pages(&mut self, n: usize) -> Result<PhysAddr, MmError> {
        if self.pages_issued + n > self.region_pages {
            return Err(MmError::OutOfMemory);
        }
        let addr = self.region_start + (self.pages_issued * PAGE_SIZE) as u64;
        self.pages_issued += n;
        Ok(addr)
    }

    /// Returns `(region_start, pages_issued)` for the buddy handoff.
    ///
    /// The buddy allocator must not free the issued prefix back into its
    /// lists; it holds live early page tables.
    pub fn issued(&self) -> (PhysAddr, usize) {
        (self.region_start, self.pages_issued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use norn_boot::memmap::MemoryDescriptor;

    fn build_map(descs: &[MemoryDescriptor]) -> (Vec<u8>, MemoryMap) {
        let stride = core::mem::size_of::<MemoryDescriptor>();
        let mut buf = vec![0u8; descs.len() * stride];
        for (i, d) in descs.iter().enumerate() {
            // SAFETY: buf has room for one descriptor per stride slot.
            unsafe {
                core::ptr::write_unaligned(
                    buf.as_mut_ptr().add(i * stride).cast::<MemoryDescriptor>(),
                    *d,
                );
            }
        }
        let map = MemoryMap {
            descriptors: buf.as_ptr(),
            map_size: buf.len(),
            descriptor_size: stride,
        };
        (buf, map)
    }

    fn desc(ty: u32, start: u64, pages: u64) -> MemoryDescriptor {
        MemoryDescriptor {
            memory_type: ty,
            physical_start: start,
            virtual_start: 0,
            number_of_pages: pages,
            attribute: 0,
        }
    }

    #[test]
    fn first_usable_region_is_chosen() {
        let (_buf, map) = build_map(&[
            desc(0, 0x0, 16),         // reserved
            desc(7, 0x10_0000, 8),    // conventional -- chosen
            desc(7, 0x100_0000, 64),  // later conventional
        ]);
        let mut bump = BumpAllocator::new(&map).unwrap();
        assert_eq!(bump.alloc_pages(1).unwrap(), PhysAddr::new(0x10_0000));
        assert_eq!(bump.alloc_pages(2).unwrap(), PhysAddr::new(0x10_1000));
        assert_eq!(bump.issued(), (PhysAddr::new(0x10_0000), 3));
    }

    #[test]
    fn exhaustion_fails() {
        let (_buf, map) = build_map(&[desc(7, 0x2000, 4)]);
        let mut bump = BumpAllocator::new(&map).unwrap();
        assert!(bump.alloc_pages(3).is_ok());
        assert_eq!(bump.alloc_pages(2), Err(MmError::OutOfMemory));
        // A fitting request still succeeds after a failed one.
        assert!(bump.alloc_pages(1).is_ok());
        assert_eq!(bump.issued().1, 4);
    }

    #[test]
    fn no_usable_region() {
        let (_buf, map) = build_map(&[desc(0, 0x0, 16), desc(10, 0x1000_0000, 4)]);
        assert!(BumpAllocator::new(&map).is_err());
    }
}
