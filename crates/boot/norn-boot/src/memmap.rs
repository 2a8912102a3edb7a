//! UEFI memory map types and iteration.
//!
//! # Memory Map Stride
//!
//! When iterating over descriptors returned by `GetMemoryMap`, the stride
//! between entries is the `descriptor_size` reported by the firmware, not
//! `size_of::<MemoryDescriptor>()`: the firmware may return descriptors
//! larger than the struct definition.

use bitflags::bitflags;
use norn_core::addr::PhysAddr;

/// The type of a memory region in the UEFI memory map.
///
/// Values match the UEFI `EFI_MEMORY_TYPE` enumeration, plus the Norn
/// OS-defined range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Not usable.
    Reserved,
    /// The code portions of a loaded UEFI application.
    LoaderCode,
    /// The data portions of a loaded UEFI application.
    LoaderData,
    /// The code portions of a loaded UEFI Boot Services Driver.
    BootServicesCode,
    /// The data portions of a loaded UEFI Boot Services Driver.
    BootServicesData,
    /// The code portions of a loaded UEFI Runtime Services Driver.
    RuntimeServicesCode,
    /// The data portions of a loaded UEFI Runtime Services Driver.
    RuntimeServicesData,
    /// Free (unallocated) memory.
    Conventional,
    /// Memory in which errors have been detected.
    Unusable,
    /// Memory that holds the ACPI tables, reclaimable after parsing.
    AcpiReclaim,
    /// Address space reserved for use by the firmware.
    AcpiNvs,
    /// Memory-mapped I/O region.
    MemoryMappedIo,
    /// Memory-mapped I/O port space.
    MemoryMappedIoPortSpace,
    /// Processor firmware code.
    PalCode,
    /// Byte-addressable non-volatile memory.
    Persistent,
    /// Kernel-claimed ranges that survive `ExitBootServices`.
    ///
    /// Written by the Norn loader for the kernel image, page tables and
    /// the handoff record itself; never handed to the allocators.
    NornReserved,
    /// Any value this kernel does not recognise.
    Unknown(u32),
}

/// OS-defined memory type value for [`MemoryType::NornReserved`].
pub const NORN_RESERVED: u32 = 0x8000_0000;

impl MemoryType {
    /// Decodes a raw descriptor type value.
    pub const fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Reserved,
            1 => Self::LoaderCode,
            2 => Self::LoaderData,
            3 => Self::BootServicesCode,
            4 => Self::BootServicesData,
            5 => Self::RuntimeServicesCode,
            6 => Self::RuntimeServicesData,
            7 => Self::Conventional,
            8 => Self::Unusable,
            9 => Self::AcpiReclaim,
            10 => Self::AcpiNvs,
            11 => Self::MemoryMappedIo,
            12 => Self::MemoryMappedIoPortSpace,
            13 => Self::PalCode,
            14 => Self::Persistent,
            NORN_RESERVED => Self::NornReserved,
            other => Self::Unknown(other),
        }
    }

    /// Returns `true` if the region is free for the kernel to allocate
    /// after boot services exit.
    pub const fn is_usable(self) -> bool {
        matches!(
            self,
            Self::Conventional | Self::BootServicesCode | Self::BootServicesData
        )
    }
}

bitflags! {
    /// Memory attribute flags from a UEFI memory descriptor.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryAttributes: u64 {
        /// Uncacheable.
        const UC = 1 << 0;
        /// Write combining.
        const WC = 1 << 1;
        /// Write through.
        const WT = 1 << 2;
        /// Write back.
        const WB = 1 << 3;
        /// Write protected.
        const WP = 1 << 12;
        /// Read protected.
        const RP = 1 << 13;
        /// Execute protected.
        const XP = 1 << 14;
        /// Needs a runtime virtual mapping.
        const RUNTIME = 1 << 63;
    }
}

/// A descriptor for a region of physical memory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryDescriptor {
    /// The raw type of this memory region.
    pub memory_type: u32,
    /// Physical address of the first byte (4 KiB aligned).
    pub physical_start: u64,
    /// Virtual address assigned by `SetVirtualAddressMap`, if any.
    pub virtual_start: u64,
    /// Number of 4 KiB pages in the region.
    pub number_of_pages: u64,
    /// Capability attributes of the region.
    pub attribute: u64,
}

impl MemoryDescriptor {
    /// Decoded memory type.
    pub const fn memory_type(&self) -> MemoryType {
        MemoryType::from_u32(self.memory_type)
    }

    /// Physical start address.
    pub const fn start(&self) -> PhysAddr {
        PhysAddr::new(self.physical_start)
    }

    /// Region size in bytes.
    pub const fn size(&self) -> u64 {
        self.number_of_pages * 4096
    }

    /// Returns `true` if the kernel may allocate from this region.
    pub const fn is_usable(&self) -> bool {
        self.memory_type().is_usable()
    }
}

/// A view of the UEFI memory map captured at `ExitBootServices`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemoryMap {
    /// First descriptor.
    pub descriptors: *const u8,
    /// Total size of the descriptor array in bytes.
    pub map_size: usize,
    /// Stride between descriptors (may exceed the struct size).
    pub descriptor_size: usize,
}

// SAFETY: The map is read-only boot input; sharing the raw view between
// CPUs during init is sound.
unsafe impl Send for MemoryMap {}
unsafe impl Sync for MemoryMap {}

impl MemoryMap {
    /// An empty map (no descriptors). Useful for tests.
    pub const fn empty() -> Self {
        Self {
            descriptors: core::ptr::null(),
            map_size: 0,
            descriptor_size: core::mem::size_of::<MemoryDescriptor>(),
        }
    }

    /// Number of descriptors in the map.
    pub fn len(&self) -> usize {
        if self.descriptor_size == 0 {
            0
        } else {
            self.map_size / self.descriptor_size
        }
    }

    /// Returns `true` if the map holds no descriptors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the descriptors, honouring the firmware stride.
    pub fn iter(&self) -> MemoryMapIter<'_> {
        MemoryMapIter {
            map: self,
            index: 0,
        }
    }
}

/// Iterator over [`MemoryMap`] descriptors.
pub struct MemoryMapIter<'a> {
    map: &'a MemoryMap,
    index: usize,
}

impl Iterator for MemoryMapIter<'_> {
    type Item = MemoryDescriptor;

    fn next(&mut self) -> Option<MemoryDescriptor> {
        if self.index >= self.map.len() {
            return None;
        }
        let offset = self.index * self.map.descriptor_size;
        self.index += 1;
        // SAFETY: The loader guarantees `map_size` bytes of descriptors at
        // `descriptors`; offset + struct size fits because the stride is at
        // least the struct size.
        unsafe {
            Some(core::ptr::read_unaligned(
                self.map.descriptors.add(offset).cast::<MemoryDescriptor>(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a raw memory map image with the given stride.
    fn build_map(descs: &[MemoryDescriptor], stride: usize) -> Vec<u8> {
        assert!(stride >= core::mem::size_of::<MemoryDescriptor>());
        let mut buf = vec![0u8; descs.len() * stride];
        for (i, d) in descs.iter().enumerate() {
            // SAFETY: buf has room for one descriptor at each stride slot.
            unsafe {
                core::ptr::write_unaligned(
                    buf.as_mut_ptr().add(i * stride).cast::<MemoryDescriptor>(),
                    *d,
                );
            }
        }
        buf
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
    fn usable_types() {
        assert!(MemoryType::Conventional.is_usable());
        assert!(MemoryType::BootServicesCode.is_usable());
        assert!(MemoryType::BootServicesData.is_usable());
        assert!(!MemoryType::Reserved.is_usable());
        assert!(!MemoryType::RuntimeServicesData.is_usable());
        assert!(!MemoryType::NornReserved.is_usable());
    }

    #[test]
    fn norn_reserved_round_trip() {
        assert_eq!(MemoryType::from_u32(NORN_RESERVED), MemoryType::NornReserved);
        assert_eq!(MemoryType::from_u32(0xDEAD), MemoryType::Unknown(0xDEAD));
    }

    #[test]
    fn iterate_with_firmware_stride() {
        let descs = [
            desc(7, 0x1000, 16),
            desc(0, 0x100000, 32),
            desc(NORN_RESERVED, 0x200000, 8),
        ];
        // Firmware reports descriptors 8 bytes larger than our struct.
        let stride = core::mem::size_of::<MemoryDescriptor>() + 8;
        let buf = build_map(&descs, stride);
        let map = MemoryMap {
            descriptors: buf.as_ptr(),
            map_size: buf.len(),
            descriptor_size: stride,
        };

        let collected: Vec<MemoryDescriptor> = map.iter().collect();
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0].physical_start, 0x1000);
        assert!(collected[0].is_usable());
        assert_eq!(collected[1].memory_type(), MemoryType::Reserved);
        assert_eq!(collected[2].memory_type(), MemoryType::NornReserved);
        assert_eq!(collected[2].size(), 8 * 4096);
    }

    #[test]
    fn empty_map_iterates_nothing() {
        let map = MemoryMap::empty();
        assert!(map.is_empty());
        assert_eq!(map.iter().count(), 0);
    }
}
