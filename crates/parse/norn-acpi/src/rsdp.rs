//! Root System Description Pointer (RSDP) validation.
//!
//! The RSDP is the entry point into the ACPI table hierarchy. ACPI 1.0
//! defines a 20-byte structure ([`Rsdp`]); ACPI 2.0+ extends it to 36
//! bytes ([`Rsdp2`]) with a 64-bit XSDT address and an extended checksum.

use crate::AcpiError;
use crate::sdt::validate_checksum;

/// ACPI 1.0 RSDP — 20 bytes.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Rsdp {
    /// Must be `b"RSD PTR "` (8 bytes, note the trailing space).
    pub signature: [u8; 8],
    /// Checksum covering the first 20 bytes.
    pub checksum: u8,
    /// OEM identification string.
    pub oem_id: [u8; 6],
    /// ACPI revision: 0 for ACPI 1.0, 2 for ACPI 2.0+.
    pub revision: u8,
    /// Physical address of the RSDT (32-bit).
    pub rsdt_address: u32,
}

impl Rsdp {
    /// Size of the ACPI 1.0 RSDP structure in bytes.
    pub const SIZE: usize = 20;

    /// Expected signature bytes.
    pub const SIGNATURE: &[u8; 8] = b"RSD PTR ";
}

/// ACPI 2.0+ RSDP extension — 36 bytes total.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Rsdp2 {
    /// The ACPI 1.0 portion.
    pub v1: Rsdp,
    /// Total length of this structure (should be 36).
    pub length: u32,
    /// Physical address of the XSDT (64-bit).
    pub xsdt_address: u64,
    /// Checksum covering the entire 36 bytes.
    pub extended_checksum: u8,
    /// Reserved bytes.
    pub reserved: [u8; 3],
}

impl Rsdp2 {
    /// Size of the ACPI 2.0 RSDP structure in bytes.
    pub const SIZE: usize = 36;
}

/// Result of [`parse_rsdp`]: where the table directory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDirectory {
    /// Physical address of the RSDT or XSDT.
    pub address: u64,
    /// `true` when `address` points at an XSDT (64-bit entries).
    pub is_xsdt: bool,
}

/// Parses and validates an RSDP image.
///
/// `data` must hold at least 20 bytes; 36 are consulted for ACPI 2.0+.
/// Signature and checksum failures are fatal during init, so the caller
/// treats any error as unrecoverable.
pub fn parse_rsdp(data: &[u8]) -> Result<TableDirectory, AcpiError> {
    if data.len() < Rsdp::SIZE {
        return Err(AcpiError::InvalidTable);
    }
    // SAFETY: The slice holds at least 20 bytes of plain-old-data.
    let v1: Rsdp = unsafe { core::ptr::read_unaligned(data.as_ptr().cast::<Rsdp>()) };

    if &v1.signature != Rsdp::SIGNATURE {
        return Err(AcpiError::InvalidTable);
    }
    if !validate_checksum(&data[..Rsdp::SIZE]) {
        return Err(AcpiError::InvalidTable);
    }

    if v1.revision < 2 {
        return Ok(TableDirectory {
            address: v1.rsdt_address as u64,
            is_xsdt: false,
        });
    }

    // ACPI 2.0+: the extended structure must also checksum to zero.
    if data.len() < Rsdp2::SIZE {
        return Err(AcpiError::InvalidTable);
    }
    if !validate_checksum(&data[..Rsdp2::SIZE]) {
        return Err(AcpiError::InvalidTable);
    }
    // SAFETY: The slice holds at least 36 bytes of plain-old-data.
    let v2: Rsdp2 = unsafe { core::ptr::read_unaligned(data.as_ptr().cast::<Rsdp2>()) };
    Ok(TableDirectory {
        address: v2.xsdt_address,
        is_xsdt: true,
    })
}
