//! System Description Table (SDT) header and checksum utilities.

use crate::AcpiError;

/// Standard ACPI System Description Table header.
///
/// This 36-byte header is present at the start of every ACPI table
/// (RSDT, XSDT, MADT, FADT, ...).
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C, packed)]
pub struct SdtHeader {
    /// 4-byte ASCII signature identifying the table type.
    pub signature: [u8; 4],
    /// Total length of the table, including the header, in bytes.
    pub length: u32,
    /// Revision of the table structure.
    pub revision: u8,
    /// Checksum byte. The entire table must sum to zero.
    pub checksum: u8,
    /// OEM-supplied identification string.
    pub oem_id: [u8; 6],
    /// OEM-supplied table identification string.
    pub oem_table_id: [u8; 8],
    /// OEM-supplied revision number.
    pub oem_revision: u32,
    /// Vendor ID of the utility that created the table.
    pub creator_id: u32,
    /// Revision of the utility that created the table.
    pub creator_revision: u32,
}

impl SdtHeader {
    /// The size of an SDT header in bytes.
    pub const SIZE: usize = 36;

    /// Reads an `SdtHeader` from a byte slice.
    ///
    /// Returns `None` if the slice is shorter than [`SdtHeader::SIZE`].
    #[must_use]
    pub fn read_from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        // SAFETY: The slice holds at least SIZE bytes and the struct is
        // packed, so an unaligned read of plain-old-data is valid.
        Some(unsafe { core::ptr::read_unaligned(data.as_ptr().cast::<Self>()) })
    }

    /// Returns the total length of this table (header included).
    #[must_use]
    pub fn length(&self) -> u32 {
        self.length
    }
}

/// Validates the checksum of a byte slice.
///
/// ACPI tables are laid out so that all bytes sum to zero (mod 256).
#[must_use]
pub fn validate_checksum(data: &[u8]) -> bool {
    let mut sum: u8 = 0;
    for &byte in data {
        sum = sum.wrapping_add(byte);
    }
    sum == 0
}

/// Validates a full table: header readable, expected signature, in-bounds
/// length, zero checksum over the whole table.
pub fn validate_table(data: &[u8], signature: &[u8; 4]) -> Result<SdtHeader, AcpiError> {
    let header = SdtHeader::read_from_bytes(data).ok_or(AcpiError::InvalidTable)?;
    if &header.signature != signature {
        return Err(AcpiError::InvalidTable);
    }
    let length = header.length() as usize;
    if length < SdtHeader::SIZE || length > data.len() {
        return Err(AcpiError::InvalidTable);
    }
    if !validate_checksum(&data[..length]) {
        return Err(AcpiError::InvalidTable);
    }
    Ok(header)
}
