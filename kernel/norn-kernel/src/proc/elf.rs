//! Loadable-segment extraction from ELF64 executables.
//!
//! Process creation only needs the entry point and the sequence of
//! `PT_LOAD` segments with their `(vaddr, filesz, memsz, r/w/x)`
//! attributes; everything else in the file is ignored.

use norn_core::addr::VirtAddr;
use norn_mm::vma::VmFlags;
use norn_noalloc::vec::ArrayVec;

/// Maximum loadable segments per executable.
pub const MAX_SEGMENTS: usize = 16;

/// ELF parse failure. Fatal for the process creation that hit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidElf;

impl core::fmt::Display for InvalidElf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "invalid ELF image")
    }
}

/// One loadable segment.
#[derive(Debug, Clone, Copy)]
pub struct ExecSegment {
    /// Destination virtual address.
    pub vaddr: VirtAddr,
    /// Offset of the segment bytes within the file image.
    pub offset: u64,
    /// Bytes present in the file.
    pub filesz: u64,
    /// Bytes occupied in memory (`>= filesz`; the rest is zero-filled).
    pub memsz: u64,
    /// Protection flags.
    pub flags: VmFlags,
}

/// The load view of an executable.
pub struct LoadedImage {
    /// Program entry point.
    pub entry: VirtAddr,
    /// Loadable segments in file order.
    pub segments: ArrayVec<ExecSegment, MAX_SEGMENTS>,
}

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 0x3E;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

fn read_u16(data: &[u8], off: usize) -> Result<u16, InvalidElf> {
    Ok(u16::from_le_bytes(
        data.get(off..off + 2).ok_or(InvalidElf)?.try_into().unwrap(),
    ))
}

fn read_u32(data: &[u8], off: usize) -> Result<u32, InvalidElf> {
    Ok(u32::from_le_bytes(
        data.get(off..off + 4).ok_or(InvalidElf)?.try_into().unwrap(),
    ))
}

fn read_u64(data: &[u8], off: usize) -> Result<u64, InvalidElf> {
    Ok(u64::from_le_bytes(
        data.get(off..off + 8).ok_or(InvalidElf)?.try_into().unwrap(),
    ))
}

/// Parses an ELF64 executable into its load view.
pub fn parse(data: &[u8]) -> Result<LoadedImage, InvalidElf> {
    if data.len() < EHDR_SIZE || &data[0..4] != b"\x7fELF" {
        return Err(InvalidElf);
    }
    // 64-bit, little-endian, current version.
    if data[4] != 2 || data[5] != 1 || data[6] != 1 {
        return Err(InvalidElf);
    }
    if read_u16(data, 16)? != ET_EXEC || read_u16(data, 18)? != EM_X86_64 {
        return Err(InvalidElf);
    }

    let entry = read_u64(data, 24)?;
    let phoff = read_u64(data, 32)? as usize;
    let phentsize = read_u16(data, 54)? as usize;
    let phnum = read_u16(data, 56)? as usize;
    if phentsize < PHDR_SIZE {
        return Err(InvalidElf);
    }

    let mut segments = ArrayVec::new();
    for i in 0..phnum {
        let ph = phoff + i * phentsize;
        if read_u32(data, ph)? != PT_LOAD {
            continue;
        }
        let p_flags = read_u32(data, ph + 4)?;
        let offset = read_u64(data, ph + 8)?;
        let vaddr = read_u64(data, ph + 16)?;
        let filesz = read_u64(data, ph + 32)?;
        let memsz = read_u64(data, ph + 40)?;

        if memsz < filesz {
            return Err(InvalidElf);
        }
        if offset.checked_add(filesz).is_none_or(|end| end > data.len() as u64) {
            return Err(InvalidElf);
        }

        let mut flags = VmFlags::empty();
        if p_flags & PF_R != 0 {
            flags |= VmFlags::READ;
        }
        if p_flags & PF_W != 0 {
            flags |= VmFlags::WRITE;
        }
        if p_flags & PF_X != 0 {
            flags |= VmFlags::EXEC;
        }

        segments
            .try_push(ExecSegment {
                vaddr: VirtAddr::new(vaddr),
                offset,
                filesz,
                memsz,
                flags,
            })
            .map_err(|_| InvalidElf)?;
    }

    if segments.is_empty() {
        return Err(InvalidElf);
    }
    Ok(LoadedImage {
        entry: VirtAddr::new(entry),
        segments,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a minimal ELF64 executable image for tests.
    pub(crate) fn build_elf(entry: u64, segments: &[(u64, u32, &[u8], u64)]) -> Vec<u8> {
        // (vaddr, p_flags, file bytes, memsz)
        let phoff = EHDR_SIZE;
        let data_off = phoff + segments.len() * PHDR_SIZE;
        let mut image = vec![0u8; data_off];

        image[0..4].copy_from_slice(b"\x7fELF");
        image[4] = 2; // 64-bit
        image[5] = 1; // little-endian
        image[6] = 1; // current version
        image[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        image[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        image[24..32].copy_from_slice(&entry.to_le_bytes());
        image[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
        image[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        image[56..58].copy_from_slice(&(segments.len() as u16).to_le_bytes());

        let mut cursor = data_off as u64;
        for (i, (vaddr, flags, bytes, memsz)) in segments.iter().enumerate() {
            let ph = phoff + i * PHDR_SIZE;
            image[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
            image[ph + 4..ph + 8].copy_from_slice(&flags.to_le_bytes());
            image[ph + 8..ph + 16].copy_from_slice(&cursor.to_le_bytes());
            image[ph + 16..ph + 24].copy_from_slice(&vaddr.to_le_bytes());
            image[ph + 32..ph + 40].copy_from_slice(&(bytes.len() as u64).to_le_bytes());
            image[ph + 40..ph + 48].copy_from_slice(&memsz.to_le_bytes());
            cursor += bytes.len() as u64;
        }
        for (_, _, bytes, _) in segments {
            image.extend_from_slice(bytes);
        }
        image
    }

    #[test]
    fn parse_minimal_executable() {
        let code = [0x90u8; 32]; // nops
        let image = build_elf(0x40_1000, &[(0x40_0000, PF_R | PF_X, &code, 32)]);
        let loaded = parse(&image).unwrap();
        assert_eq!(loaded.entry.as_u64(), 0x40_1000);
        assert_eq!(loaded.segments.len(), 1);
        let seg = &loaded.segments[0];
        assert_eq!(seg.vaddr.as_u64(), 0x40_0000);
        assert_eq!(seg.filesz, 32);
        assert_eq!(seg.memsz, 32);
        assert_eq!(seg.flags, VmFlags::READ | VmFlags::EXEC);
    }

    #[test]
    fn bss_segment_has_memsz_beyond_filesz() {
        let data = [1u8, 2, 3, 4];
        let image = build_elf(0x40_0000, &[(0x60_0000, PF_R | PF_W, &data, 0x2000)]);
        let loaded = parse(&image).unwrap();
        let seg = &loaded.segments[0];
        assert_eq!(seg.filesz, 4);
        assert_eq!(seg.memsz, 0x2000);
        assert_eq!(seg.flags, VmFlags::READ | VmFlags::WRITE);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut image = build_elf(0, &[(0, PF_R, &[0u8; 4], 4)]);
        image[0] = b'X';
        assert!(matches!(parse(&image), Err(InvalidElf)));
    }

    #[test]
    fn wrong_class_rejected() {
        let mut image = build_elf(0, &[(0, PF_R, &[0u8; 4], 4)]);
        image[4] = 1; // 32-bit
        assert!(matches!(parse(&image), Err(InvalidElf)));
    }

    #[test]
    fn truncated_image_rejected() {
        let image = build_elf(0, &[(0, PF_R, &[0u8; 64], 64)]);
        assert!(matches!(parse(&image[..image.len() - 32]), Err(InvalidElf)));
    }

    #[test]
    fn no_load_segments_rejected() {
        let image = build_elf(0x40_0000, &[(0, PF_R, &[], 0)]);
        // Rewrite the segment type to something other than PT_LOAD.
        let mut image = image;
        image[EHDR_SIZE..EHDR_SIZE + 4].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(parse(&image), Err(InvalidElf)));
    }

    #[test]
    fn memsz_below_filesz_rejected() {
        let data = [0u8; 16];
        let mut image = build_elf(0, &[(0x1000, PF_R, &data, 16)]);
        // Corrupt memsz to 8 < filesz 16.
        let ph = EHDR_SIZE;
        image[ph + 40..ph + 48].copy_from_slice(&8u64.to_le_bytes());
        assert!(matches!(parse(&image), Err(InvalidElf)));
    }
}
