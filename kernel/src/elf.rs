//! ELF64 image loading.
//!
//! Only 64-bit little-endian class-2 images for x86-64 are accepted.
//! Each `PT_LOAD` segment is rounded outward to 4 KiB and described as a
//! [`LoadSegment`] whose page flags derive from the segment's `p_flags`;
//! process creation maps the segments into the user half and copies the
//! file bytes through the direct map.

use alloc::vec::Vec;

use crate::error::{OsResult, OsStatus};
use crate::mm::{PageFlags, VirtualAddress, PAGE_SIZE};

const MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const CLASS_64: u8 = 2;
const DATA_LITTLE_ENDIAN: u8 = 1;
const VERSION_CURRENT: u8 = 1;
const MACHINE_X86_64: u16 = 62;

const TYPE_EXEC: u16 = 2;
const TYPE_DYN: u16 = 3;

const PT_LOAD: u32 = 1;

const FLAG_EXECUTE: u32 = 1 << 0;
const FLAG_WRITE: u32 = 1 << 1;
const FLAG_READ: u32 = 1 << 2;

fn read_u16(bytes: &[u8], offset: usize) -> OsResult<u16> {
    let slice = bytes
        .get(offset..offset + 2)
        .ok_or(OsStatus::InvalidData)?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

fn read_u32(bytes: &[u8], offset: usize) -> OsResult<u32> {
    let slice = bytes
        .get(offset..offset + 4)
        .ok_or(OsStatus::InvalidData)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_u64(bytes: &[u8], offset: usize) -> OsResult<u64> {
    let slice = bytes
        .get(offset..offset + 8)
        .ok_or(OsStatus::InvalidData)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(slice);
    Ok(u64::from_le_bytes(raw))
}

/// One loadable segment, already rounded to page boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    /// Page-aligned base of the mapping.
    pub vaddr: VirtualAddress,
    /// Page-rounded size of the mapping.
    pub size: usize,
    /// Rights derived from `p_flags`.
    pub flags: PageFlags,
    /// Unaligned virtual address the file bytes land at.
    pub file_vaddr: VirtualAddress,
    /// Offset of the segment bytes within the image.
    pub file_offset: usize,
    /// Number of file bytes; the remainder up to `mem_size` is zeroed.
    pub file_size: usize,
    /// In-memory size before rounding.
    pub mem_size: usize,
}

/// A validated ELF image over a borrowed byte slice.
pub struct ElfImage<'a> {
    bytes: &'a [u8],
    entry: VirtualAddress,
    ph_offset: usize,
    ph_count: usize,
    ph_entry_size: usize,
}

impl<'a> core::fmt::Debug for ElfImage<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ElfImage")
            .field("entry", &self.entry)
            .field("ph_offset", &self.ph_offset)
            .field("ph_count", &self.ph_count)
            .field("ph_entry_size", &self.ph_entry_size)
            .finish_non_exhaustive()
    }
}

impl<'a> ElfImage<'a> {
    /// Validate the identification and header fields.
    pub fn parse(bytes: &'a [u8]) -> OsResult<ElfImage<'a>> {
        if bytes.len() < 64 {
            return Err(OsStatus::InvalidData);
        }
        if bytes[0..4] != MAGIC {
            return Err(OsStatus::InvalidData);
        }
        if bytes[4] != CLASS_64 || bytes[5] != DATA_LITTLE_ENDIAN {
            return Err(OsStatus::InvalidVersion);
        }
        if bytes[6] != VERSION_CURRENT {
            return Err(OsStatus::InvalidVersion);
        }

        let elf_type = read_u16(bytes, 16)?;
        if elf_type != TYPE_EXEC && elf_type != TYPE_DYN {
            return Err(OsStatus::InvalidType);
        }
        if read_u16(bytes, 18)? != MACHINE_X86_64 {
            return Err(OsStatus::NotSupported);
        }

        let image = ElfImage {
            bytes,
            entry: VirtualAddress::new(read_u64(bytes, 24)?),
            ph_offset: read_u64(bytes, 32)? as usize,
            ph_count: read_u16(bytes, 56)? as usize,
            ph_entry_size: read_u16(bytes, 54)? as usize,
        };

        if image.ph_entry_size < 56 {
            return Err(OsStatus::InvalidData);
        }
        image
            .ph_offset
            .checked_add(image.ph_count * image.ph_entry_size)
            .filter(|&end| end <= bytes.len())
            .ok_or(OsStatus::InvalidData)?;

        Ok(image)
    }

    /// The program entry point.
    pub fn entry(&self) -> VirtualAddress {
        self.entry
    }

    /// Collect the `PT_LOAD` segments, rounded to 4 KiB mappings.
    pub fn load_segments(&self) -> OsResult<Vec<LoadSegment>> {
        let mut segments = Vec::new();

        for index in 0..self.ph_count {
            let base = self.ph_offset + index * self.ph_entry_size;

            if read_u32(self.bytes, base)? != PT_LOAD {
                continue;
            }

            let p_flags = read_u32(self.bytes, base + 4)?;
            let offset = read_u64(self.bytes, base + 8)? as usize;
            let vaddr = read_u64(self.bytes, base + 16)?;
            let file_size = read_u64(self.bytes, base + 32)? as usize;
            let mem_size = read_u64(self.bytes, base + 40)? as usize;

            if file_size > mem_size {
                return Err(OsStatus::InvalidData);
            }
            offset
                .checked_add(file_size)
                .filter(|&end| end <= self.bytes.len())
                .ok_or(OsStatus::InvalidData)?;

            let front = vaddr / PAGE_SIZE as u64 * PAGE_SIZE as u64;
            let back = (vaddr + mem_size as u64).next_multiple_of(PAGE_SIZE as u64);

            let mut flags = PageFlags::PRESENT | PageFlags::USER;
            if p_flags & FLAG_WRITE != 0 {
                flags |= PageFlags::WRITABLE;
            }
            if p_flags & FLAG_EXECUTE != 0 {
                flags |= PageFlags::EXECUTABLE;
            }
            if p_flags & FLAG_READ == 0 && p_flags & (FLAG_WRITE | FLAG_EXECUTE) == 0 {
                // Unreadable, unwritable, unexecutable load segments are
                // malformed.
                return Err(OsStatus::InvalidData);
            }

            segments.push(LoadSegment {
                vaddr: VirtualAddress::new(front),
                size: (back - front) as usize,
                flags,
                file_vaddr: VirtualAddress::new(vaddr),
                file_offset: offset,
                file_size,
                mem_size,
            });
        }

        if segments.is_empty() {
            return Err(OsStatus::InvalidData);
        }
        Ok(segments)
    }

    /// Bytes of a segment's file image.
    pub fn segment_bytes(&self, segment: &LoadSegment) -> &'a [u8] {
        &self.bytes[segment.file_offset..segment.file_offset + segment.file_size]
    }
}
