use crate::elf::{ElfError, ProgramHeader};
use kernel_info::memory::{PAGE_SIZE, USER_SPACE_END};
use kernel_memory_addresses::{align_down, align_up};
use core::ops::Range;

#[inline]
pub fn le16(x: &[u8]) -> u16 {
    u16::from_le_bytes([x[0], x[1]])
}

#[inline]
pub fn le32(x: &[u8]) -> u32 {
    u32::from_le_bytes([x[0], x[1], x[2], x[3]])
}

/// Virtual range `[p_vaddr, p_vaddr + p_memsz)` of a loadable segment,
/// checked against user space and against a file of `file_len` bytes.
///
/// # Errors
/// - [`ElfError::SegmentOutOfRange`] if the range overflows or leaves user space.
/// - [`ElfError::BadProgramHeaders`] if the file-backed part is larger than the
///   segment or not inside the file.
pub fn segment_range(ph: &ProgramHeader, file_len: u32) -> Result<Range<u32>, ElfError> {
    let start = ph.p_vaddr.as_u32();
    let end = start
        .checked_add(ph.p_memsz)
        .ok_or(ElfError::SegmentOutOfRange)?;
    if end > USER_SPACE_END {
        return Err(ElfError::SegmentOutOfRange);
    }

    let file_end = ph
        .p_offset
        .checked_add(ph.p_filesz)
        .ok_or(ElfError::BadProgramHeaders)?;
    if ph.p_filesz > ph.p_memsz || file_end > file_len {
        return Err(ElfError::BadProgramHeaders);
    }

    Ok(start..end)
}

/// Page bases covering `range`.
pub fn covering_pages(range: Range<u32>) -> impl Iterator<Item = u32> {
    let first = align_down(range.start, PAGE_SIZE);
    // `range.end` is bounded by user space, so rounding up cannot overflow.
    let last = align_up(range.end, PAGE_SIZE).unwrap_or(USER_SPACE_END);
    (first..last).step_by(PAGE_SIZE as usize)
}

/// The part of page `page` that `range` covers.
pub fn clip_to_page(range: &Range<u32>, page: u32) -> Range<u32> {
    range.start.max(page)..range.end.min(page + PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::SegmentFlags;
    use kernel_memory_addresses::VirtualAddress;

    fn ph(vaddr: u32, filesz: u32, memsz: u32) -> ProgramHeader {
        ProgramHeader {
            p_type: crate::elf::PT_LOAD,
            p_offset: 0x100,
            p_vaddr: VirtualAddress::new(vaddr),
            p_filesz: filesz,
            p_memsz: memsz,
            p_flags: SegmentFlags::new().with_read(true),
            p_align: PAGE_SIZE,
        }
    }

    #[test]
    fn segment_range_checks_bounds() {
        assert_eq!(segment_range(&ph(0x1000, 0x10, 0x20), 0x200), Ok(0x1000..0x1020));
        assert_eq!(
            segment_range(&ph(0xFFFF_F000, 0, 0x2000), 0x200),
            Err(ElfError::SegmentOutOfRange)
        );
        assert_eq!(
            segment_range(&ph(USER_SPACE_END - 0x10, 0, 0x20), 0x200),
            Err(ElfError::SegmentOutOfRange)
        );
        assert_eq!(
            segment_range(&ph(0x1000, 0x30, 0x20), 0x200),
            Err(ElfError::BadProgramHeaders)
        );
        assert_eq!(
            segment_range(&ph(0x1000, 0x200, 0x200), 0x200),
            Err(ElfError::BadProgramHeaders)
        );
    }

    #[test]
    fn covering_pages_round_outwards() {
        let pages: Vec<u32> = covering_pages(0x1FF0..0x3001).collect();
        assert_eq!(pages, [0x1000, 0x2000, 0x3000]);
        assert_eq!(clip_to_page(&(0x1FF0..0x3001), 0x1000), 0x1FF0..0x2000);
        assert_eq!(clip_to_page(&(0x1FF0..0x3001), 0x3000), 0x3000..0x3001);
    }
}
