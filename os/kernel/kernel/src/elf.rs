//! # ELF32 executables
//!
//! Header parsing and validation for flat, statically linked i386
//! executables. Loading into an address space lives in [`loader`].

pub mod helpers;
pub mod loader;

pub use loader::{load, relocate};

use crate::elf::helpers::{le16, le32};
use bitfield_struct::bitfield;
use kernel_alloc::vmm::VmmError;
use kernel_memory_addresses::VirtualAddress;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElfError {
    #[error("executable not found or not a regular file")]
    Fs,
    #[error("executable exceeds the staging window")]
    TooLarge,
    #[error("file too short for an ELF header")]
    TooShort,
    #[error("bad ELF magic")]
    BadMagic,
    #[error("not a 32-bit executable")]
    BadClass,
    #[error("not a little-endian executable")]
    BadEndianness,
    #[error("not an x86 executable")]
    BadMachine,
    #[error("wrong ELF version")]
    BadVersion,
    #[error("malformed program header table")]
    BadProgramHeaders,
    #[error("segment outside of user space")]
    SegmentOutOfRange,
    #[error("no loadable segment")]
    NoLoadableSegment,
    #[error("mapping failed: {0}")]
    Mapping(#[from] VmmError),
}

const ELF_MAGIC: &[u8; 4] = b"\x7FELF";
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EM_386: u16 = 3;
const EV_CURRENT: u32 = 1;
pub const PT_LOAD: u32 = 1;

/// `Elf32_Ehdr`, minus the identification bytes already checked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(clippy::struct_field_names)]
pub struct Elf32Header {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: VirtualAddress,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

impl Elf32Header {
    /// Encoded size of the header.
    pub const SIZE: usize = 52;

    /// Decode and validate the header at the start of `bytes`.
    ///
    /// # Errors
    /// The first identification or header field that does not describe a
    /// 32-bit little-endian i386 executable.
    pub fn parse(bytes: &[u8]) -> Result<Self, ElfError> {
        if bytes.len() < Self::SIZE {
            return Err(ElfError::TooShort);
        }

        if &bytes[0..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }

        if bytes[4] != ELFCLASS32 {
            return Err(ElfError::BadClass);
        }

        if bytes[5] != ELFDATA2LSB {
            return Err(ElfError::BadEndianness);
        }

        let eh = Self {
            e_type: le16(&bytes[16..18]),
            e_machine: le16(&bytes[18..20]),
            e_version: le32(&bytes[20..24]),
            e_entry: VirtualAddress::new(le32(&bytes[24..28])),
            e_phoff: le32(&bytes[28..32]),
            e_shoff: le32(&bytes[32..36]),
            e_flags: le32(&bytes[36..40]),
            e_ehsize: le16(&bytes[40..42]),
            e_phentsize: le16(&bytes[42..44]),
            e_phnum: le16(&bytes[44..46]),
        };

        if eh.e_machine != EM_386 {
            return Err(ElfError::BadMachine);
        }

        if eh.e_version != EV_CURRENT {
            return Err(ElfError::BadVersion);
        }

        Ok(eh)
    }

    /// Offset and entry count of the program header table, checked against
    /// a file of `file_len` bytes.
    ///
    /// # Errors
    /// [`ElfError::BadProgramHeaders`] for a wrong entry size or a table that
    /// does not fit the file.
    pub fn program_table(&self, file_len: u32) -> Result<(u32, u32), ElfError> {
        let count = u32::from(self.e_phnum);
        if count == 0 {
            return Ok((self.e_phoff, 0));
        }

        if usize::from(self.e_phentsize) != ProgramHeader::SIZE {
            return Err(ElfError::BadProgramHeaders);
        }

        let end = count
            .checked_mul(u32::from(self.e_phentsize))
            .and_then(|len| len.checked_add(self.e_phoff))
            .ok_or(ElfError::BadProgramHeaders)?;
        if end > file_len {
            return Err(ElfError::BadProgramHeaders);
        }

        Ok((self.e_phoff, count))
    }
}

/// Whether `header` starts a loadable executable.
#[must_use]
pub fn validate(header: &[u8]) -> bool {
    match Elf32Header::parse(header) {
        Ok(_) => true,
        Err(e) => {
            log::debug!("rejected executable: {e}");
            false
        }
    }
}

/// `Elf32_Phdr.p_flags`: bit0=X, bit1=W, bit2=R.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct SegmentFlags {
    pub execute: bool,
    pub write: bool,
    pub read: bool,
    #[bits(29)]
    __: u32,
}

/// `Elf32_Phdr`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(clippy::struct_field_names)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: VirtualAddress,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: SegmentFlags,
    pub p_align: u32,
}

impl ProgramHeader {
    /// Encoded size of one table entry.
    pub const SIZE: usize = 32;

    #[must_use]
    pub fn parse(s: &[u8; Self::SIZE]) -> Self {
        Self {
            p_type: le32(&s[0..4]),
            p_offset: le32(&s[4..8]),
            p_vaddr: VirtualAddress::new(le32(&s[8..12])),
            p_filesz: le32(&s[16..20]),
            p_memsz: le32(&s[20..24]),
            p_flags: SegmentFlags::from_bits(le32(&s[24..28])),
            p_align: le32(&s[28..32]),
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_load(&self) -> bool {
        self.p_type == PT_LOAD && self.p_memsz != 0
    }
}
