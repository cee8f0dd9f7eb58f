use crate::PageEntryBits;
use kernel_info::memory::ENTRIES_PER_TABLE;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// PT index (bits 21..12)
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L1Index(u16);

/// 4KiB leaf.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PtEntry(PageEntryBits);

#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; ENTRIES_PER_TABLE],
}

impl L1Index {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u32() >> 12) & 0x3FF) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES_PER_TABLE);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Offset of this slot's page from the start of its table's range.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u32 {
        (self.0 as u32) << 12
    }

    pub fn all() -> impl Iterator<Item = Self> {
        (0..ENTRIES_PER_TABLE as u16).map(Self::new)
    }
}

impl PtEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn page_4k(self) -> Option<(PhysicalPage<Size4K>, PageEntryBits)> {
        if !self.is_present() {
            return None;
        }
        debug_assert!(!self.0.large_page(), "PTE must have PS=0");
        Some((PhysicalPage::from_addr(self.0.physical_address()), self.0))
    }

    #[inline]
    #[must_use]
    pub const fn make_4k(page: PhysicalPage<Size4K>, mut flags: PageEntryBits) -> Self {
        flags.set_large_page(false);
        flags.set_present(true);
        flags.set_physical_address(page.base());
        Self(flags)
    }

    /// Mark the entry as a kernel-owned alias.
    #[inline]
    #[must_use]
    pub const fn into_shared(self) -> Self {
        Self(self.0.with_shared(true))
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        Self(PageEntryBits::from_bits(v))
    }
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::zero(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PtEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: L1Index) -> PtEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: L1Index, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    #[must_use]
    pub const fn index_of(va: VirtualAddress) -> L1Index {
        L1Index::from(va)
    }
}
