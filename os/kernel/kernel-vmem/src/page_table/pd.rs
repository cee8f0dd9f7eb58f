use crate::PageEntryBits;
use kernel_info::memory::ENTRIES_PER_TABLE;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// PD index (bits 31..22)
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L2Index(u16);

/// Points to a page table.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// The page directory: root of a 32-bit address space, referenced by CR3.
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES_PER_TABLE],
}

impl L2Index {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new((va.as_u32() >> 22) as u16)
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

    /// First virtual address covered by this directory slot.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u32) << 22)
    }

    /// All directory indices in ascending order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..ENTRIES_PER_TABLE as u16).map(Self::new)
    }
}

impl PdEntry {
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

    /// The page table this entry links to, if present.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<(PhysicalPage<Size4K>, PageEntryBits)> {
        if !self.is_present() {
            return None;
        }
        Some((PhysicalPage::from_addr(self.0.physical_address()), self.0))
    }

    #[inline]
    #[must_use]
    pub const fn make_next(pt_page: PhysicalPage<Size4K>, mut flags: PageEntryBits) -> Self {
        flags.set_large_page(false);
        flags.set_present(true);
        flags.set_physical_address(pt_page.base());
        Self(flags)
    }

    /// The same entry with `writable`/`user_access` raised to include `leaf`.
    #[inline]
    #[must_use]
    pub const fn widened(self, leaf: PageEntryBits) -> Self {
        let mut flags = self.0;
        flags.set_writable(flags.writable() || leaf.writable());
        flags.set_user_access(flags.user_access() || leaf.user_access());
        Self(flags)
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

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PdEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: L2Index) -> PdEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: L2Index, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    #[must_use]
    pub const fn index_of(va: VirtualAddress) -> L2Index {
        L2Index::from(va)
    }
}
