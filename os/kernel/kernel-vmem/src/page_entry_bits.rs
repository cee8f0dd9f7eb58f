use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// Represents a single 32-bit x86 page-directory or page-table entry in its
/// raw bitfield form (classic two-level paging, no PAE).
///
/// Directory entries (PDE) and table entries (PTE) share the same layout; the
/// few bits that only make sense for leaves (`dirty`, `global_translation`)
/// are ignored by the CPU in directory entries.
///
/// ### Bit layout
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS`              | 4 MiB page (PDE only, requires PSE) |
/// | 8         | `G`               | Global (leaf only) |
/// | 9         | `shared` (OS)     | Frame is owned by the kernel, not by this address space |
/// | 10–11     | OS avail          | Reserved for OS use |
/// | 12–31     | `frame`           | Physical frame bits [31:12] |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let mut e = PageEntryBits::user_rw();
/// e.set_physical_address(PhysicalAddress::new(0x0080_1000));
/// assert!(e.present() && e.user_access());
/// assert_eq!(e.into_bits(), 0x0080_1007);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// For a directory entry this caps the rights of every page below it, so
    /// directory flags are widened whenever a more permissive leaf is installed.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    ///
    /// Set to allow ring 3 access; like `writable`, it must be set on both the
    /// directory entry and the table entry.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6) — **leaf only**. Set by the CPU on first write.
    pub dirty: bool,

    /// Page Size (PS, bit 7). Always clear in this kernel.
    pub large_page: bool,

    /// Global (G, bit 8) — **leaf only**.
    pub global_translation: bool,

    /// OS-defined (bit 9): the mapped frame is a kernel alias cloned from the
    /// master directory. Unmapping or tearing down the address space never
    /// returns such a frame to the allocator.
    pub shared: bool,

    /// OS-available (bits 10..=11).
    #[bits(2)]
    pub os_available: u8,

    /// Physical frame bits [31:12].
    #[bits(20)]
    frame_bits_31_12: u32,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_frame_bits_31_12(phys.as_u32() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_bits_31_12() << 12)
    }

    /// Present, writable, supervisor only.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Present, read-only, user accessible.
    #[inline]
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::new().with_present(true).with_user_access(true)
    }

    /// Present, writable, user accessible.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
    }

    /// Only the permission bits (`writable`, `user_access`) of `self`.
    #[inline]
    #[must_use]
    pub const fn permissions(self) -> Self {
        Self::new()
            .with_writable(self.writable())
            .with_user_access(self.user_access())
    }
}
