//! # Address Space (IA-32, directory-rooted)
//!
//! Strongly-typed helpers to own and walk a **single** two-level virtual
//! address space.
//!
//! ## Highlights
//!
//! - [`AddressSpace`]: the owned handle to a page directory. Not `Clone`;
//!   dropping it without handing it back to the VMM leaks the directory.
//! - [`SpaceRef`]: a `Copy` token naming a directory, used to address the
//!   kernel's own space and borrowed process spaces alike.
//! - [`PageWalker`]: table-level operations (ensure table, set/clear leaf,
//!   leaf lookup) over one directory through a [`PhysMapper`].
//!
//! ## Design
//!
//! - Directory entries are created with the permission bits of the first leaf
//!   installed below them and widened by later, more permissive leaves.
//! - Keeps `unsafe` confined to mapping a physical frame to a typed table
//!   through the `PhysMapper`.
//!
//! ## Safety
//!
//! - Mutating active mappings requires **TLB maintenance** (`invlpg`); the
//!   walker never does this itself.

use crate::page_table::pd::{L2Index, PageDirectory, PdEntry};
use crate::page_table::pt::{PageTable, PtEntry};
use crate::page_table::split_indices;
use crate::{FrameAlloc, PageEntryBits, PhysMapperExt, VmemError};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// Owned handle to one page directory and the page tables it links.
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    directory: PhysicalPage<Size4K>,
}

/// Non-owning name of an address space.
///
/// A `SpaceRef` must not outlive the directory it names; using it after the
/// space was deleted walks a recycled frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SpaceRef(PhysicalPage<Size4K>);

impl AddressSpace {
    /// Take ownership of a directory frame.
    #[inline]
    #[must_use]
    pub const fn from_directory(directory: PhysicalPage<Size4K>) -> Self {
        Self { directory }
    }

    /// Give up the handle, returning the directory frame.
    #[inline]
    #[must_use]
    pub const fn into_directory(self) -> PhysicalPage<Size4K> {
        self.directory
    }

    #[inline]
    #[must_use]
    pub const fn directory(&self) -> PhysicalPage<Size4K> {
        self.directory
    }

    #[inline]
    #[must_use]
    pub const fn handle(&self) -> SpaceRef {
        SpaceRef(self.directory)
    }
}

impl SpaceRef {
    #[inline]
    #[must_use]
    pub const fn directory(self) -> PhysicalPage<Size4K> {
        self.0
    }
}

impl From<&AddressSpace> for SpaceRef {
    #[inline]
    fn from(value: &AddressSpace) -> Self {
        value.handle()
    }
}

/// Table-level view of one address space.
pub struct PageWalker<'m, M: PhysMapperExt> {
    directory: PhysicalPage<Size4K>,
    mapper: &'m M,
}

impl<'m, M: PhysMapperExt> PageWalker<'m, M> {
    #[inline]
    pub const fn new(mapper: &'m M, space: SpaceRef) -> Self {
        Self {
            directory: space.directory(),
            mapper,
        }
    }

    /// Borrow the [`PageDirectory`] as a typed table.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn pd_mut(&self) -> &mut PageDirectory {
        self.mapper.pd_mut(self.directory)
    }

    /// Borrow a [`PageTable`] in this frame.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn pt_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        self.mapper.pt_mut(page)
    }

    /// Directory entry at `index`.
    #[inline]
    #[must_use]
    pub fn directory_entry(&self, index: L2Index) -> PdEntry {
        self.pd_mut().get(index)
    }

    /// Make sure the page table covering `va` exists and allows `leaf`'s
    /// permissions, allocating it from `tables` if needed.
    ///
    /// # Errors
    /// [`VmemError::OutOfTables`] if a new table cannot be allocated.
    pub fn ensure_table<A: FrameAlloc>(
        &self,
        tables: &mut A,
        va: VirtualAddress,
        leaf: PageEntryBits,
    ) -> Result<PhysicalPage<Size4K>, VmemError> {
        let (i2, _) = split_indices(va);
        let pd = self.pd_mut();
        let e2 = pd.get(i2);
        if let Some((pt_page, _)) = e2.next_table() {
            pd.set(i2, e2.widened(leaf));
            return Ok(pt_page);
        }

        let pt_page = tables.alloc_4k().ok_or(VmemError::OutOfTables)?;
        self.pt_mut(pt_page).zero();
        let flags = PageEntryBits::new()
            .with_present(true)
            .with_writable(leaf.writable())
            .with_user_access(leaf.user_access());
        self.pd_mut().set(i2, PdEntry::make_next(pt_page, flags));
        log::trace!("new page table {pt_page} for {va}");
        Ok(pt_page)
    }

    /// Install `va → page` with `flags`, creating the covering table on demand.
    ///
    /// A present entry is only replaced if it is a shared kernel alias.
    ///
    /// # Errors
    /// - [`VmemError::OutOfTables`] if the page table cannot be allocated.
    /// - [`VmemError::AlreadyMapped`] if `va` already maps an owned frame.
    pub fn set_leaf<A: FrameAlloc>(
        &self,
        tables: &mut A,
        va: VirtualAddress,
        page: PhysicalPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<(), VmemError> {
        let pt_page = self.ensure_table(tables, va, flags)?;
        let (_, i1) = split_indices(va);
        let pt = self.pt_mut(pt_page);
        if let Some((_, old)) = pt.get(i1).page_4k()
            && !old.shared()
        {
            return Err(VmemError::AlreadyMapped);
        }
        pt.set(i1, PtEntry::make_4k(page, flags.with_shared(false)));
        Ok(())
    }

    /// Clear the leaf at `va`, returning what it mapped.
    pub fn clear_leaf(&self, va: VirtualAddress) -> Option<(PhysicalPage<Size4K>, PageEntryBits)> {
        let (i2, i1) = split_indices(va);
        let (pt_page, _) = self.pd_mut().get(i2).next_table()?;
        let pt = self.pt_mut(pt_page);
        let old = pt.get(i1).page_4k()?;
        pt.set(i1, PtEntry::zero());
        Some(old)
    }

    /// The leaf mapping `va`, if any.
    #[must_use]
    pub fn leaf(&self, va: VirtualAddress) -> Option<(PhysicalPage<Size4K>, PageEntryBits)> {
        let (i2, i1) = split_indices(va);
        let (pt_page, _) = self.pd_mut().get(i2).next_table()?;
        self.pt_mut(pt_page).get(i1).page_4k()
    }
}
