//! Virtual Memory Manager (VMM) for the kernel.
//!
//! Owns the kernel's master address space, the two frame pools and the MMU,
//! and builds per-process address spaces from them.
//!
//! Every process directory is created by cloning the present tables of the
//! master directory; the cloned leaf entries are tagged `shared`, so their
//! frames (identity map, return trampoline, kernel stacks) are never freed
//! through a process space.
//!
//! # Example
//! ```rust,ignore
//! use kernel_alloc::{frame_alloc::BitmapFrameAlloc, phys_mapper::HostRam, vmm::Vmm};
//! use kernel_memory_addresses::VirtualAddress;
//! use kernel_vmem::PageEntryBits;
//! let mut vmm = Vmm::init(
//!     HostRam::new(),
//!     BitmapFrameAlloc::frame_pool(),
//!     BitmapFrameAlloc::page_table_pool(),
//!     NoMmu,
//! );
//! let space = vmm.create_address_space().unwrap();
//! let va = VirtualAddress::new(0x0080_0000);
//! let frame = vmm.map(space.handle(), va, PageEntryBits::user_rw()).unwrap();
//! assert_eq!(vmm.translate(space.handle(), va), Some(frame));
//! vmm.delete_address_space(space);
//! ```

use kernel_info::memory::{
    IDENTITY_MAP_END, KERNEL_PRIVATE_END, KERNEL_PRIVATE_START, PAGE_SIZE, RETURN_ADDR, STAGING_PAGE,
};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{
    AddressSpace, FrameAlloc, FrameBytes, L1Index, L2Index, Mmu, PageEntryBits, PageWalker,
    PdEntry, PhysMapper, PhysMapperExt, PtEntry, SpaceRef, VmemError,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("out of page tables")]
    OutOfTables,
    #[error("virtual address already mapped")]
    AlreadyMapped,
    #[error("access to unmapped memory")]
    Unmapped,
    #[error("invalid range")]
    InvalidRange,
}

impl From<VmemError> for VmmError {
    fn from(value: VmemError) -> Self {
        match value {
            VmemError::OutOfTables => Self::OutOfTables,
            VmemError::AlreadyMapped => Self::AlreadyMapped,
        }
    }
}

/// Kernel virtual memory manager.
pub struct Vmm<M: PhysMapper, A: FrameAlloc, U: Mmu> {
    mapper: M,
    frames: A,
    tables: A,
    mmu: U,
    kernel: AddressSpace,
    active: SpaceRef,
}

impl<M: PhysMapper, A: FrameAlloc, U: Mmu> Vmm<M, A, U> {
    /// Build the master directory and turn paging on.
    ///
    /// # Panics
    /// If the kernel cannot be mapped; there is no recovery from an
    /// unpageable kernel.
    pub fn init(mapper: M, frames: A, tables: A, mmu: U) -> Self {
        match Self::try_init(mapper, frames, tables, mmu) {
            Ok(vmm) => vmm,
            Err(e) => {
                log::error!("VMM: failed to map the kernel: {e}");
                panic!("cannot page the kernel: {e}");
            }
        }
    }

    /// Fallible form of [`init`](Self::init): identity-map the first 4 MiB
    /// (supervisor, read-write), map the return trampoline user-accessible,
    /// load the master directory and enable paging.
    ///
    /// # Errors
    /// [`VmmError::OutOfTables`] if the pool cannot hold the kernel's tables.
    pub fn try_init(mapper: M, frames: A, mut tables: A, mut mmu: U) -> Result<Self, VmmError> {
        let dir = tables.alloc_4k().ok_or(VmmError::OutOfTables)?;
        mapper.pd_mut(dir).zero();
        let kernel = AddressSpace::from_directory(dir);

        let walker = PageWalker::new(&mapper, kernel.handle());
        for frame in 0..IDENTITY_MAP_END / PAGE_SIZE {
            let page = PhysicalPage::<Size4K>::from_number(frame);
            let va = VirtualAddress::new(page.base().as_u32());
            walker.set_leaf(&mut tables, va, page, PageEntryBits::kernel_rw())?;
        }
        let trampoline = PhysicalPage::<Size4K>::from_number(RETURN_ADDR.as_u32() / PAGE_SIZE);
        walker.set_leaf(&mut tables, RETURN_ADDR, trampoline, PageEntryBits::user_rw())?;

        mmu.load_directory(dir);
        mmu.enable_paging();
        log::info!("VMM: paging enabled, master directory at {}", dir.base());

        let active = kernel.handle();
        Ok(Self {
            mapper,
            frames,
            tables,
            mmu,
            kernel,
            active,
        })
    }

    /// The kernel's master address space.
    #[inline]
    #[must_use]
    pub const fn kernel(&self) -> SpaceRef {
        self.kernel.handle()
    }

    /// The currently loaded address space.
    #[inline]
    #[must_use]
    pub const fn active(&self) -> SpaceRef {
        self.active
    }

    #[inline]
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.frames.free_frames()
    }

    #[inline]
    #[must_use]
    pub fn free_tables(&self) -> usize {
        self.tables.free_frames()
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    const fn walker(&self, space: SpaceRef) -> PageWalker<'_, M> {
        PageWalker::new(&self.mapper, space)
    }

    /// Clone the master directory into a fresh address space.
    ///
    /// Entries in the kernel-private window (kernel thread stacks, staging
    /// pages) are left out; their frames come and go with the kernel.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if a directory or table cannot be allocated;
    /// nothing built so far survives.
    pub fn create_address_space(&mut self) -> Result<AddressSpace, VmmError> {
        let dir = self.tables.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        self.mapper.pd_mut(dir).zero();
        let space = AddressSpace::from_directory(dir);

        let master = self.kernel.directory();
        for i2 in L2Index::all() {
            let Some((master_pt, flags)) = self.mapper.pd_mut(master).get(i2).next_table() else {
                continue;
            };
            let Some(pt) = self.tables.alloc_4k() else {
                log::warn!("VMM: out of page tables while cloning the kernel space");
                self.delete_address_space(space);
                return Err(VmmError::OutOfMemory);
            };

            let src = self.mapper.pt_mut(master_pt);
            let dst = self.mapper.pt_mut(pt);
            let base = i2.base().as_u32();
            for i1 in L1Index::all() {
                let e = src.get(i1);
                let va = base + i1.offset();
                let private = (KERNEL_PRIVATE_START..KERNEL_PRIVATE_END).contains(&va);
                dst.set(
                    i1,
                    if e.is_present() && !private {
                        e.into_shared()
                    } else {
                        PtEntry::zero()
                    },
                );
            }
            self.mapper.pd_mut(dir).set(i2, PdEntry::make_next(pt, flags));
        }

        log::debug!("VMM: created address space {}", dir.base());
        Ok(space)
    }

    /// Tear down `space`: free every owned frame, every page table and the
    /// directory. Switches to the kernel directory first if `space` is active.
    pub fn delete_address_space(&mut self, space: AddressSpace) {
        let handle = space.handle();
        if self.active == handle {
            self.activate_kernel();
        }

        let dir = space.into_directory();
        for i2 in L2Index::all() {
            let Some((pt_page, _)) = self.mapper.pd_mut(dir).get(i2).next_table() else {
                continue;
            };
            let pt = self.mapper.pt_mut(pt_page);
            for i1 in L1Index::all() {
                if let Some((page, flags)) = pt.get(i1).page_4k()
                    && !flags.shared()
                {
                    self.frames.free_4k(page);
                }
            }
            self.tables.free_4k(pt_page);
            self.mapper.pd_mut(dir).set(i2, PdEntry::zero());
            self.mmu.invalidate_page(i2.base().page());
        }
        self.tables.free_4k(dir);
        log::debug!("VMM: deleted address space {}", dir.base());
    }

    /// Allocate a frame and map it at `va`.
    ///
    /// # Errors
    /// - [`VmmError::OutOfMemory`] if no frame is available.
    /// - [`VmmError::OutOfTables`] / [`VmmError::AlreadyMapped`] from the
    ///   installation; the frame is returned to the pool.
    pub fn map(
        &mut self,
        space: SpaceRef,
        va: VirtualAddress,
        flags: PageEntryBits,
    ) -> Result<PhysicalPage<Size4K>, VmmError> {
        let frame = self.frames.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        if let Err(e) = self.map_phys(space, va, frame, flags) {
            self.frames.free_4k(frame);
            return Err(e);
        }
        Ok(frame)
    }

    /// Map a caller-supplied frame at `va`.
    ///
    /// # Errors
    /// [`VmmError::OutOfTables`] or [`VmmError::AlreadyMapped`].
    pub fn map_phys(
        &mut self,
        space: SpaceRef,
        va: VirtualAddress,
        page: PhysicalPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        let walker = PageWalker::new(&self.mapper, space);
        walker.set_leaf(&mut self.tables, va, page, flags)?;
        log::trace!("VMM: {va} -> {page}");
        self.flush(space, va);
        Ok(())
    }

    /// The frame `va` maps to.
    #[must_use]
    pub fn translate(&self, space: SpaceRef, va: VirtualAddress) -> Option<PhysicalPage<Size4K>> {
        self.walker(space).leaf(va).map(|(page, _)| page)
    }

    /// The leaf mapping `va`: frame and entry flags.
    #[must_use]
    pub fn entry(
        &self,
        space: SpaceRef,
        va: VirtualAddress,
    ) -> Option<(PhysicalPage<Size4K>, PageEntryBits)> {
        self.walker(space).leaf(va)
    }

    /// Unmap `va` and free its frame unless it is a shared kernel alias.
    /// Unmapped addresses are logged and ignored.
    pub fn unmap(&mut self, space: SpaceRef, va: VirtualAddress) {
        match self.walker(space).clear_leaf(va) {
            None => log::warn!("VMM: unmap of unmapped address {va}"),
            Some((page, flags)) => {
                if !flags.shared() {
                    self.frames.free_4k(page);
                }
                self.flush(space, va);
            }
        }
    }

    /// Clear the mapping at `va` without freeing its frame.
    pub fn unmap_phys(&mut self, space: SpaceRef, va: VirtualAddress) {
        if self.walker(space).clear_leaf(va).is_some() {
            self.flush(space, va);
        }
    }

    /// Stage a fresh frame at the kernel staging page, let `writer` fill it
    /// (the frame is zeroed first), then alias it into `target` at `va` and
    /// drop the kernel-side alias. The frame ends up owned by `target` only.
    ///
    /// Expects the kernel directory to be loaded, as the writer sees the
    /// frame through the staging page.
    ///
    /// # Errors
    /// Mapping errors from staging or aliasing; on alias failure the staged
    /// frame is freed.
    pub fn stage_and_alias<F>(
        &mut self,
        target: SpaceRef,
        va: VirtualAddress,
        flags: PageEntryBits,
        writer: F,
    ) -> Result<PhysicalPage<Size4K>, VmmError>
    where
        F: FnOnce(&mut FrameBytes),
    {
        let kernel = self.kernel();
        let frame = self.map(kernel, STAGING_PAGE, PageEntryBits::kernel_rw())?;
        {
            let bytes = self.frame_view(STAGING_PAGE, frame);
            bytes.fill(0);
            writer(bytes);
        }

        let aliased = self.map_phys(target, va, frame, flags);
        self.unmap_phys(kernel, STAGING_PAGE);
        if let Err(e) = aliased {
            self.frames.free_4k(frame);
            return Err(e);
        }
        Ok(frame)
    }

    /// Copy `bytes` into `space` starting at `va`.
    ///
    /// # Errors
    /// [`VmmError::InvalidRange`] on address overflow, [`VmmError::Unmapped`]
    /// if a page of the range is not mapped (bytes before it are written).
    pub fn write(&mut self, space: SpaceRef, va: VirtualAddress, bytes: &[u8]) -> Result<(), VmmError> {
        let mut done = 0;
        for (page_va, offset, len) in chunks(va, bytes.len())? {
            let frame = self.translate(space, page_va).ok_or(VmmError::Unmapped)?;
            let src = &bytes[done..done + len];
            self.with_frame(space, page_va, frame, |view| {
                view[offset..offset + len].copy_from_slice(src);
            })?;
            done += len;
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes of `space` starting at `va` into `buf`.
    ///
    /// # Errors
    /// As [`write`](Self::write).
    pub fn read(&mut self, space: SpaceRef, va: VirtualAddress, buf: &mut [u8]) -> Result<(), VmmError> {
        let mut done = 0;
        for (page_va, offset, len) in chunks(va, buf.len())? {
            let frame = self.translate(space, page_va).ok_or(VmmError::Unmapped)?;
            let dst = &mut buf[done..done + len];
            self.with_frame(space, page_va, frame, |view| {
                dst.copy_from_slice(&view[offset..offset + len]);
            })?;
            done += len;
        }
        Ok(())
    }

    /// Load `space`'s directory.
    pub fn activate(&mut self, space: SpaceRef) {
        self.mmu.load_directory(space.directory());
        self.active = space;
    }

    /// Load the master directory.
    pub fn activate_kernel(&mut self) {
        self.activate(self.kernel());
    }

    fn flush(&mut self, space: SpaceRef, va: VirtualAddress) {
        if space == self.active || space == self.kernel() {
            self.mmu.invalidate_page(va.page());
        }
    }

    /// Run `f` on the bytes of `frame`, which `space` maps at `page_va`.
    ///
    /// A frame of an inactive space is reached through a temporary alias at
    /// the staging page.
    fn with_frame<R>(
        &mut self,
        space: SpaceRef,
        page_va: VirtualAddress,
        frame: PhysicalPage<Size4K>,
        f: impl FnOnce(&mut FrameBytes) -> R,
    ) -> Result<R, VmmError> {
        if space == self.active {
            return Ok(f(self.frame_view(page_va, frame)));
        }

        let kernel = self.kernel();
        self.map_phys(kernel, STAGING_PAGE, frame, PageEntryBits::kernel_rw())?;
        let result = f(self.frame_view(STAGING_PAGE, frame));
        self.unmap_phys(kernel, STAGING_PAGE);
        Ok(result)
    }

    /// Bytes of `frame`, mapped at `va` in the loaded directory.
    #[allow(clippy::mut_from_ref)]
    fn frame_view(&self, va: VirtualAddress, frame: PhysicalPage<Size4K>) -> &mut FrameBytes {
        // SAFETY: callers only pass frames that are live at `va`.
        unsafe { self.mapper.mapped_to_mut(va.page::<Size4K>().base(), frame.base()) }
    }
}

/// Split `[va, va + len)` into `(page base, in-page offset, length)` pieces.
fn chunks(
    va: VirtualAddress,
    len: usize,
) -> Result<impl Iterator<Item = (VirtualAddress, usize, usize)>, VmmError> {
    let len = u32::try_from(len).map_err(|_| VmmError::InvalidRange)?;
    let end = va.as_u32().checked_add(len).ok_or(VmmError::InvalidRange)?;
    let mut cursor = va.as_u32();
    Ok(core::iter::from_fn(move || {
        if cursor >= end {
            return None;
        }
        let base = cursor & !(PAGE_SIZE - 1);
        let offset = cursor - base;
        let piece = (PAGE_SIZE - offset).min(end - cursor);
        cursor += piece;
        Some((VirtualAddress::new(base), offset as usize, piece as usize))
    }))
}
