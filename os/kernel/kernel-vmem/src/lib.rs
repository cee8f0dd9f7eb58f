//! # Virtual Memory Support
//!
//! IA-32 paging helpers for the kernel's memory manager.
//!
//! ## What you get
//! - An [`address space`](address_space) handle owning a page directory, and a
//!   [`PageWalker`] to manipulate it.
//! - Typed directory/table entries over the shared [`PageEntryBits`] layout.
//! - A tiny allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]) and the
//!   [`Mmu`] seam to the CPU.
//!
//! ## IA-32 Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! ```text
//!  CR3 → PD  →  PT  →  Physical Page
//!         │      │
//!         │      └───► PTE (Page Table Entry)     → maps 4 KiB page
//!         └──────────► PDE (Page Directory Entry) → points to a PT (4 MiB span)
//! ```
//!
//! Both levels hold 1024 (2¹⁰) entries of 4 bytes. Each entry keeps its
//! present/writable/user bits in the low 12 bits and the frame number in the
//! high 20; the in-page offset is never stored.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
pub mod mmu;
mod page_entry_bits;
pub mod page_table;

pub use crate::address_space::{AddressSpace, PageWalker, SpaceRef};
pub use crate::mmu::Mmu;
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::pd::{L2Index, PageDirectory, PdEntry};
pub use crate::page_table::pt::{L1Index, PageTable, PtEntry};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// One 4 KiB frame viewed as bytes.
pub type FrameBytes = [u8; 4096];

/// Errors of the table-level operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmemError {
    #[error("out of page tables")]
    OutOfTables,
    #[error("virtual address already maps an owned frame")]
    AlreadyMapped,
}

/// Source of **physical** 4 KiB frames.
///
/// The implementation decides where frames come from (bitmap, bump pool in
/// tests, ...). Returned frames **must** be 4 KiB aligned.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame; `None` on out-of-memory.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, page: PhysicalPage<Size4K>);

    /// Number of frames currently available.
    fn free_frames(&self) -> usize;
}

/// Converts physical addresses to *temporarily* usable pointers in the current
/// virtual address space (e.g., via identity map or a simulated RAM in tests).
///
/// # Safety
/// - You must ensure `pa` is mapped as writable for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` and no other live reference may
///   alias the same frame.
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Access a frame that is mapped at `va` in the **active** directory.
    ///
    /// Mappers that cannot reach every frame physically use the live mapping;
    /// the default goes through [`phys_to_mut`](Self::phys_to_mut).
    ///
    /// # Safety
    /// As [`phys_to_mut`](Self::phys_to_mut); additionally `va` must map `pa`
    /// in the active directory with a flushed TLB entry.
    unsafe fn mapped_to_mut<'a, T>(&self, va: VirtualAddress, pa: PhysicalAddress) -> &'a mut T {
        let _ = va;
        unsafe { self.phys_to_mut(pa) }
    }
}

/// Typed table accessors on top of [`PhysMapper`].
pub trait PhysMapperExt: PhysMapper {
    #[allow(clippy::mut_from_ref)]
    fn pd_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageDirectory {
        // SAFETY: directories live in the page-table pool, which the mapper covers.
        unsafe { self.phys_to_mut::<PageDirectory>(page.base()) }
    }

    #[allow(clippy::mut_from_ref)]
    fn pt_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        // SAFETY: as for `pd_mut`.
        unsafe { self.phys_to_mut::<PageTable>(page.base()) }
    }
}

impl<T: PhysMapper> PhysMapperExt for T {}
