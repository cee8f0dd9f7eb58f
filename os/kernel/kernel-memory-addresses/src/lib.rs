//! # Virtual and Physical Memory Address Types (IA-32)
//!
//! Strongly typed wrappers for raw 32-bit memory addresses and page bases used
//! in paging and memory management code.
//!
//! ## Overview
//!
//! The core idea is to build all higher-level memory abstractions from a few
//! principal types:
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 32-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are then wrapped to distinguish between virtual and physical spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory. |
//!
//! ## Page Sizes
//!
//! Two page sizes exist with classic two-level paging (no PAE):
//!
//! - [`Size4K`] — 4 KiB pages, mapped by a page-table entry
//! - [`Size4M`] — the 4 MiB span covered by one page-directory entry
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0080_1234);
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u32(), 0x0080_1000);
//! assert_eq!(off.as_u32(), 0x234);
//! assert_eq!(page.join(off), va);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod memory_address;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use crate::memory_address::{MemoryAddress, MemoryAddressOffset, MemoryPage};
pub use crate::page_size::{PageSize, Size4K, Size4M};
pub use crate::physical_address::PhysicalAddress;
pub use crate::physical_page::PhysicalPage;
pub use crate::virtual_address::VirtualAddress;
pub use crate::virtual_page::VirtualPage;

/// Align `x` down to the nearest multiple of `a` (`a` must be a power of two).
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x1FFF, 4096), 0x1000);
/// assert_eq!(align_down(0x2000, 4096), 0x2000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a` (`a` must be a power of two).
///
/// Returns `None` if the aligned value does not fit into 32 bits.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0, 4096), Some(0));
/// assert_eq!(align_up(1, 4096), Some(4096));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(0xFFFF_F001, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> Option<u32> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_4k() {
        let a = MemoryAddress::new(0x1234_5678);
        let (p, o) = a.split::<Size4K>();
        assert_eq!(p.base().as_u32() & 0xFFF, 0);
        assert_eq!(o.as_u32(), 0x678);
        assert_eq!(p.join(o).as_u32(), a.as_u32());
    }

    #[test]
    fn split_and_join_4m() {
        let a = MemoryAddress::new(0x0080_1234);
        let (p, o) = a.split::<Size4M>();
        assert_eq!(p.base().as_u32(), 0x0080_0000);
        assert_eq!(o.as_u32(), 0x1234);
        assert_eq!(p.join(o).as_u32(), a.as_u32());
    }

    #[test]
    fn virtual_vs_physical_wrappers() {
        let va = VirtualAddress::new(0xC000_1234);
        let (vp, vo) = va.split::<Size4K>();
        assert_eq!(vp.base().as_u32(), 0xC000_1000);
        assert_eq!(vo.as_u32(), 0x234);
        assert_eq!(vp.join(vo), va);

        let pa = PhysicalAddress::new(0x0020_0042);
        let (pp, po) = pa.split::<Size4K>();
        assert_eq!(pp.base().as_u32(), 0x0020_0000);
        assert_eq!(po.as_u32(), 0x42);
        assert_eq!(pp.join(po), pa);
    }

    #[test]
    fn page_stepping() {
        let vp = VirtualPage::<Size4K>::containing_address(VirtualAddress::new(0x1FFF));
        assert_eq!(vp.base().as_u32(), 0x1000);
        assert_eq!(vp.checked_add_pages(2).map(|p| p.base().as_u32()), Some(0x3000));
        let last = VirtualPage::<Size4K>::containing_address(VirtualAddress::new(0xFFFF_F000));
        assert_eq!(last.checked_add_pages(1), None);
    }

    #[test]
    fn frame_numbers_round_trip() {
        let pp = PhysicalPage::<Size4K>::from_number(0x801);
        assert_eq!(pp.base().as_u32(), 0x0080_1000);
        assert_eq!(pp.number(), 0x801);
    }
}
