use crate::{MemoryAddressOffset, MemoryPage, PageSize, PhysicalAddress};
use core::fmt;

/// Physical memory page base for size `S`.
///
/// A `PhysicalPage<S>` represents the **page-aligned base** of a physical page
/// (a *frame*) of size `S`. It is a thin wrapper over [`MemoryPage<S>`] with
/// physical-address intent.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x0080_1234);
/// let pp = pa.page::<Size4K>();
/// assert_eq!(pp.base().as_u32(), 0x0080_1000);
/// assert_eq!(pp.join(pa.offset::<Size4K>()), pa);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize>(pub(crate) MemoryPage<S>);

impl<S: PageSize> PhysicalPage<S> {
    #[inline]
    #[must_use]
    pub const fn from_addr(p: PhysicalAddress) -> Self {
        Self(MemoryPage::from_addr(p.0))
    }

    /// Frame with the given frame number (`base >> S::SHIFT`).
    #[inline]
    #[must_use]
    pub const fn from_number(number: u32) -> Self {
        Self(MemoryPage::from_number(number))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self.0.number()
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> PhysicalAddress {
        PhysicalAddress(self.0.join(off))
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysicalPage<{}>(0x{:08X})",
            S::as_str(),
            self.0.base().as_u32()
        )
    }
}

impl<S: PageSize> From<MemoryPage<S>> for PhysicalPage<S> {
    #[inline]
    fn from(p: MemoryPage<S>) -> Self {
        Self(p)
    }
}
