use crate::PageSize;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign};

/// Principal raw memory address ([virtual](crate::VirtualAddress) or [physical](crate::PhysicalAddress)).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddress(u32);

impl MemoryAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The page for size `S` that contains this address (lower bits zeroed).
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> MemoryPage<S> {
        MemoryPage {
            value: self.align_down::<S>().0,
            _phantom: PhantomData,
        }
    }

    /// The offset within the page of size `S` that contains this address.
    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> MemoryAddressOffset<S> {
        MemoryAddressOffset {
            value: self.0 & (S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    /// Split into (`MemoryPage<S>`, `MemoryAddressOffset<S>`).
    #[inline]
    #[must_use]
    pub const fn split<S: PageSize>(self) -> (MemoryPage<S>, MemoryAddressOffset<S>) {
        (self.page::<S>(), self.offset::<S>())
    }

    /// Align down to page boundary `S`.
    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !(S::SIZE - 1))
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u32) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryAddress(0x{:08X})", self.0)
    }
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl Add<u32> for MemoryAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u32> for MemoryAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

/// A page base address (lower `S::SHIFT` bits are zero).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryPage<S: PageSize> {
    value: u32,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> MemoryPage<S> {
    /// Create from a raw value, aligning down to the page boundary.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: MemoryAddress) -> Self {
        Self {
            value: addr.as_u32() & !(S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    /// Page that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: u32) -> Self {
        Self::from_addr(MemoryAddress::new(addr))
    }

    /// Page with the given page number (`base >> S::SHIFT`).
    #[inline]
    #[must_use]
    pub const fn from_number(number: u32) -> Self {
        Self {
            value: number << S::SHIFT,
            _phantom: PhantomData,
        }
    }

    /// Return the base as `MemoryAddress`.
    #[inline]
    #[must_use]
    pub const fn base(self) -> MemoryAddress {
        MemoryAddress::new(self.value)
    }

    /// Page number (`base >> S::SHIFT`).
    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self.value >> S::SHIFT
    }

    /// Combine with an offset to form a full address.
    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> MemoryAddress {
        MemoryAddress::new(self.value + off.as_u32())
    }

    /// The page `n` pages above this one, or `None` past the 32-bit space.
    #[inline]
    #[must_use]
    pub const fn checked_add_pages(self, n: u32) -> Option<Self> {
        let Some(bytes) = n.checked_mul(S::SIZE) else {
            return None;
        };
        match self.value.checked_add(bytes) {
            Some(value) => Some(Self {
                value,
                _phantom: PhantomData,
            }),
            None => None,
        }
    }
}

impl<S: PageSize> fmt::Display for MemoryPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}/{}", self.value, S::as_str())
    }
}

impl<S: PageSize> fmt::Debug for MemoryPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryPage<{}>(0x{:08X})", S::as_str(), self.value)
    }
}

/// The offset within a page of size `S` (`0..S::SIZE-1`).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddressOffset<S: PageSize> {
    value: u32,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> MemoryAddressOffset<S> {
    /// Create from a raw value, asserting it is < `S::SIZE` in debug.
    #[inline]
    #[must_use]
    pub fn new(value: u32) -> Self {
        debug_assert!(value < S::SIZE, "offset must be < page size");
        Self {
            value: value & (S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.value
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.value as usize
    }
}

impl<S: PageSize> fmt::Debug for MemoryAddressOffset<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offset<{}>({:#X})", S::as_str(), self.value)
    }
}

impl<S: PageSize> Add<MemoryAddressOffset<S>> for MemoryPage<S> {
    type Output = MemoryAddress;
    #[inline]
    fn add(self, rhs: MemoryAddressOffset<S>) -> Self::Output {
        self.join(rhs)
    }
}
