//! # Physical Mappers
//!
//! [`PhysMapper`] implementations for the two places the memory manager runs:
//!
//! - [`IdentityPhysMapper`] on the target: the low 4 MiB (kernel, heap and the
//!   page-table pool) are identity mapped, so table frames are reachable at
//!   their physical address. Frames above that are only reachable through a
//!   live kernel mapping such as the staging page.
//! - [`HostRam`] (feature `host-ram`, and in this crate's tests): a sparse,
//!   simulated physical memory whose frames materialize zeroed on first touch.

use kernel_info::memory::IDENTITY_MAP_END;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for the identity-mapped low region.
///
/// # Safety
/// - Only frames below `IDENTITY_MAP_END` are reachable physically.
/// - The returned reference must only be used for valid, mapped, and writable memory.
pub struct IdentityPhysMapper;

impl PhysMapper for IdentityPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(
            pa.as_u32() < IDENTITY_MAP_END,
            "{pa} is outside the identity map"
        );
        let va = pa.as_usize() as *mut T;
        // SAFETY: Caller must ensure the physical address is valid and identity mapped.
        unsafe { &mut *va }
    }

    unsafe fn mapped_to_mut<'a, T>(&self, va: VirtualAddress, _pa: PhysicalAddress) -> &'a mut T {
        let ptr = va.as_u32() as usize as *mut T;
        // SAFETY: Caller guarantees `va` is live in the active directory.
        unsafe { &mut *ptr }
    }
}

#[cfg(any(test, feature = "host-ram"))]
pub use host::HostRam;

#[cfg(any(test, feature = "host-ram"))]
mod host {
    extern crate alloc;

    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;
    use core::cell::UnsafeCell;
    use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
    use kernel_vmem::{FrameBytes, PhysMapper};

    #[repr(C, align(4096))]
    struct Frame(FrameBytes);

    /// Sparse simulated physical memory.
    ///
    /// Frames are boxed, so references handed out stay valid while other
    /// frames are inserted.
    #[derive(Default)]
    pub struct HostRam {
        frames: UnsafeCell<BTreeMap<u32, Box<Frame>>>,
    }

    impl HostRam {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of frames touched so far.
        #[must_use]
        pub fn touched_frames(&self) -> usize {
            // SAFETY: no reference into the map itself outlives this call.
            unsafe { (*self.frames.get()).len() }
        }

        /// Copy of a frame's bytes (zero if never touched).
        #[must_use]
        pub fn frame(&self, page: PhysicalPage<Size4K>) -> FrameBytes {
            // SAFETY: read-only access; see `touched_frames`.
            unsafe {
                (*self.frames.get())
                    .get(&page.number())
                    .map_or([0; 4096], |f| f.0)
            }
        }
    }

    impl PhysMapper for HostRam {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            debug_assert!(
                pa.offset::<Size4K>().as_usize() + size_of::<T>() <= 4096,
                "access crosses a frame boundary"
            );
            // SAFETY: the map is only mutated here, and frames never move.
            let frames = unsafe { &mut *self.frames.get() };
            let frame = frames
                .entry(pa.as_u32() >> 12)
                .or_insert_with(|| Box::new(Frame([0; 4096])));
            let base = frame.0.as_mut_ptr();
            // SAFETY: the offset stays inside the 4 KiB frame.
            unsafe { &mut *base.add(pa.offset::<Size4K>().as_usize()).cast::<T>() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::{PhysicalPage, Size4K};

    #[test]
    fn host_ram_frames_are_zeroed_and_persistent() {
        let ram = HostRam::new();
        let bytes: &mut [u8; 4096] = unsafe { ram.phys_to_mut(PhysicalAddress::new(0x0100_0000)) };
        assert!(bytes.iter().all(|&b| b == 0));
        bytes[7] = 0xAB;
        let frame = ram.frame(PhysicalPage::<Size4K>::from_number(0x1000));
        assert_eq!(frame[7], 0xAB);
        assert_eq!(ram.touched_frames(), 1);
    }
}
