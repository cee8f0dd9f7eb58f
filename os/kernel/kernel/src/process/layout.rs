//! # Thread memory layout
//!
//! User threads get a slot of [`THREAD_SLOT_PAGES`] pages above the process
//! image; slot `n` starts `n * THREAD_SLOT_PAGES` pages above the image end:
//!
//! ```text
//! image_base ┌──────────────────────┐
//!            │ image                │
//! image_end  ├──────────────────────┤ ───┐
//!            │ user stack    (1 pg) │    │
//!            ├──────────────────────┤    │
//!            │ kernel stack  (1 pg) │    │ slot 0
//!            ├──────────────────────┤    │
//!            │ heap          (4 pg) │    │
//!            ├──────────────────────┤ ───┘
//!            │ slot 1 ...           │
//! ```
//!
//! Kernel threads live in the kernel's own directory, in slots of
//! [`KERNEL_THREAD_SLOT_PAGES`] pages (stack, kernel stack) starting at
//! [`KERNEL_THREAD_BASE`].

use kernel_info::abi::{KERNEL_THREAD_SLOT_PAGES, THREAD_SLOT_PAGES, USER_HEAP_PAGES};
use kernel_info::memory::{KERNEL_THREAD_BASE, KERNEL_THREAD_END, PAGE_SIZE, USER_SPACE_END};
use kernel_memory_addresses::{VirtualAddress, align_up};

/// Number of kernel thread slots.
pub const KERNEL_THREAD_SLOTS: u32 =
    (KERNEL_THREAD_END - KERNEL_THREAD_BASE) / (KERNEL_THREAD_SLOT_PAGES * PAGE_SIZE);

/// Page bases of one thread slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ThreadLayout {
    pub user_stack: VirtualAddress,
    pub kernel_stack: VirtualAddress,
    pub heap: VirtualAddress,
    pub heap_pages: u32,
}

impl ThreadLayout {
    /// Slot `slot` of a user process whose image ends at `image_end`.
    ///
    /// `None` if the slot does not fit below [`USER_SPACE_END`].
    #[must_use]
    pub fn user(image_end: VirtualAddress, slot: u32) -> Option<Self> {
        let base = align_up(image_end.as_u32(), PAGE_SIZE)?
            .checked_add(slot.checked_mul(THREAD_SLOT_PAGES * PAGE_SIZE)?)?;
        let end = base.checked_add(THREAD_SLOT_PAGES * PAGE_SIZE)?;
        if end > USER_SPACE_END {
            return None;
        }

        Some(Self {
            user_stack: VirtualAddress::new(base),
            kernel_stack: VirtualAddress::new(base + PAGE_SIZE),
            heap: VirtualAddress::new(base + 2 * PAGE_SIZE),
            heap_pages: USER_HEAP_PAGES,
        })
    }

    /// Kernel thread slot `slot`.
    #[must_use]
    pub const fn kernel(slot: u32) -> Option<Self> {
        if slot >= KERNEL_THREAD_SLOTS {
            return None;
        }

        let base = KERNEL_THREAD_BASE + slot * KERNEL_THREAD_SLOT_PAGES * PAGE_SIZE;
        Some(Self {
            user_stack: VirtualAddress::new(base),
            kernel_stack: VirtualAddress::new(base + PAGE_SIZE),
            heap: VirtualAddress::new(base + 2 * PAGE_SIZE),
            heap_pages: 0,
        })
    }

    #[must_use]
    pub const fn stack_limit(&self) -> VirtualAddress {
        VirtualAddress::new(self.user_stack.as_u32() + PAGE_SIZE)
    }

    #[must_use]
    pub const fn kernel_stack_limit(&self) -> VirtualAddress {
        VirtualAddress::new(self.kernel_stack.as_u32() + PAGE_SIZE)
    }

    #[must_use]
    pub const fn heap_limit(&self) -> VirtualAddress {
        VirtualAddress::new(self.heap.as_u32() + self.heap_pages * PAGE_SIZE)
    }

    #[must_use]
    pub const fn heap_size(&self) -> u32 {
        self.heap_pages * PAGE_SIZE
    }

    /// Every page of the slot: stacks first, then the heap.
    pub fn pages(&self) -> impl Iterator<Item = VirtualAddress> {
        let base = self.heap;
        let heap = (0..self.heap_pages).map(move |i| base + i * PAGE_SIZE);
        [self.user_stack, self.kernel_stack].into_iter().chain(heap)
    }
}
