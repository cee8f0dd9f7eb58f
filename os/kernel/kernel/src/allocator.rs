//! # Kernel Heap Allocator
//!
//! [`KernelAllocator`] puts a [`FreeListHeap`] behind `GlobalAlloc`, so the
//! `alloc` collections of the kernel (process and thread records among them)
//! live in the kernel heap window. The heap books kernel virtual addresses;
//! the arena also remembers the pointer the window's first byte is reached
//! through, which on the target is the identity mapping of `start`.
//!
//! Boot code calls [`KernelAllocator::init`] on [`KERNEL_HEAP`] once the
//! window is mapped. Until then every allocation fails.
//!
//! ## Constraints
//! - Payloads are [`HEAP_ALIGN`]-aligned; larger alignments are refused.
//! - Sizes are rounded up to [`HEAP_ALIGN`], which keeps every split aligned.
//! - The [`SpinLock`] does not mask interrupts; interrupt handlers must not
//!   allocate.

#![allow(unsafe_code)]

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, null_mut};
use kernel_alloc::free_list::{FreeListHeap, HEADER_SIZE, HeapPtr};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;

/// Alignment of every payload handed out.
pub const HEAP_ALIGN: usize = HEADER_SIZE as usize;

/// The installed global allocator.
#[cfg_attr(all(not(test), target_os = "none"), global_allocator)]
pub static KERNEL_HEAP: KernelAllocator = KernelAllocator::new();

pub struct KernelAllocator {
    arena: SpinLock<Option<Arena>>,
}

struct Arena {
    heap: FreeListHeap,
    /// Exposed address of the heap's first byte.
    base: usize,
}

impl KernelAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            arena: SpinLock::new(None),
        }
    }

    /// Manage `size` bytes at kernel address `start`, reached through `base`.
    ///
    /// Blocks handed out by an earlier `init` are forgotten.
    ///
    /// # Safety
    /// `base` must point to `size` writable bytes, [`HEAP_ALIGN`]-aligned,
    /// that nothing but this allocator uses from now on.
    pub unsafe fn init(&self, start: VirtualAddress, size: u32, base: *mut u8) {
        debug_assert!(base.addr().is_multiple_of(HEAP_ALIGN));
        debug_assert!(size.is_multiple_of(HEADER_SIZE));

        let arena = Arena {
            heap: FreeListHeap::new(start, size),
            base: base.expose_provenance(),
        };
        self.arena.with_lock(|slot| *slot = Some(arena));
        log::info!("kernel heap: {size} bytes at {start}");
    }

    /// Accounted bytes, headers included; 0 before [`init`](Self::init).
    #[must_use]
    pub fn used(&self) -> u32 {
        self.arena
            .with_lock(|arena| arena.as_ref().map_or(0, |a| a.heap.used()))
    }
}

impl Default for KernelAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    fn alloc(&mut self, layout: Layout) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return null_mut();
        }
        let Some(len) = u32::try_from(layout.size())
            .ok()
            .and_then(|n| n.max(1).checked_next_multiple_of(HEADER_SIZE))
        else {
            return null_mut();
        };

        self.heap.alloc(len).map_or(null_mut(), |block| {
            let offset = (block.addr().as_u32() - self.heap.start().as_u32()) as usize;
            ptr::with_exposed_provenance_mut(self.base + offset)
        })
    }

    fn free(&mut self, ptr: *mut u8) {
        let addr = ptr
            .expose_provenance()
            .checked_sub(self.base)
            .and_then(|offset| u32::try_from(offset).ok())
            .and_then(|offset| self.heap.start().as_u32().checked_add(offset));
        match addr {
            Some(addr) => self.heap.free(HeapPtr::from_addr(VirtualAddress::new(addr))),
            None => log::warn!("kernel heap: free of foreign pointer {ptr:p}"),
        }
    }
}

// SAFETY: live blocks never overlap and stay inside the window handed to
// `init`; the heap state is only touched under the lock.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.arena
            .with_lock(|arena| arena.as_mut().map_or(null_mut(), |a| a.alloc(layout)))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.arena.with_lock(|arena| {
            if let Some(a) = arena {
                a.free(ptr);
            }
        });
    }
}
