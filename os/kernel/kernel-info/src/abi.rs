//! # Thread ABI
//!
//! Values loaded into the first interrupt frame of a thread, and the geometry
//! of the per-thread stack/heap slot.

/// Kernel code segment selector (GDT entry 1, RPL 0).
pub const KERNEL_CS: u32 = 0x08;

/// Kernel data segment selector (GDT entry 2, RPL 0).
pub const KERNEL_DS: u32 = 0x10;

/// User code segment selector (GDT entry 3, RPL 3).
pub const USER_CS: u32 = 0x1B;

/// User data segment selector (GDT entry 4, RPL 3).
pub const USER_DS: u32 = 0x23;

/// Initial `EFLAGS`: reserved bit 1 and `IF` set.
pub const INITIAL_EFLAGS: u32 = 0x202;

/// Maximum number of entries in a thread's `argv`, including the program name.
pub const MAX_ARGS: usize = 10;

/// Pages reserved per user thread: user stack, kernel stack, heap.
pub const THREAD_SLOT_PAGES: u32 = 6;

/// Heap pages per user thread.
pub const USER_HEAP_PAGES: u32 = 4;

/// Pages per kernel thread slot: user stack, kernel stack.
pub const KERNEL_THREAD_SLOT_PAGES: u32 = 2;

/// Block size executables are streamed in.
pub const READ_BLOCK: usize = 512;

const _: () = {
    assert!(THREAD_SLOT_PAGES == 2 + USER_HEAP_PAGES);
    assert!(USER_CS & 3 == 3 && USER_DS & 3 == 3);
    assert!(KERNEL_CS & 3 == 0 && KERNEL_DS & 3 == 0);
    assert!(INITIAL_EFLAGS & 0x200 != 0);
};
