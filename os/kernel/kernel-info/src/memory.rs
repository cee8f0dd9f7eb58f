//! # Memory Layout

use kernel_memory_addresses::VirtualAddress;

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: u32 = 4096;

/// Number of entries in a page directory and in a page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Bytes covered by one page-directory entry.
pub const DIRECTORY_SPAN: u32 = PAGE_SIZE * ENTRIES_PER_TABLE as u32;

/// End of the identity-mapped low region; everything below is mapped 1:1
/// (present, read-write, supervisor) into every address space.
pub const IDENTITY_MAP_END: u32 = 0x40_0000; // 4 MiB

/// Start of the kernel heap when the kernel image end is not known (hosted builds).
pub const KERNEL_HEAP_DEFAULT_START: u32 = 0x10_0000;

/// Exclusive end of the kernel heap window.
pub const KERNEL_HEAP_END: u32 = 0x20_0000;

/// Physical base of the page-table pool.
pub const PAGE_TABLE_POOL_BASE: u32 = 0x20_0000;

/// Exclusive physical end of the page-table pool.
pub const PAGE_TABLE_POOL_END: u32 = 0x40_0000;

/// Number of page tables (and directories) the pool can hand out.
pub const PAGE_TABLE_POOL_TABLES: u32 = (PAGE_TABLE_POOL_END - PAGE_TABLE_POOL_BASE) / PAGE_SIZE;

/// Trampoline a user thread returns to when `main` returns.
///
/// The page is identity mapped and user-accessible in every address space.
pub const RETURN_ADDR: VirtualAddress = VirtualAddress::new(0x40_0000);

/// First virtual address of the kernel thread stack slots.
pub const KERNEL_THREAD_BASE: u32 = 0x40_5000;

/// Exclusive end of the kernel thread stack slots.
pub const KERNEL_THREAD_END: u32 = 0x60_0000;

/// Kernel scratch page frames are filled through before being aliased into a
/// process address space.
pub const STAGING_PAGE: VirtualAddress = VirtualAddress::new(0x60_0000);

/// Kernel window an executable is streamed into before relocation.
pub const ELF_STAGING_BASE: u32 = 0x70_0000;

/// Maximum executable size the staging window accepts.
pub const ELF_STAGING_SIZE: u32 = 0x10_0000; // 1 MiB

/// Start of the kernel-private window: thread stack slots and staging pages.
///
/// Address spaces cloned from the kernel directory leave it unmapped.
pub const KERNEL_PRIVATE_START: u32 = KERNEL_THREAD_BASE;

/// Exclusive end of the kernel-private window.
pub const KERNEL_PRIVATE_END: u32 = ELF_STAGING_BASE + ELF_STAGING_SIZE;

/// First physical frame handed out for process mappings.
pub const FRAME_POOL_START: u32 = 0x100_0000; // 16 MiB

/// Number of frames in the default frame pool.
pub const FRAME_POOL_FRAMES: u32 = 4096; // 16 MiB

/// Exclusive upper end of the user-mappable virtual range.
pub const USER_SPACE_END: u32 = 0xFFC0_0000;

const _: () = {
    assert!(IDENTITY_MAP_END == DIRECTORY_SPAN);
    assert!(KERNEL_HEAP_DEFAULT_START < KERNEL_HEAP_END);
    assert!(KERNEL_HEAP_END <= PAGE_TABLE_POOL_BASE);
    assert!(PAGE_TABLE_POOL_END <= IDENTITY_MAP_END);
    assert!(PAGE_TABLE_POOL_BASE.is_multiple_of(PAGE_SIZE));
    assert!(RETURN_ADDR.as_u32() >= IDENTITY_MAP_END);
    assert!(RETURN_ADDR.as_u32() < KERNEL_THREAD_BASE);
    assert!(KERNEL_THREAD_END <= STAGING_PAGE.as_u32());
    assert!(STAGING_PAGE.as_u32() + PAGE_SIZE <= ELF_STAGING_BASE);
    assert!(ELF_STAGING_BASE.is_multiple_of(PAGE_SIZE));
    assert!(ELF_STAGING_BASE + ELF_STAGING_SIZE <= FRAME_POOL_START);
    assert!(KERNEL_PRIVATE_START.is_multiple_of(PAGE_SIZE));
};
