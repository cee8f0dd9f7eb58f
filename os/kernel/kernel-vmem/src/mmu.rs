//! # MMU Control
//!
//! The [`Mmu`] trait is the seam between page-table bookkeeping and the CPU:
//! loading a directory, turning paging on, and dropping stale TLB entries.

use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualPage};

/// CPU-side paging control.
pub trait Mmu {
    /// Make `directory` the active page directory (CR3 load).
    fn load_directory(&mut self, directory: PhysicalPage<Size4K>);

    /// Enable paging (CR0.PG). Requires a loaded directory.
    fn enable_paging(&mut self);

    /// Drop the TLB entry for `page` on this CPU.
    fn invalidate_page(&mut self, page: VirtualPage<Size4K>);
}

/// The real MMU of the executing IA-32 CPU.
#[cfg(all(target_arch = "x86", not(test)))]
pub struct X86Mmu {
    _private: (),
}

#[cfg(all(target_arch = "x86", not(test)))]
impl X86Mmu {
    /// # Safety
    /// Must run at CPL0. Every directory later loaded through this value must
    /// map the executing code and stack.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(all(target_arch = "x86", not(test)))]
impl Mmu for X86Mmu {
    fn load_directory(&mut self, directory: PhysicalPage<Size4K>) {
        use kernel_registers::StoreRegisterUnsafe;
        use kernel_registers::cr3::Cr3;

        let cr3 = Cr3::from_directory_phys(directory.base(), false, false);
        // SAFETY: `X86Mmu::new` requires ring 0 and directories that keep us mapped.
        unsafe { cr3.store_unsafe() }
    }

    fn enable_paging(&mut self) {
        use kernel_registers::cr0::Cr0;
        use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

        // SAFETY: see `load_directory`; CR3 is loaded before paging is enabled.
        unsafe {
            let cr0 = Cr0::load_unsafe().with_pg_paging(true);
            cr0.store_unsafe();
        }
    }

    fn invalidate_page(&mut self, page: VirtualPage<Size4K>) {
        let va = page.base().as_u32();
        // SAFETY: `invlpg` only drops a cached translation.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
        }
    }
}
