use crate::process::{Pid, ProcessState};
use kernel_alloc::free_list::FreeListHeap;
use kernel_info::abi::{INITIAL_EFLAGS, KERNEL_CS, KERNEL_DS, USER_CS, USER_DS};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::VirtualAddress;

/// Register image an interrupt return pops to start a thread.
///
/// Field order is stack order: `gs` sits at the lowest address, i.e. at the
/// saved kernel stack pointer; `ss` at the top of the kernel stack.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct InterruptFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub ebp: u32,
    pub edi: u32,
    pub esi: u32,
    pub edx: u32,
    pub ecx: u32,
    pub ebx: u32,
    pub eax: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl InterruptFrame {
    /// Bytes the frame occupies on the kernel stack.
    pub const SIZE: u32 = 64;

    const EMPTY: Self = Self::with_selectors(
        0,
        0,
        VirtualAddress::zero(),
        VirtualAddress::zero(),
        VirtualAddress::zero(),
    );

    /// Ring-3 entry at `eip` with user stack pointer `esp`.
    #[must_use]
    pub const fn user(eip: VirtualAddress, esp: VirtualAddress, ebp: VirtualAddress) -> Self {
        Self::with_selectors(USER_CS, USER_DS, eip, esp, ebp)
    }

    /// Ring-0 entry at `eip`.
    #[must_use]
    pub const fn kernel(eip: VirtualAddress, esp: VirtualAddress, ebp: VirtualAddress) -> Self {
        Self::with_selectors(KERNEL_CS, KERNEL_DS, eip, esp, ebp)
    }

    const fn with_selectors(
        cs: u32,
        ds: u32,
        eip: VirtualAddress,
        esp: VirtualAddress,
        ebp: VirtualAddress,
    ) -> Self {
        Self {
            gs: ds,
            fs: ds,
            es: ds,
            ds,
            ebp: ebp.as_u32(),
            edi: 0,
            esi: 0,
            edx: 0,
            ecx: 0,
            ebx: 0,
            eax: 0,
            eip: eip.as_u32(),
            cs,
            eflags: INITIAL_EFLAGS,
            esp: esp.as_u32(),
            ss: ds,
        }
    }

    /// Little-endian stack image, lowest address first.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE as usize] {
        let words = [
            self.gs, self.fs, self.es, self.ds, self.ebp, self.edi, self.esi, self.edx,
            self.ecx, self.ebx, self.eax, self.eip, self.cs, self.eflags, self.esp, self.ss,
        ];
        let mut out = [0u8; Self::SIZE as usize];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}

const _: () = assert!(size_of::<InterruptFrame>() == InterruptFrame::SIZE as usize);

/// A thread's initial context and the memory it was given.
///
/// Stack and heap bounds are page aligned; the `*_limit` values are the
/// exclusive upper ends.
pub struct Thread {
    pub(crate) pid: Pid,
    pub(crate) parent: Pid,
    pub(crate) main: bool,
    pub(crate) state: ProcessState,
    pub(crate) context: InterruptFrame,
    pub(crate) eip: VirtualAddress,
    pub(crate) image_base: VirtualAddress,
    pub(crate) image_size: u32,
    pub(crate) esp: VirtualAddress,
    pub(crate) stack_limit: VirtualAddress,
    pub(crate) esp_kernel: VirtualAddress,
    pub(crate) stack_kernel_limit: VirtualAddress,
    pub(crate) heap: VirtualAddress,
    pub(crate) heap_limit: VirtualAddress,
    /// Serves `argv`; kernel threads have none.
    pub(crate) user_heap: Option<FreeListHeap>,
    pub(crate) argc: u32,
    pub(crate) argv: VirtualAddress,
    /// Stack slot index within the process (user) or the kernel window.
    pub(crate) slot: u32,
}

impl Thread {
    #[must_use]
    pub const fn new(pid: Pid, parent: Pid, slot: u32) -> Self {
        Self {
            pid,
            parent,
            main: false,
            state: ProcessState::New,
            context: InterruptFrame::EMPTY,
            eip: VirtualAddress::zero(),
            image_base: VirtualAddress::zero(),
            image_size: 0,
            esp: VirtualAddress::zero(),
            stack_limit: VirtualAddress::zero(),
            esp_kernel: VirtualAddress::zero(),
            stack_kernel_limit: VirtualAddress::zero(),
            heap: VirtualAddress::zero(),
            heap_limit: VirtualAddress::zero(),
            user_heap: None,
            argc: 0,
            argv: VirtualAddress::zero(),
            slot,
        }
    }

    /// Record the loaded image.
    pub fn set_image(&mut self, entry: VirtualAddress, base: VirtualAddress, size: u32) {
        self.eip = entry;
        self.image_base = base;
        self.image_size = size;
    }

    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub const fn parent(&self) -> Pid {
        self.parent
    }

    #[must_use]
    pub const fn is_main(&self) -> bool {
        self.main
    }

    #[must_use]
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    #[must_use]
    pub const fn context(&self) -> &InterruptFrame {
        &self.context
    }

    #[must_use]
    pub const fn eip(&self) -> VirtualAddress {
        self.eip
    }

    #[must_use]
    pub const fn image_base(&self) -> VirtualAddress {
        self.image_base
    }

    #[must_use]
    pub const fn image_size(&self) -> u32 {
        self.image_size
    }

    /// First byte past the image; `None` if it would wrap.
    #[must_use]
    pub const fn image_end(&self) -> Option<VirtualAddress> {
        self.image_base.checked_add(self.image_size)
    }

    #[must_use]
    pub const fn esp(&self) -> VirtualAddress {
        self.esp
    }

    #[must_use]
    pub const fn stack_limit(&self) -> VirtualAddress {
        self.stack_limit
    }

    #[must_use]
    pub const fn esp_kernel(&self) -> VirtualAddress {
        self.esp_kernel
    }

    #[must_use]
    pub const fn stack_kernel_limit(&self) -> VirtualAddress {
        self.stack_kernel_limit
    }

    #[must_use]
    pub const fn heap(&self) -> VirtualAddress {
        self.heap
    }

    #[must_use]
    pub const fn heap_limit(&self) -> VirtualAddress {
        self.heap_limit
    }

    #[must_use]
    pub const fn user_heap(&self) -> Option<&FreeListHeap> {
        self.user_heap.as_ref()
    }

    #[must_use]
    pub const fn argc(&self) -> u32 {
        self.argc
    }

    #[must_use]
    pub const fn argv(&self) -> VirtualAddress {
        self.argv
    }

    #[must_use]
    pub const fn slot(&self) -> u32 {
        self.slot
    }

    /// Pages of the loaded image.
    pub(crate) fn image_pages(&self) -> impl Iterator<Item = VirtualAddress> + use<> {
        let base = self.image_base;
        (0..self.image_size / PAGE_SIZE).map(move |i| base + i * PAGE_SIZE)
    }

    /// Stack and heap pages of the thread's slot.
    pub(crate) fn slot_pages(&self) -> impl Iterator<Item = VirtualAddress> + use<> {
        let stacks = [self.stack_limit, self.stack_kernel_limit]
            .into_iter()
            .filter(|limit| limit.as_u32() != 0)
            .map(|limit| VirtualAddress::new(limit.as_u32() - PAGE_SIZE));
        let heap = (self.heap.as_u32()..self.heap_limit.as_u32())
            .step_by(PAGE_SIZE as usize)
            .map(VirtualAddress::new);
        stacks.chain(heap)
    }
}
