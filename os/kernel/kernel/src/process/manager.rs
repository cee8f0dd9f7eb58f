//! # Process Manager
//!
//! Creates processes (address space, main thread, image, stacks, heap,
//! arguments), hands them to the scheduler and tears them down again.
//!
//! All entry points run with preemption disabled. Creation either completes
//! or releases everything it acquired and returns the error; a process is
//! only visible (to the scheduler and to [`ProcessManager::process`]) once
//! it is `Active`.

use crate::elf;
use crate::fs::FileSystem;
use crate::process::layout::{KERNEL_THREAD_SLOTS, ThreadLayout};
use crate::process::{InterruptFrame, Pid, Process, ProcessError, ProcessSpace, ProcessState, Thread};
use crate::sched::Scheduler;
use alloc::string::String;
use alloc::vec::Vec;
use kernel_alloc::free_list::{FreeListHeap, HeapError};
use kernel_alloc::vmm::{Vmm, VmmError};
use kernel_info::abi::MAX_ARGS;
use kernel_info::memory::{PAGE_SIZE, RETURN_ADDR};
use kernel_memory_addresses::VirtualAddress;
use kernel_registers::cpu::halt;
use kernel_sync::PreemptGuard;
use kernel_vmem::{FrameAlloc, FrameBytes, Mmu, PageEntryBits, PhysMapper, SpaceRef};
use log::{debug, error, info, warn};

/// Bytes pushed below the user stack limit: return address, `argc`, `argv`.
const USER_STACK_ARGS: u32 = 12;

pub struct ProcessManager<'s, M, A, U, F, S>
where
    M: PhysMapper,
    A: FrameAlloc,
    U: Mmu,
    F: FileSystem,
    S: Scheduler,
{
    vmm: Vmm<M, A, U>,
    fs: F,
    scheduler: &'s S,
    processes: Vec<Process>,
    next_pid: u32,
}

impl<'s, M, A, U, F, S> ProcessManager<'s, M, A, U, F, S>
where
    M: PhysMapper,
    A: FrameAlloc,
    U: Mmu,
    F: FileSystem,
    S: Scheduler,
{
    #[must_use]
    pub const fn new(vmm: Vmm<M, A, U>, fs: F, scheduler: &'s S) -> Self {
        Self {
            vmm,
            fs,
            scheduler,
            processes: Vec::new(),
            next_pid: 1,
        }
    }

    #[inline]
    #[must_use]
    pub const fn vmm(&self) -> &Vmm<M, A, U> {
        &self.vmm
    }

    #[inline]
    pub const fn vmm_mut(&mut self) -> &mut Vmm<M, A, U> {
        &mut self.vmm
    }

    #[inline]
    pub const fn fs_mut(&mut self) -> &mut F {
        &mut self.fs
    }

    /// Number of live (active or stopped, not yet removed) processes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    #[must_use]
    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.processes.iter().find(|p| p.pid == pid)
    }

    #[must_use]
    pub fn proc_state(&self, pid: Pid) -> Option<ProcessState> {
        self.process(pid).map(Process::state)
    }

    /// Start the executable `name` in a new address space.
    ///
    /// `arguments` is split on whitespace; `argv[0]` is `name`.
    ///
    /// # Errors
    /// - [`ProcessError::TooManyArguments`] for more than `MAX_ARGS - 1` arguments.
    /// - [`ProcessError::OutOfMemory`] if the kernel or thread heap is exhausted.
    /// - [`ProcessError::Mapping`] if frames or page tables run out.
    /// - [`ProcessError::InvalidImage`] if the executable cannot be loaded.
    pub fn start_process(&mut self, name: &str, arguments: &str) -> Result<Pid, ProcessError> {
        let _preempt = PreemptGuard::new(self.scheduler);
        let result = self.in_kernel_space(|this| this.spawn_user(name, arguments));
        match &result {
            Ok(pid) => info!("started process {pid} ({name})"),
            Err(e) => warn!("failed to start {name}: {e}"),
        }
        result
    }

    /// Start a kernel-mode process executing `entry` in the kernel's own
    /// address space.
    ///
    /// # Errors
    /// - [`ProcessError::NoKernelThreadSlot`] if every kernel stack slot is taken.
    /// - [`ProcessError::OutOfMemory`] / [`ProcessError::Mapping`] on exhaustion.
    pub fn start_kernel_process(
        &mut self,
        name: &str,
        entry: VirtualAddress,
    ) -> Result<Pid, ProcessError> {
        let _preempt = PreemptGuard::new(self.scheduler);
        let result = self.in_kernel_space(|this| this.spawn_kernel(name, entry));
        match &result {
            Ok(pid) => info!("started kernel process {pid} ({name}) at {entry}"),
            Err(e) => warn!("failed to start kernel process {name}: {e}"),
        }
        result
    }

    /// Mark the running process `Stopped`. The process stays listed until
    /// [`remove_proc`](Self::remove_proc).
    ///
    /// # Errors
    /// [`ProcessError::NoSuchProcess`] if nothing is running or the running
    /// process is unknown.
    pub fn stop_current(&mut self, code: i32) -> Result<Pid, ProcessError> {
        let _preempt = PreemptGuard::new(self.scheduler);
        let pid = self.scheduler.current().ok_or(ProcessError::NoSuchProcess)?;
        let process = self
            .processes
            .iter_mut()
            .find(|p| p.pid == pid)
            .ok_or(ProcessError::NoSuchProcess)?;

        if code != 0 {
            warn!("process {pid} returned with error: {code}");
        }

        process.state = ProcessState::Stopped;
        for thread in &mut process.threads {
            thread.state = ProcessState::Stopped;
        }
        Ok(pid)
    }

    /// Stop the running process and wait for the scheduler to switch away.
    pub fn end_proc(&mut self, code: i32) -> ! {
        if let Err(e) = self.stop_current(code) {
            error!("end_proc({code}): {e}");
        }
        self.scheduler.enable();
        halt()
    }

    /// Release everything process `pid` owns.
    ///
    /// # Errors
    /// [`ProcessError::NoSuchProcess`] for an unknown pid.
    pub fn remove_proc(&mut self, pid: Pid) -> Result<(), ProcessError> {
        let _preempt = PreemptGuard::new(self.scheduler);
        let index = self
            .processes
            .iter()
            .position(|p| p.pid == pid)
            .ok_or(ProcessError::NoSuchProcess)?;
        let process = self.processes.remove(index);
        let space = process.space.handle(self.vmm.kernel());

        if let Some(main) = process.main_thread() {
            for page in main.image_pages() {
                self.vmm.unmap(space, page);
            }
        }

        for thread in &process.threads {
            if thread.main {
                self.scheduler.deregister(thread.pid);
            }
            for page in thread.slot_pages() {
                self.vmm.unmap(space, page);
            }
        }

        self.vmm.activate_kernel();
        if let ProcessSpace::Owned(space) = process.space {
            self.vmm.delete_address_space(space);
        }

        info!("removed process {pid}");
        Ok(())
    }

    /// Run `f` with the kernel directory loaded, restoring the previous one.
    fn in_kernel_space<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = self.vmm.active();
        let kernel = self.vmm.kernel();
        if previous == kernel {
            return f(self);
        }

        self.vmm.activate(kernel);
        let result = f(self);
        self.vmm.activate(previous);
        result
    }

    fn allocate_pid(&mut self) -> Pid {
        loop {
            let candidate = Pid::new(self.next_pid);
            self.next_pid = self.next_pid.checked_add(1).unwrap_or(1);
            if let Some(pid) = candidate
                && self.process(pid).is_none()
            {
                return pid;
            }
        }
    }

    /// Register `process` with the scheduler and list it.
    fn admit(&mut self, mut process: Process) -> Pid {
        process.state = ProcessState::Active;
        let pid = process.pid;
        if let Some(handle) = process.handle(self.vmm.kernel()) {
            self.scheduler.register(handle);
        }
        self.processes.push(process);
        pid
    }

    /// Reserve the heap memory of a process record up front, so that
    /// admitting it cannot fail after its pages are in place.
    fn reserve_record(&mut self, name: &str) -> Result<(String, Vec<Thread>), ProcessError> {
        let mut owned = String::new();
        owned.try_reserve_exact(name.len())?;
        owned.push_str(name);

        let mut threads = Vec::new();
        threads.try_reserve_exact(1)?;
        self.processes.try_reserve(1)?;
        Ok((owned, threads))
    }

    fn spawn_user(&mut self, name: &str, arguments: &str) -> Result<Pid, ProcessError> {
        if argument_count(arguments) + 1 > MAX_ARGS {
            return Err(ProcessError::TooManyArguments);
        }

        let (owned_name, mut threads) = self.reserve_record(name)?;
        let space = self.vmm.create_address_space()?;

        let pid = self.allocate_pid();
        let mut thread = Thread::new(pid, pid, 0);
        thread.main = true;
        if let Err(e) = self.prepare_user_thread(&mut thread, name, arguments, space.handle()) {
            self.vmm.delete_address_space(space);
            return Err(e);
        }

        threads.push(thread);
        Ok(self.admit(Process {
            pid,
            name: owned_name,
            state: ProcessState::New,
            space: ProcessSpace::Owned(space),
            threads,
        }))
    }

    /// Load the image, then build heap and stacks above it. Pages already
    /// placed in `space` on failure go away with the address space.
    fn prepare_user_thread(
        &mut self,
        thread: &mut Thread,
        name: &str,
        arguments: &str,
        space: SpaceRef,
    ) -> Result<(), ProcessError> {
        elf::load(&mut self.fs, &mut self.vmm, name, thread, space)?;

        let layout = thread
            .image_end()
            .and_then(|end| ThreadLayout::user(end, thread.slot))
            .ok_or(VmmError::InvalidRange)?;

        self.build_heap(thread, &layout, name, arguments, space)?;
        self.build_user_stacks(thread, &layout, space)?;

        thread.state = ProcessState::Active;
        Ok(())
    }

    /// Marshal `argv` into the thread heap and place the heap pages.
    fn build_heap(
        &mut self,
        thread: &mut Thread,
        layout: &ThreadLayout,
        name: &str,
        arguments: &str,
        space: SpaceRef,
    ) -> Result<(), ProcessError> {
        let mut heap = FreeListHeap::new(layout.heap, layout.heap_size());
        let mut image = Vec::new();
        image.try_reserve_exact(layout.heap_size() as usize)?;
        image.resize(layout.heap_size() as usize, 0);
        let (argc, argv) = marshal_arguments(&mut heap, &mut image, name, arguments)?;

        for (page, bytes) in layout
            .pages()
            .skip(2)
            .zip(image.chunks_exact(PAGE_SIZE as usize))
        {
            self.vmm
                .stage_and_alias(space, page, PageEntryBits::user_rw(), |frame| {
                    frame.copy_from_slice(bytes);
                })?;
        }

        thread.heap = layout.heap;
        thread.heap_limit = layout.heap_limit();
        thread.user_heap = Some(heap);
        thread.argc = argc;
        thread.argv = argv;
        Ok(())
    }

    /// User stack with `RETURN_ADDR`, `argc`, `argv`; kernel stack with the
    /// ring-3 entry frame.
    fn build_user_stacks(
        &mut self,
        thread: &mut Thread,
        layout: &ThreadLayout,
        space: SpaceRef,
    ) -> Result<(), ProcessError> {
        let stack_limit = layout.stack_limit();
        let esp = VirtualAddress::new(stack_limit.as_u32() - USER_STACK_ARGS);
        let args = [RETURN_ADDR.as_u32(), thread.argc, thread.argv.as_u32()];
        self.vmm
            .stage_and_alias(space, layout.user_stack, PageEntryBits::user_rw(), |frame| {
                push_words(frame, &args);
            })?;

        let context = InterruptFrame::user(thread.eip, esp, stack_limit);
        let frame_bytes = context.to_bytes();
        self.vmm.stage_and_alias(
            space,
            layout.kernel_stack,
            PageEntryBits::kernel_rw(),
            |frame| {
                let top = frame.len();
                frame[top - frame_bytes.len()..].copy_from_slice(&frame_bytes);
            },
        )?;

        thread.esp = esp;
        thread.stack_limit = stack_limit;
        thread.stack_kernel_limit = layout.kernel_stack_limit();
        thread.esp_kernel =
            VirtualAddress::new(layout.kernel_stack_limit().as_u32() - InterruptFrame::SIZE);
        thread.context = context;
        Ok(())
    }

    fn spawn_kernel(&mut self, name: &str, entry: VirtualAddress) -> Result<Pid, ProcessError> {
        let slot = self
            .free_kernel_slot()
            .ok_or(ProcessError::NoKernelThreadSlot)?;
        let layout = ThreadLayout::kernel(slot).ok_or(ProcessError::NoKernelThreadSlot)?;

        let (owned_name, mut threads) = self.reserve_record(name)?;

        let pid = self.allocate_pid();
        let mut thread = Thread::new(pid, pid, slot);
        thread.main = true;
        thread.eip = entry;
        self.build_kernel_stacks(&mut thread, &layout)?;
        thread.state = ProcessState::Active;

        debug!("kernel process {pid} uses thread slot {slot}");
        threads.push(thread);
        Ok(self.admit(Process {
            pid,
            name: owned_name,
            state: ProcessState::New,
            space: ProcessSpace::Kernel,
            threads,
        }))
    }

    /// Map both stack pages of a kernel slot and push the ring-0 entry frame.
    fn build_kernel_stacks(
        &mut self,
        thread: &mut Thread,
        layout: &ThreadLayout,
    ) -> Result<(), ProcessError> {
        let kernel = self.vmm.kernel();
        let stack_limit = layout.stack_limit();
        let esp_kernel =
            VirtualAddress::new(layout.kernel_stack_limit().as_u32() - InterruptFrame::SIZE);
        let context = InterruptFrame::kernel(thread.eip, stack_limit, stack_limit);

        let mut mapped = 0;
        let mut result = Ok(());
        for page in layout.pages() {
            result = self.vmm.map(kernel, page, PageEntryBits::kernel_rw()).map(|_| ());
            if result.is_err() {
                break;
            }
            mapped += 1;
        }
        let result = result.and_then(|()| self.vmm.write(kernel, esp_kernel, &context.to_bytes()));

        if let Err(e) = result {
            for page in layout.pages().take(mapped) {
                self.vmm.unmap(kernel, page);
            }
            return Err(e.into());
        }

        thread.esp = stack_limit;
        thread.stack_limit = stack_limit;
        thread.esp_kernel = esp_kernel;
        thread.stack_kernel_limit = layout.kernel_stack_limit();
        thread.context = context;
        Ok(())
    }

    fn free_kernel_slot(&self) -> Option<u32> {
        (0..KERNEL_THREAD_SLOTS).find(|&slot| {
            !self
                .processes
                .iter()
                .filter(|p| p.is_kernel())
                .flat_map(|p| p.threads.iter())
                .any(|t| t.slot == slot)
        })
    }
}

fn argument_count(arguments: &str) -> usize {
    arguments.split_whitespace().count()
}

/// Place `argv` (a `MAX_ARGS` pointer array) and its strings in `heap`,
/// writing the bytes into `image`, the heap's backing memory.
///
/// Returns `argc` and the address of `argv`.
fn marshal_arguments(
    heap: &mut FreeListHeap,
    image: &mut [u8],
    name: &str,
    arguments: &str,
) -> Result<(u32, VirtualAddress), ProcessError> {
    if argument_count(arguments) + 1 > MAX_ARGS {
        return Err(ProcessError::TooManyArguments);
    }

    let base = heap.start().as_u32();
    let offset = |addr: VirtualAddress| (addr.as_u32() - base) as usize;

    let table_len = u32::try_from(MAX_ARGS * 4).map_err(|_| HeapError::OutOfMemory)?;
    let argv = heap.alloc(table_len)?.addr();

    let mut argc = 0;
    for arg in core::iter::once(name).chain(arguments.split_whitespace()) {
        let len = u32::try_from(arg.len() + 1).map_err(|_| HeapError::OutOfMemory)?;
        let at = heap.alloc(len)?.addr();

        let s = offset(at);
        image[s..s + arg.len()].copy_from_slice(arg.as_bytes());
        image[s + arg.len()] = 0;

        let slot = offset(argv) + argc as usize * 4;
        image[slot..slot + 4].copy_from_slice(&at.as_u32().to_le_bytes());
        argc += 1;
    }

    Ok((argc, argv))
}

/// Write `words` at the top of a stack page, lowest address first.
fn push_words(frame: &mut FrameBytes, words: &[u32]) {
    let top = frame.len() - words.len() * 4;
    for (chunk, word) in frame[top..].chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::ElfError;
    use crate::test_support::{
        ElfBuilder, MemFs, NullMmu, RecordingScheduler, TestVmm, test_vmm, test_vmm_with_frames,
    };
    use kernel_alloc::frame_alloc::BitmapFrameAlloc;
    use kernel_alloc::phys_mapper::HostRam;
    use kernel_info::abi::{KERNEL_CS, USER_CS};
    use kernel_info::memory::KERNEL_THREAD_BASE;

    type TestManager<'s> =
        ProcessManager<'s, HostRam, BitmapFrameAlloc, NullMmu, MemFs, RecordingScheduler>;

    fn manager(scheduler: &RecordingScheduler, vmm: TestVmm) -> TestManager<'_> {
        let mut fs = MemFs::default();
        let image = ElfBuilder::new(0x1000).segment(0x1000, &[0x90; 512], 4096).build();
        fs.insert("init", image.clone());
        fs.insert("p", image);
        ProcessManager::new(vmm, fs, scheduler)
    }

    fn space_of(pm: &TestManager<'_>, pid: Pid) -> SpaceRef {
        pm.process(pid).unwrap().space().handle(pm.vmm().kernel())
    }

    fn read_u32(pm: &mut TestManager<'_>, space: SpaceRef, va: VirtualAddress) -> u32 {
        let mut word = [0; 4];
        pm.vmm_mut().read(space, va, &mut word).unwrap();
        u32::from_le_bytes(word)
    }

    fn read_str(pm: &mut TestManager<'_>, space: SpaceRef, mut va: VirtualAddress) -> String {
        let mut out = String::new();
        loop {
            let mut byte = [0];
            pm.vmm_mut().read(space, va, &mut byte).unwrap();
            if byte[0] == 0 {
                return out;
            }
            out.push(char::from(byte[0]));
            va += 1;
        }
    }

    /// Free frames, free tables.
    fn usage(pm: &TestManager<'_>) -> (usize, usize) {
        (pm.vmm().free_frames(), pm.vmm().free_tables())
    }

    #[test]
    fn starts_init_above_its_image() {
        let scheduler = RecordingScheduler::default();
        let mut pm = manager(&scheduler, test_vmm());

        let pid = pm.start_process("init", "").unwrap();
        assert_eq!(pid.get(), 1);
        assert_eq!(pm.proc_state(pid), Some(ProcessState::Active));

        let process = pm.process(pid).unwrap();
        assert_eq!(process.name(), "init");
        assert!(!process.is_kernel());
        assert_eq!(process.thread_count(), 1);

        let main = process.main_thread().unwrap();
        assert_eq!(main.state(), ProcessState::Active);
        assert_eq!(main.eip(), VirtualAddress::new(0x1000));
        assert_eq!(main.image_base(), VirtualAddress::new(0x1000));
        assert_eq!(main.image_size(), 4096);
        assert_eq!(main.stack_limit(), VirtualAddress::new(0x3000));
        assert_eq!(main.esp(), VirtualAddress::new(0x2FF4));
        assert_eq!(main.stack_kernel_limit(), VirtualAddress::new(0x4000));
        assert_eq!(main.esp_kernel(), VirtualAddress::new(0x3FC0));
        assert_eq!(main.heap(), VirtualAddress::new(0x4000));
        assert_eq!(main.heap_limit(), VirtualAddress::new(0x8000));
        assert_eq!(main.argc(), 1);
        assert_eq!(main.context().cs, USER_CS);

        let registered = scheduler.registered.borrow();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].pid, pid);
        assert_eq!(registered[0].directory, space_of(&pm, pid).directory());
        assert_eq!(registered[0].kernel_stack, VirtualAddress::new(0x3FC0));
        assert_eq!(registered[0].kernel_stack_top, VirtualAddress::new(0x4000));
    }

    #[test]
    fn stacks_hold_the_entry_state() {
        let scheduler = RecordingScheduler::default();
        let mut pm = manager(&scheduler, test_vmm());
        let pid = pm.start_process("init", "").unwrap();
        let space = space_of(&pm, pid);
        let main = pm.process(pid).unwrap().main_thread().unwrap();
        let (esp, esp_kernel, argv) = (main.esp(), main.esp_kernel(), main.argv());
        let context = *main.context();

        assert_eq!(read_u32(&mut pm, space, esp), RETURN_ADDR.as_u32());
        assert_eq!(read_u32(&mut pm, space, esp + 4), 1);
        assert_eq!(read_u32(&mut pm, space, esp + 8), argv.as_u32());

        let mut frame = [0; InterruptFrame::SIZE as usize];
        pm.vmm_mut().read(space, esp_kernel, &mut frame).unwrap();
        assert_eq!(frame, context.to_bytes());
        assert_eq!(
            context,
            InterruptFrame::user(VirtualAddress::new(0x1000), esp, VirtualAddress::new(0x3000))
        );

        let (_, flags) = pm.vmm().entry(space, esp_kernel).unwrap();
        assert!(!flags.user_access());
    }

    #[test]
    fn arguments_land_in_the_thread_heap() {
        let scheduler = RecordingScheduler::default();
        let mut pm = manager(&scheduler, test_vmm());
        let pid = pm.start_process("p", "a  b\tc").unwrap();
        let space = space_of(&pm, pid);
        let main = pm.process(pid).unwrap().main_thread().unwrap();
        let (argc, argv, heap, heap_limit) = (main.argc(), main.argv(), main.heap(), main.heap_limit());
        assert!(main.user_heap().unwrap().used() > 0);

        assert_eq!(argc, 4);
        assert!(argv >= heap && argv < heap_limit);

        let args: Vec<String> = (0..argc)
            .map(|i| {
                let ptr = read_u32(&mut pm, space, argv + i * 4);
                read_str(&mut pm, space, VirtualAddress::new(ptr))
            })
            .collect();
        assert_eq!(args, ["p", "a", "b", "c"]);
        assert_eq!(read_u32(&mut pm, space, argv + argc * 4), 0);
    }

    #[test]
    fn argument_count_is_bounded() {
        let scheduler = RecordingScheduler::default();
        let mut pm = manager(&scheduler, test_vmm());
        let before = usage(&pm);

        let pid = pm.start_process("p", "1 2 3 4 5 6 7 8 9").unwrap();
        assert_eq!(pm.process(pid).unwrap().main_thread().unwrap().argc(), 10);
        pm.remove_proc(pid).unwrap();

        assert_eq!(
            pm.start_process("p", "1 2 3 4 5 6 7 8 9 10"),
            Err(ProcessError::TooManyArguments)
        );
        assert_eq!(usage(&pm), before);
        assert!(pm.is_empty());
    }

    #[test]
    fn invalid_images_leave_nothing_behind() {
        let scheduler = RecordingScheduler::default();
        let mut pm = manager(&scheduler, test_vmm());
        let mut bad = ElfBuilder::new(0x1000).segment(0x1000, &[1; 512], 4096).build();
        bad[0] = 0;
        pm.fs_mut().insert("bad", bad);
        let before = usage(&pm);

        assert_eq!(
            pm.start_process("bad", ""),
            Err(ProcessError::InvalidImage(ElfError::BadMagic))
        );
        assert_eq!(
            pm.start_process("missing", ""),
            Err(ProcessError::InvalidImage(ElfError::Fs))
        );

        assert_eq!(usage(&pm), before);
        assert!(pm.is_empty());
        assert!(scheduler.registered.borrow().is_empty());
        assert_eq!(pm.fs_mut().open_files(), 0);
        assert!(scheduler.preemption_enabled());
    }

    #[test]
    fn frame_exhaustion_unwinds_a_half_built_process() {
        let scheduler = RecordingScheduler::default();
        // Enough for the image and the heap, not for the stacks.
        let mut pm = manager(&scheduler, test_vmm_with_frames(5));
        let before = usage(&pm);

        assert_eq!(
            pm.start_process("init", ""),
            Err(ProcessError::Mapping(VmmError::OutOfMemory))
        );
        assert_eq!(usage(&pm), before);
        assert!(scheduler.registered.borrow().is_empty());
    }

    #[test]
    fn remove_proc_returns_every_resource() {
        let scheduler = RecordingScheduler::default();
        let mut pm = manager(&scheduler, test_vmm());
        let before = usage(&pm);

        let first = pm.start_process("init", "x").unwrap();
        let second = pm.start_process("p", "").unwrap();
        assert_eq!(second.get(), 2);

        pm.remove_proc(first).unwrap();
        pm.remove_proc(second).unwrap();

        assert_eq!(usage(&pm), before);
        assert!(pm.is_empty());
        assert!(scheduler.registered.borrow().is_empty());
        assert_eq!(*scheduler.deregistered.borrow(), [first, second]);
        assert_eq!(pm.vmm().active(), pm.vmm().kernel());
        assert_eq!(pm.remove_proc(first), Err(ProcessError::NoSuchProcess));
    }

    #[test]
    fn preemption_is_off_while_registering() {
        let scheduler = RecordingScheduler::default();
        let mut pm = manager(&scheduler, test_vmm());
        pm.start_process("init", "").unwrap();
        pm.start_kernel_process("idle", VirtualAddress::new(0x10_2000))
            .unwrap();

        assert_eq!(*scheduler.preempt_at_register.borrow(), [false, false]);
        assert!(scheduler.preemption_enabled());
    }

    #[test]
    fn starting_restores_the_active_space() {
        let scheduler = RecordingScheduler::default();
        let mut pm = manager(&scheduler, test_vmm());
        let first = pm.start_process("init", "").unwrap();
        let space = space_of(&pm, first);

        pm.vmm_mut().activate(space);
        pm.start_process("p", "").unwrap();
        assert_eq!(pm.vmm().active(), space);
    }

    #[test]
    fn kernel_processes_take_stack_slots() {
        let scheduler = RecordingScheduler::default();
        let mut pm = manager(&scheduler, test_vmm());
        let before = usage(&pm);
        let entry = VirtualAddress::new(0x10_2000);

        let idle = pm.start_kernel_process("idle", entry).unwrap();
        let worker = pm.start_kernel_process("worker", entry).unwrap();

        let process = pm.process(idle).unwrap();
        assert!(process.is_kernel());
        let main = process.main_thread().unwrap();
        let stack_limit = VirtualAddress::new(KERNEL_THREAD_BASE + PAGE_SIZE);
        let kernel_stack_limit = VirtualAddress::new(KERNEL_THREAD_BASE + 2 * PAGE_SIZE);
        assert_eq!(main.slot(), 0);
        assert_eq!(main.eip(), entry);
        assert_eq!(main.esp(), stack_limit);
        assert_eq!(main.stack_kernel_limit(), kernel_stack_limit);
        assert_eq!(main.esp_kernel(), VirtualAddress::new(kernel_stack_limit.as_u32() - 64));
        assert_eq!(main.context().cs, KERNEL_CS);
        assert!(main.user_heap().is_none());
        let (esp_kernel, context) = (main.esp_kernel(), *main.context());

        let kernel = pm.vmm().kernel();
        let mut frame = [0; InterruptFrame::SIZE as usize];
        pm.vmm_mut().read(kernel, esp_kernel, &mut frame).unwrap();
        assert_eq!(frame, context.to_bytes());
        assert_eq!(scheduler.registered.borrow()[0].directory, kernel.directory());

        assert_eq!(pm.process(worker).unwrap().main_thread().unwrap().slot(), 1);

        pm.remove_proc(idle).unwrap();
        let again = pm.start_kernel_process("again", entry).unwrap();
        assert_eq!(pm.process(again).unwrap().main_thread().unwrap().slot(), 0);

        pm.remove_proc(again).unwrap();
        pm.remove_proc(worker).unwrap();
        assert_eq!(usage(&pm), before);
        assert_eq!(pm.vmm().translate(kernel, VirtualAddress::new(KERNEL_THREAD_BASE)), None);
    }

    #[test]
    fn kernel_stack_slots_run_out() {
        let scheduler = RecordingScheduler::default();
        let mut pm = manager(&scheduler, test_vmm());
        let entry = VirtualAddress::new(0x10_2000);

        for _ in 0..KERNEL_THREAD_SLOTS {
            pm.start_kernel_process("k", entry).unwrap();
        }
        let before = usage(&pm);
        assert_eq!(
            pm.start_kernel_process("k", entry),
            Err(ProcessError::NoKernelThreadSlot)
        );
        assert_eq!(usage(&pm), before);
        assert_eq!(pm.len(), KERNEL_THREAD_SLOTS as usize);
        assert_eq!(scheduler.registered.borrow().len(), pm.len());
        assert!(scheduler.preemption_enabled());
    }

    #[test]
    fn user_spaces_never_see_kernel_stacks() {
        let scheduler = RecordingScheduler::default();
        let mut pm = manager(&scheduler, test_vmm());
        let kernel = pm.vmm().kernel();
        let stack = VirtualAddress::new(KERNEL_THREAD_BASE);
        let before = usage(&pm);

        let idle = pm
            .start_kernel_process("idle", VirtualAddress::new(0x10_2000))
            .unwrap();
        assert!(pm.vmm().translate(kernel, stack).is_some());
        let first = pm.start_process("init", "").unwrap();
        assert_eq!(pm.vmm().translate(space_of(&pm, first), stack), None);

        // The slot's frames return to the pool while `init` lives on.
        pm.remove_proc(idle).unwrap();
        let second = pm.start_process("p", "").unwrap();
        for pid in [first, second] {
            let space = space_of(&pm, pid);
            assert_eq!(pm.vmm().translate(space, stack), None);
            assert_eq!(
                pm.vmm().translate(space, VirtualAddress::new(KERNEL_THREAD_BASE + PAGE_SIZE)),
                None
            );
        }
        assert_eq!(pm.vmm().translate(kernel, stack), None);

        pm.remove_proc(first).unwrap();
        pm.remove_proc(second).unwrap();
        assert_eq!(usage(&pm), before);
    }

    #[test]
    fn stop_current_marks_the_running_process() {
        let scheduler = RecordingScheduler::default();
        let mut pm = manager(&scheduler, test_vmm());
        let pid = pm.start_process("init", "").unwrap();

        assert_eq!(pm.stop_current(0), Err(ProcessError::NoSuchProcess));

        scheduler.running.set(Some(pid));
        assert_eq!(pm.stop_current(3), Ok(pid));
        assert_eq!(pm.proc_state(pid), Some(ProcessState::Stopped));
        let process = pm.process(pid).unwrap();
        assert!(process.threads().iter().all(|t| t.state() == ProcessState::Stopped));
        assert!(scheduler.preemption_enabled());

        pm.remove_proc(pid).unwrap();
        assert_eq!(pm.proc_state(pid), None);
    }

    #[test]
    fn marshalled_arguments_are_nul_terminated() {
        let mut heap = FreeListHeap::new(VirtualAddress::new(0x4000), 0x1000);
        let mut image = vec![0xFF; 0x1000];
        let (argc, argv) = marshal_arguments(&mut heap, &mut image, "sh", "-c ls").unwrap();
        assert_eq!(argc, 3);

        let at = |i: u32| {
            let slot = (argv.as_u32() - 0x4000 + i * 4) as usize;
            let ptr = u32::from_le_bytes(image[slot..slot + 4].try_into().unwrap());
            (ptr - 0x4000) as usize
        };
        assert_eq!(&image[at(0)..at(0) + 3], b"sh\0");
        assert_eq!(&image[at(1)..at(1) + 3], b"-c\0");
        assert_eq!(&image[at(2)..at(2) + 3], b"ls\0");
    }
}
