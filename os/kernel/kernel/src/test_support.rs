//! Hosted stand-ins for the filesystem, the scheduler and the MMU.

use crate::fs::FileSystem;
use crate::process::Pid;
use crate::sched::{ProcessHandle, Scheduler};
use kernel_alloc::frame_alloc::BitmapFrameAlloc;
use kernel_alloc::phys_mapper::HostRam;
use kernel_alloc::vmm::Vmm;
use kernel_info::memory::FRAME_POOL_START;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualPage};
use kernel_sync::{PreemptFlag, Preemption};
use kernel_vmem::Mmu;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

pub type TestVmm = Vmm<HostRam, BitmapFrameAlloc, NullMmu>;

#[derive(Default)]
pub struct NullMmu;

impl Mmu for NullMmu {
    fn load_directory(&mut self, _directory: PhysicalPage<Size4K>) {}
    fn enable_paging(&mut self) {}
    fn invalidate_page(&mut self, _page: VirtualPage<Size4K>) {}
}

pub fn test_vmm() -> TestVmm {
    Vmm::init(
        HostRam::new(),
        BitmapFrameAlloc::frame_pool(),
        BitmapFrameAlloc::page_table_pool(),
        NullMmu,
    )
}

/// A VMM with only `frames` data frames.
pub fn test_vmm_with_frames(frames: u32) -> TestVmm {
    Vmm::init(
        HostRam::new(),
        BitmapFrameAlloc::new(PhysicalAddress::new(FRAME_POOL_START), frames),
        BitmapFrameAlloc::page_table_pool(),
        NullMmu,
    )
}

/// Flat in-memory filesystem.
#[derive(Default)]
pub struct MemFs {
    files: BTreeMap<String, Vec<u8>>,
    open: usize,
}

pub struct MemFile {
    path: String,
    pos: usize,
}

impl MemFs {
    pub fn insert(&mut self, path: &str, bytes: Vec<u8>) {
        self.files.insert(path.to_owned(), bytes);
    }

    /// Handles opened and not yet closed.
    pub const fn open_files(&self) -> usize {
        self.open
    }

    fn len(&self, path: &str) -> usize {
        self.files.get(path).map_or(0, Vec::len)
    }
}

impl FileSystem for MemFs {
    type Handle = MemFile;

    fn open(&mut self, path: &str) -> Option<MemFile> {
        self.files.contains_key(path).then(|| {
            self.open += 1;
            MemFile {
                path: path.to_owned(),
                pos: 0,
            }
        })
    }

    fn read(&mut self, handle: &mut MemFile, buf: &mut [u8]) -> usize {
        let data = &self.files[&handle.path];
        let n = buf.len().min(data.len() - handle.pos);
        buf[..n].copy_from_slice(&data[handle.pos..handle.pos + n]);
        handle.pos += n;
        n
    }

    fn eof(&self, handle: &MemFile) -> bool {
        handle.pos >= self.len(&handle.path)
    }

    fn close(&mut self, _handle: MemFile) {
        self.open -= 1;
    }
}

/// Remembers what the process manager hands over.
#[derive(Default)]
pub struct RecordingScheduler {
    preempt: PreemptFlag,
    pub registered: RefCell<Vec<ProcessHandle>>,
    pub deregistered: RefCell<Vec<Pid>>,
    /// Preemption state seen by each `register` call.
    pub preempt_at_register: RefCell<Vec<bool>>,
    pub running: Cell<Option<Pid>>,
}

impl RecordingScheduler {
    pub fn preemption_enabled(&self) -> bool {
        self.preempt.is_enabled()
    }
}

impl Preemption for RecordingScheduler {
    fn disable(&self) -> bool {
        self.preempt.disable()
    }

    fn enable(&self) {
        self.preempt.enable();
    }
}

impl Scheduler for RecordingScheduler {
    fn register(&self, process: ProcessHandle) {
        self.preempt_at_register
            .borrow_mut()
            .push(self.preempt.is_enabled());
        self.registered.borrow_mut().push(process);
    }

    fn deregister(&self, pid: Pid) {
        self.registered.borrow_mut().retain(|p| p.pid != pid);
        self.deregistered.borrow_mut().push(pid);
    }

    fn current(&self) -> Option<Pid> {
        self.running.get()
    }
}

/// Builds little-endian i386 executables with one program header per segment.
pub struct ElfBuilder {
    entry: u32,
    segments: Vec<(u32, Vec<u8>, u32)>,
}

impl ElfBuilder {
    pub const fn new(entry: u32) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    /// A loadable segment at `vaddr` with file contents `data` and `memsz`
    /// bytes in memory.
    pub fn segment(mut self, vaddr: u32, data: &[u8], memsz: u32) -> Self {
        self.segments.push((vaddr, data.to_vec(), memsz));
        self
    }

    pub fn build(self) -> Vec<u8> {
        const EHSIZE: u32 = 52;
        const PHENTSIZE: u32 = 32;

        let phnum = u32::try_from(self.segments.len()).unwrap();
        let mut out = Vec::new();
        out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1]);
        out.resize(16, 0);
        out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out.extend_from_slice(&3u16.to_le_bytes()); // EM_386
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&EHSIZE.to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes());
        out.extend_from_slice(&(phnum as u16).to_le_bytes());
        out.extend_from_slice(&[0; 6]); // section header entry size, count, name index
        assert_eq!(out.len(), EHSIZE as usize);

        let mut offset = EHSIZE + PHENTSIZE * phnum;
        for (vaddr, data, memsz) in &self.segments {
            let filesz = u32::try_from(data.len()).unwrap();
            for word in [1, offset, *vaddr, *vaddr, filesz, *memsz, 7, 0x1000] {
                out.extend_from_slice(&u32::to_le_bytes(word));
            }
            offset += filesz;
        }
        for (_, data, _) in &self.segments {
            out.extend_from_slice(data);
        }
        out
    }
}
