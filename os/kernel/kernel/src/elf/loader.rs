//! # Loading executables
//!
//! An executable is streamed from the filesystem into the kernel staging
//! window, checked, and its `PT_LOAD` segments are copied page by page into
//! the target address space. The staging window is torn down again whether
//! or not loading succeeded.

use crate::elf::helpers::{clip_to_page, covering_pages, segment_range};
use crate::elf::{Elf32Header, ElfError, ProgramHeader};
use crate::fs::FileSystem;
use crate::process::Thread;
use kernel_alloc::vmm::Vmm;
use kernel_info::abi::READ_BLOCK;
use kernel_info::memory::{ELF_STAGING_BASE, ELF_STAGING_SIZE, PAGE_SIZE};
use kernel_memory_addresses::{VirtualAddress, align_up};
use kernel_vmem::{FrameAlloc, Mmu, PageEntryBits, PhysMapper, SpaceRef};
use log::{debug, trace, warn};

/// Pages mapped into the kernel staging window so far.
struct StagingWindow {
    pages: u32,
    len: u32,
}

impl StagingWindow {
    const fn new() -> Self {
        Self { pages: 0, len: 0 }
    }

    /// Append `bytes`, mapping further window pages as needed.
    fn append<M: PhysMapper, A: FrameAlloc, U: Mmu>(
        &mut self,
        vmm: &mut Vmm<M, A, U>,
        bytes: &[u8],
    ) -> Result<(), ElfError> {
        let n = u32::try_from(bytes.len()).map_err(|_| ElfError::TooLarge)?;
        let end = self
            .len
            .checked_add(n)
            .filter(|&end| end <= ELF_STAGING_SIZE)
            .ok_or(ElfError::TooLarge)?;

        let kernel = vmm.kernel();
        while self.pages * PAGE_SIZE < end {
            let va = VirtualAddress::new(ELF_STAGING_BASE + self.pages * PAGE_SIZE);
            vmm.map(kernel, va, PageEntryBits::kernel_rw())?;
            self.pages += 1;
        }

        vmm.write(kernel, VirtualAddress::new(ELF_STAGING_BASE + self.len), bytes)?;
        self.len = end;
        Ok(())
    }

    /// Unmap the window, freeing its frames.
    fn release<M: PhysMapper, A: FrameAlloc, U: Mmu>(self, vmm: &mut Vmm<M, A, U>) {
        let kernel = vmm.kernel();
        for page in 0..self.pages {
            vmm.unmap(kernel, VirtualAddress::new(ELF_STAGING_BASE + page * PAGE_SIZE));
        }
    }
}

/// Load the executable at `path` into `space` and record its entry point and
/// image extent in `thread`.
///
/// # Errors
/// Any [`ElfError`]; what was already copied into `space` stays there and is
/// reclaimed with the address space.
pub fn load<F, M, A, U>(
    fs: &mut F,
    vmm: &mut Vmm<M, A, U>,
    path: &str,
    thread: &mut Thread,
    space: SpaceRef,
) -> Result<(), ElfError>
where
    F: FileSystem,
    M: PhysMapper,
    A: FrameAlloc,
    U: Mmu,
{
    let mut window = StagingWindow::new();
    let result = stream_file(fs, vmm, path, &mut window).and_then(|()| {
        let header = read_header(vmm, &window)?;
        relocate(vmm, thread, space, &header, window.len)
    });
    window.release(vmm);

    match &result {
        Ok(()) => debug!(
            "loaded {path}: entry {}, image {}+{:#x}",
            thread.eip(),
            thread.image_base(),
            thread.image_size()
        ),
        Err(e) => warn!("failed to load {path}: {e}"),
    }
    result
}

/// Copy the file into the staging window in [`READ_BLOCK`] chunks.
fn stream_file<F, M, A, U>(
    fs: &mut F,
    vmm: &mut Vmm<M, A, U>,
    path: &str,
    window: &mut StagingWindow,
) -> Result<(), ElfError>
where
    F: FileSystem,
    M: PhysMapper,
    A: FrameAlloc,
    U: Mmu,
{
    let mut file = fs.open(path).ok_or(ElfError::Fs)?;
    let mut block = [0u8; READ_BLOCK];

    let result = loop {
        if fs.eof(&file) {
            break Ok(());
        }
        let n = fs.read(&mut file, &mut block);
        if n == 0 {
            break Ok(());
        }
        if let Err(e) = window.append(vmm, &block[..n.min(READ_BLOCK)]) {
            break Err(e);
        }
    };

    fs.close(file);
    trace!("staged {path}: {} bytes in {} pages", window.len, window.pages);
    result
}

fn read_header<M: PhysMapper, A: FrameAlloc, U: Mmu>(
    vmm: &mut Vmm<M, A, U>,
    window: &StagingWindow,
) -> Result<Elf32Header, ElfError> {
    if (window.len as usize) < Elf32Header::SIZE {
        return Err(ElfError::TooShort);
    }

    let mut raw = [0u8; Elf32Header::SIZE];
    let kernel = vmm.kernel();
    vmm.read(kernel, VirtualAddress::new(ELF_STAGING_BASE), &mut raw)?;
    Elf32Header::parse(&raw)
}

/// Copy every loadable segment of the staged executable into `space`.
///
/// Sets the thread's entry point, its image base (lowest segment page) and
/// image size (whole pages up to the end of the highest segment).
///
/// # Errors
/// - [`ElfError::BadProgramHeaders`] / [`ElfError::SegmentOutOfRange`] for
///   malformed segments.
/// - [`ElfError::NoLoadableSegment`] if there is nothing to load.
/// - [`ElfError::Mapping`] if a page cannot be mapped.
pub fn relocate<M: PhysMapper, A: FrameAlloc, U: Mmu>(
    vmm: &mut Vmm<M, A, U>,
    thread: &mut Thread,
    space: SpaceRef,
    header: &Elf32Header,
    file_len: u32,
) -> Result<(), ElfError> {
    let (phoff, count) = header.program_table(file_len)?;
    let kernel = vmm.kernel();

    let mut lowest = u32::MAX;
    let mut highest = 0;
    for i in 0..count {
        let mut raw = [0u8; ProgramHeader::SIZE];
        let at = ELF_STAGING_BASE + phoff + i * u32::from(header.e_phentsize);
        vmm.read(kernel, VirtualAddress::new(at), &mut raw)?;

        let ph = ProgramHeader::parse(&raw);
        if !ph.is_load() {
            continue;
        }

        let range = segment_range(&ph, file_len)?;
        lowest = lowest.min(range.start & !(PAGE_SIZE - 1));
        highest = highest.max(range.end);
        load_segment(vmm, space, &ph, range)?;
    }

    if lowest == u32::MAX {
        return Err(ElfError::NoLoadableSegment);
    }

    let end = align_up(highest, PAGE_SIZE).ok_or(ElfError::SegmentOutOfRange)?;
    thread.set_image(header.e_entry, VirtualAddress::new(lowest), end - lowest);
    Ok(())
}

/// Fill the pages of one segment: file bytes first, zeroes for the rest.
fn load_segment<M: PhysMapper, A: FrameAlloc, U: Mmu>(
    vmm: &mut Vmm<M, A, U>,
    space: SpaceRef,
    ph: &ProgramHeader,
    range: core::ops::Range<u32>,
) -> Result<(), ElfError> {
    let kernel = vmm.kernel();
    let file_end = range.start + ph.p_filesz;
    let mut buf = [0u8; PAGE_SIZE as usize];

    for page in covering_pages(range.clone()) {
        let part = clip_to_page(&range, page);
        let piece = &mut buf[..(part.end - part.start) as usize];
        piece.fill(0);

        let file_part = part.start..part.end.min(file_end);
        if !file_part.is_empty() {
            let src = ELF_STAGING_BASE + ph.p_offset + (file_part.start - range.start);
            let n = (file_part.end - file_part.start) as usize;
            vmm.read(kernel, VirtualAddress::new(src), &mut piece[..n])?;
        }

        let page_va = VirtualAddress::new(page);
        match vmm.entry(space, page_va) {
            // Page shared with an earlier segment.
            Some((_, flags)) if !flags.shared() => {
                vmm.write(space, VirtualAddress::new(part.start), piece)?;
            }
            _ => {
                let at = (part.start - page) as usize;
                vmm.stage_and_alias(space, page_va, PageEntryBits::user_rw(), |frame| {
                    frame[at..at + piece.len()].copy_from_slice(piece);
                })?;
            }
        }
    }

    trace!(
        "segment {}+{:#x} ({:#x} from file)",
        ph.p_vaddr, ph.p_memsz, ph.p_filesz
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Pid;
    use crate::test_support::{ElfBuilder, MemFs, TestVmm, test_vmm};
    use kernel_vmem::AddressSpace;

    fn thread() -> Thread {
        let pid = Pid::new(1).unwrap();
        Thread::new(pid, pid, 0)
    }

    fn load_into(
        vmm: &mut TestVmm,
        fs: &mut MemFs,
        path: &str,
    ) -> (Result<(), ElfError>, Thread, AddressSpace) {
        let space = vmm.create_address_space().unwrap();
        let mut thread = thread();
        let result = load(fs, vmm, path, &mut thread, space.handle());
        (result, thread, space)
    }

    #[test]
    fn loads_a_single_segment() {
        let mut vmm = test_vmm();
        let mut fs = MemFs::default();
        let code: Vec<u8> = (0..=255).cycle().take(512).collect();
        fs.insert("init", ElfBuilder::new(0x1000).segment(0x1000, &code, 4096).build());

        let frames = vmm.free_frames();
        let (result, thread, space) = load_into(&mut vmm, &mut fs, "init");
        result.unwrap();

        assert_eq!(thread.eip(), VirtualAddress::new(0x1000));
        assert_eq!(thread.image_base(), VirtualAddress::new(0x1000));
        assert_eq!(thread.image_size(), 4096);

        // Staging window is gone; only the image page remains.
        assert_eq!(vmm.free_frames(), frames - 1);
        assert_eq!(vmm.translate(vmm.kernel(), VirtualAddress::new(ELF_STAGING_BASE)), None);

        let mut head = [0u8; 4];
        vmm.read(space.handle(), VirtualAddress::new(0x1000), &mut head).unwrap();
        assert_eq!(head, [0, 1, 2, 3]);
        let mut bss = [0xFFu8; 4];
        vmm.read(space.handle(), VirtualAddress::new(0x1000 + 600), &mut bss).unwrap();
        assert_eq!(bss, [0; 4]);

        // The image replaced the identity alias only in the process space.
        let (_, flags) = vmm.entry(space.handle(), VirtualAddress::new(0x1000)).unwrap();
        assert!(!flags.shared() && flags.user_access() && flags.writable());

        vmm.delete_address_space(space);
        assert_eq!(vmm.free_frames(), frames);
    }

    #[test]
    fn spans_pages_and_adjacent_segments() {
        let mut vmm = test_vmm();
        let mut fs = MemFs::default();
        let text = vec![0xAA; 0x1800];
        let data = vec![0xBB; 0x10];
        fs.insert(
            "two",
            ElfBuilder::new(0x0800_0000)
                .segment(0x0800_0000, &text, 0x1800)
                .segment(0x0800_1800, &data, 0x900)
                .build(),
        );

        let (result, thread, space) = load_into(&mut vmm, &mut fs, "two");
        result.unwrap();
        assert_eq!(thread.image_base(), VirtualAddress::new(0x0800_0000));
        assert_eq!(thread.image_size(), 0x3000);

        let mut seam = [0u8; 2];
        vmm.read(space.handle(), VirtualAddress::new(0x0800_17FF), &mut seam).unwrap();
        assert_eq!(seam, [0xAA, 0xBB]);
        let mut tail = [0xFFu8; 1];
        vmm.read(space.handle(), VirtualAddress::new(0x0800_20FF), &mut tail).unwrap();
        assert_eq!(tail, [0]);

        vmm.delete_address_space(space);
    }

    #[test]
    fn failures_release_the_staging_window() {
        let mut vmm = test_vmm();
        let mut fs = MemFs::default();
        let mut bad = ElfBuilder::new(0x1000).segment(0x1000, &[1; 512], 4096).build();
        bad[0] = 0;
        fs.insert("bad", bad);
        fs.insert("empty", ElfBuilder::new(0x1000).build());
        fs.insert("huge", vec![0; ELF_STAGING_SIZE as usize + 1]);

        let frames = vmm.free_frames();
        for (path, expected) in [
            ("bad", ElfError::BadMagic),
            ("empty", ElfError::NoLoadableSegment),
            ("huge", ElfError::TooLarge),
            ("missing", ElfError::Fs),
        ] {
            let (result, _, space) = load_into(&mut vmm, &mut fs, path);
            assert_eq!(result, Err(expected), "{path}");
            vmm.delete_address_space(space);
            assert_eq!(vmm.free_frames(), frames, "{path}");
        }
        assert_eq!(fs.open_files(), 0);
    }

    #[test]
    fn segments_outside_user_space_are_rejected() {
        let mut vmm = test_vmm();
        let mut fs = MemFs::default();
        fs.insert(
            "high",
            ElfBuilder::new(0xFFC0_0000).segment(0xFFC0_0000, &[1; 4], 4).build(),
        );

        let (result, _, space) = load_into(&mut vmm, &mut fs, "high");
        assert_eq!(result, Err(ElfError::SegmentOutOfRange));
        vmm.delete_address_space(space);
    }
}
