//! Bitmap-based physical frame allocator.
//!
//! One bit per 4 KiB frame of a fixed, contiguous physical window. The
//! kernel runs two instances: one over the data-frame pool and one over the
//! page-table pool.

use kernel_info::memory::{
    FRAME_POOL_FRAMES, FRAME_POOL_START, PAGE_SIZE, PAGE_TABLE_POOL_BASE, PAGE_TABLE_POOL_TABLES,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::FrameAlloc;

/// Number of `u64` words in the bitmap.
const BITMAP_WORDS: usize = 1024;

/// Largest window one allocator can manage (256 MiB).
pub const MAX_FRAMES: u32 = (BITMAP_WORDS * 64) as u32;

pub struct BitmapFrameAlloc {
    /// Frame number of the first managed frame.
    first: u32,
    /// Number of managed frames.
    frames: u32,
    /// Number of currently free frames.
    free: u32,
    /// Search hint: lowest frame index that may be free.
    next: u32,
    /// One bit per frame; set = in use.
    bitmap: [u64; BITMAP_WORDS],
}

impl BitmapFrameAlloc {
    /// Manage `frames` frames starting at `base` (aligned down to 4 KiB).
    /// Windows larger than [`MAX_FRAMES`] are truncated.
    #[must_use]
    pub const fn new(base: PhysicalAddress, frames: u32) -> Self {
        let frames = if frames > MAX_FRAMES { MAX_FRAMES } else { frames };
        Self {
            first: base.as_u32() / PAGE_SIZE,
            frames,
            free: frames,
            next: 0,
            bitmap: [0; BITMAP_WORDS],
        }
    }

    /// The page-table pool `[PAGE_TABLE_POOL_BASE, PAGE_TABLE_POOL_END)`.
    #[must_use]
    pub const fn page_table_pool() -> Self {
        Self::new(
            PhysicalAddress::new(PAGE_TABLE_POOL_BASE),
            PAGE_TABLE_POOL_TABLES,
        )
    }

    /// The data-frame pool starting at `FRAME_POOL_START`.
    #[must_use]
    pub const fn frame_pool() -> Self {
        Self::new(PhysicalAddress::new(FRAME_POOL_START), FRAME_POOL_FRAMES)
    }

    /// Mark every frame free again.
    pub fn reset(&mut self) {
        self.bitmap.fill(0);
        self.free = self.frames;
        self.next = 0;
    }

    #[must_use]
    pub const fn total_frames(&self) -> u32 {
        self.frames
    }

    /// Whether `page` lies inside the managed window.
    #[must_use]
    pub const fn contains(&self, page: PhysicalPage<Size4K>) -> bool {
        let n = page.number();
        n >= self.first && n - self.first < self.frames
    }

    #[inline]
    const fn is_used(&self, idx: u32) -> bool {
        self.bitmap[(idx / 64) as usize] & (1 << (idx % 64)) != 0
    }

    #[inline]
    const fn set_used(&mut self, idx: u32, used: bool) {
        let word = &mut self.bitmap[(idx / 64) as usize];
        if used {
            *word |= 1 << (idx % 64);
        } else {
            *word &= !(1 << (idx % 64));
        }
    }
}

impl FrameAlloc for BitmapFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        if self.free == 0 {
            return None;
        }
        let idx = (self.next..self.frames).find(|&i| !self.is_used(i))?;
        self.set_used(idx, true);
        self.free -= 1;
        self.next = idx + 1;
        Some(PhysicalPage::from_number(self.first + idx))
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        if !self.contains(page) {
            log::warn!("free of foreign frame {page}");
            return;
        }
        let idx = page.number() - self.first;
        if !self.is_used(idx) {
            log::warn!("double free of frame {page}");
            return;
        }
        self.set_used(idx, false);
        self.free += 1;
        self.next = self.next.min(idx);
    }

    fn free_frames(&self) -> usize {
        self.free as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_ascending_frames_until_empty() {
        let mut a = BitmapFrameAlloc::new(PhysicalAddress::new(0x10_0000), 3);
        let f: Vec<_> = core::iter::from_fn(|| a.alloc_4k()).collect();
        assert_eq!(
            f.iter().map(|p| p.base().as_u32()).collect::<Vec<_>>(),
            [0x10_0000, 0x10_1000, 0x10_2000]
        );
        assert_eq!(a.free_frames(), 0);
        assert!(a.alloc_4k().is_none());
    }

    #[test]
    fn freed_frames_are_reused_first() {
        let mut a = BitmapFrameAlloc::new(PhysicalAddress::new(0x10_0000), 8);
        let p0 = a.alloc_4k().unwrap();
        let p1 = a.alloc_4k().unwrap();
        let _p2 = a.alloc_4k().unwrap();
        a.free_4k(p1);
        a.free_4k(p0);
        assert_eq!(a.free_frames(), 7);
        assert_eq!(a.alloc_4k(), Some(p0));
        assert_eq!(a.alloc_4k(), Some(p1));
    }

    #[test]
    fn double_and_foreign_frees_are_ignored() {
        let mut a = BitmapFrameAlloc::new(PhysicalAddress::new(0x10_0000), 4);
        let p = a.alloc_4k().unwrap();
        a.free_4k(p);
        a.free_4k(p);
        a.free_4k(PhysicalPage::from_number(1));
        assert_eq!(a.free_frames(), 4);
    }

    #[test]
    fn pools_cover_their_windows() {
        let pool = BitmapFrameAlloc::page_table_pool();
        assert_eq!(pool.total_frames(), 512);
        assert!(pool.contains(PhysicalPage::from_number(0x200)));
        assert!(!pool.contains(PhysicalPage::from_number(0x400)));

        let mut frames = BitmapFrameAlloc::frame_pool();
        let p = frames.alloc_4k().unwrap();
        frames.reset();
        assert_eq!(frames.free_frames(), frames.total_frames() as usize);
        assert_eq!(frames.alloc_4k(), Some(p));
    }
}
