//! # First-Fit Free-List Heap
//!
//! Backs the kernel's global allocator and, per thread, the user heap that
//! holds the argument vector. Block headers are bookkept in a fixed node arena rather
//! than inside the managed memory, so the heap can manage memory the kernel
//! cannot currently address (a thread heap in another address space).
//!
//! ```text
//! +--------+---------------+--------+--------------------+
//! | header | payload (len) | header | free remainder ... |
//! +--------+---------------+--------+--------------------+
//! ^ start  ^ HeapPtr
//! ```
//!
//! Blocks stay in ascending address order: a block is only ever split into
//! itself plus the node immediately after it. Freeing merges with every
//! directly following free block.

use core::fmt;
use kernel_memory_addresses::VirtualAddress;

/// Bytes accounted per block header.
pub const HEADER_SIZE: u32 = 16;

/// Tag carried by every live block node.
pub const HEAP_MAGIC: u32 = 0x4B48_4550; // "KHEP"

/// Maximum number of simultaneously existing blocks.
pub const MAX_BLOCKS: usize = 128;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("heap exhausted")]
    OutOfMemory,
}

/// Address of an allocation's payload.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapPtr(VirtualAddress);

impl HeapPtr {
    /// Pointer to the payload at `addr`. [`FreeListHeap::free`] ignores
    /// addresses that are no live payload.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: VirtualAddress) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn addr(self) -> VirtualAddress {
        self.0
    }
}

impl fmt::Debug for HeapPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapPtr({})", self.0)
    }
}

#[derive(Copy, Clone)]
struct Block {
    magic: u32,
    /// Address of the (virtual) header; the payload follows it.
    start: u32,
    /// Payload bytes.
    size: u32,
    free: bool,
    next: Option<u16>,
}

impl Block {
    const RETIRED: Self = Self {
        magic: 0,
        start: 0,
        size: 0,
        free: false,
        next: None,
    };

    const fn payload(&self) -> u32 {
        self.start + HEADER_SIZE
    }
}

/// A first-fit, split-and-merge heap over `[start, start + size)`.
///
/// # Invariants
/// - `used <= size`.
/// - Every node reachable from `head` carries [`HEAP_MAGIC`]; retired nodes
///   carry 0 and sit on the spare list.
pub struct FreeListHeap {
    start: u32,
    size: u32,
    used: u32,
    head: Option<u16>,
    spare: Option<u16>,
    nodes: [Block; MAX_BLOCKS],
}

impl FreeListHeap {
    /// Heap managing `size` bytes at `start`: one free block of
    /// `size - HEADER_SIZE` payload bytes.
    #[must_use]
    pub fn new(start: VirtualAddress, size: u32) -> Self {
        let mut heap = Self {
            start: 0,
            size: 0,
            used: 0,
            head: None,
            spare: None,
            nodes: [Block::RETIRED; MAX_BLOCKS],
        };
        heap.init(start, size);
        heap
    }

    /// Reset to a single free block spanning `size` bytes at `start`.
    pub fn init(&mut self, start: VirtualAddress, size: u32) {
        self.nodes = [Block::RETIRED; MAX_BLOCKS];
        // Node 0 is the first block; the rest form the spare list.
        for i in 1..MAX_BLOCKS {
            self.nodes[i].next = (i + 1 < MAX_BLOCKS).then(|| index(i + 1));
        }
        self.spare = (MAX_BLOCKS > 1).then(|| index(1));
        self.start = start.as_u32();
        self.size = size;
        self.used = HEADER_SIZE.min(size);
        self.nodes[0] = Block {
            magic: HEAP_MAGIC,
            start: self.start,
            size: size.saturating_sub(HEADER_SIZE),
            free: true,
            next: None,
        };
        self.head = Some(0);
    }

    /// Total managed bytes.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Accounted bytes, headers included.
    #[must_use]
    pub const fn used(&self) -> u32 {
        self.used
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        VirtualAddress::new(self.start)
    }

    /// Allocate `len` payload bytes (at least one).
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if the accounting is exhausted, no free
    /// block is large enough, or no block node is left for the split.
    pub fn alloc(&mut self, len: u32) -> Result<HeapPtr, HeapError> {
        let len = len.max(1);
        if self.used >= self.size {
            return Err(HeapError::OutOfMemory);
        }

        let mut cursor = self.head;
        while let Some(i) = cursor {
            let block = self.nodes[usize::from(i)];
            if block.free && block.magic == HEAP_MAGIC && block.size >= len {
                return self.take(i, len);
            }
            cursor = block.next;
        }
        Err(HeapError::OutOfMemory)
    }

    fn take(&mut self, i: u16, len: u32) -> Result<HeapPtr, HeapError> {
        let block = self.nodes[usize::from(i)];
        let split = block.size - len > HEADER_SIZE;
        let taken = if split { len } else { block.size };
        let accounted = taken + HEADER_SIZE;
        if self.used + accounted > self.size {
            return Err(HeapError::OutOfMemory);
        }

        if split {
            let j = self.spare.ok_or(HeapError::OutOfMemory)?;
            self.spare = self.nodes[usize::from(j)].next;
            self.nodes[usize::from(j)] = Block {
                magic: HEAP_MAGIC,
                start: block.start + HEADER_SIZE + len,
                size: block.size - len - HEADER_SIZE,
                free: true,
                next: block.next,
            };
            let node = &mut self.nodes[usize::from(i)];
            node.size = len;
            node.next = Some(j);
        }

        let node = &mut self.nodes[usize::from(i)];
        node.free = false;
        self.used += accounted;
        Ok(HeapPtr(VirtualAddress::new(node.payload())))
    }

    /// Release an allocation.
    ///
    /// Foreign, stale, or already freed pointers are logged and ignored.
    pub fn free(&mut self, ptr: HeapPtr) {
        let Some(i) = self.find(ptr) else {
            log::warn!("heap: free of foreign pointer {ptr:?}");
            return;
        };
        let block = self.nodes[usize::from(i)];
        if block.magic != HEAP_MAGIC {
            log::warn!("heap: free of stale pointer {ptr:?}");
            return;
        }
        if block.free {
            log::warn!("heap: double free of {ptr:?}");
            return;
        }

        self.used -= block.size + HEADER_SIZE;
        self.nodes[usize::from(i)].free = true;

        // Merge with directly following free blocks.
        while let Some(j) = self.nodes[usize::from(i)].next {
            let next = self.nodes[usize::from(j)];
            if !next.free {
                break;
            }
            let node = &mut self.nodes[usize::from(i)];
            node.size += next.size + HEADER_SIZE;
            node.next = next.next;
            self.retire(j);
        }
    }

    /// Payload size of the live allocation at `ptr`.
    #[must_use]
    pub fn block_size(&self, ptr: HeapPtr) -> Option<u32> {
        let block = self.nodes[usize::from(self.find(ptr)?)];
        (block.magic == HEAP_MAGIC && !block.free).then_some(block.size)
    }

    /// Number of blocks currently in the list.
    #[must_use]
    pub fn blocks(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.head;
        while let Some(i) = cursor {
            n += 1;
            cursor = self.nodes[usize::from(i)].next;
        }
        n
    }

    /// Arena slot whose block payload starts at `ptr`, live or retired.
    fn find(&self, ptr: HeapPtr) -> Option<u16> {
        let addr = ptr.0.as_u32();
        let live = {
            let mut cursor = self.head;
            let mut hit = None;
            while let Some(i) = cursor {
                let block = &self.nodes[usize::from(i)];
                if block.payload() == addr {
                    hit = Some(i);
                    break;
                }
                cursor = block.next;
            }
            hit
        };
        live.or_else(|| {
            self.nodes
                .iter()
                .position(|b| b.magic != HEAP_MAGIC && b.start != 0 && b.payload() == addr)
                .map(index)
        })
    }

    fn retire(&mut self, j: u16) {
        let node = &mut self.nodes[usize::from(j)];
        node.magic = 0;
        node.free = false;
        node.next = self.spare;
        self.spare = Some(j);
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn index(i: usize) -> u16 {
    i as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(size: u32) -> FreeListHeap {
        FreeListHeap::new(VirtualAddress::new(0x10_0000), size)
    }

    #[test]
    fn starts_with_one_free_block() {
        let h = heap(4096);
        assert_eq!(h.used(), HEADER_SIZE);
        assert_eq!(h.size(), 4096);
        assert_eq!(h.blocks(), 1);
    }

    #[test]
    fn alloc_then_free_restores_used() {
        let mut h = heap(4096);
        let before = h.used();
        let p = h.alloc(100).unwrap();
        assert_eq!(p.addr().as_u32(), 0x10_0000 + HEADER_SIZE);
        assert_eq!(h.used(), before + 100 + HEADER_SIZE);
        assert_eq!(h.block_size(p), Some(100));
        h.free(p);
        assert_eq!(h.used(), before);
        assert_eq!(h.blocks(), 1);
    }

    #[test]
    fn allocations_are_first_fit_and_ascending() {
        let mut h = heap(4096);
        let a = h.alloc(32).unwrap();
        let b = h.alloc(64).unwrap();
        assert_eq!(b.addr().as_u32(), a.addr().as_u32() + 32 + HEADER_SIZE);
        h.free(a);
        let c = h.alloc(16).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn freeing_adjacent_blocks_merges_them() {
        let mut h = heap(4096);
        let a = h.alloc(40).unwrap();
        let b = h.alloc(24).unwrap();
        let guard = h.alloc(8).unwrap();

        h.free(b);
        h.free(a);
        assert_eq!(h.block_size(a), None);
        let merged = h.alloc(40 + 24 + HEADER_SIZE).unwrap();
        assert_eq!(merged, a);
        assert_eq!(h.block_size(merged), Some(40 + 24 + HEADER_SIZE));
        h.free(guard);
    }

    #[test]
    fn zero_length_requests_get_one_byte() {
        let mut h = heap(4096);
        let p = h.alloc(0).unwrap();
        assert_eq!(h.block_size(p), Some(1));
    }

    #[test]
    fn small_remainders_are_not_split() {
        let mut h = heap(4096);
        let a = h.alloc(100).unwrap();
        let _b = h.alloc(200).unwrap();
        h.free(a);
        assert_eq!(h.blocks(), 3);

        let p = h.alloc(90).unwrap();
        assert_eq!(p, a);
        assert_eq!(h.block_size(p), Some(100));
        assert_eq!(h.blocks(), 3);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut h = heap(256);
        assert_eq!(h.alloc(1000), Err(HeapError::OutOfMemory));
        let _ = h.alloc(200).unwrap();
        assert_eq!(h.alloc(8), Err(HeapError::OutOfMemory));
        assert!(h.used() <= h.size());
    }

    #[test]
    fn bogus_frees_are_ignored() {
        let mut h = heap(4096);
        let p = h.alloc(10).unwrap();
        let used = h.used();
        h.free(HeapPtr(VirtualAddress::new(0xDEAD_0000)));
        h.free(p);
        h.free(p);
        assert_eq!(h.used(), used - 10 - HEADER_SIZE);
    }

    #[test]
    fn stale_pointer_after_merge_is_ignored() {
        let mut h = heap(4096);
        let a = h.alloc(10).unwrap();
        let b = h.alloc(10).unwrap();
        h.free(b);
        h.free(a);
        let used = h.used();
        h.free(b);
        assert_eq!(h.used(), used);
    }

    #[test]
    fn node_exhaustion_is_out_of_memory() {
        let mut h = heap(1 << 20);
        let mut live = 0;
        while h.alloc(1).is_ok() {
            live += 1;
        }
        assert_eq!(live, MAX_BLOCKS - 1);
    }
}
