//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Physical frame pools, the kernel heap and the virtual memory manager of
//! the 32-bit kernel.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Virtual Memory Manager (VMM)         │
//! │    • master directory, per-process spaces           │
//! │    • map / unmap / stage-and-alias                  │
//! └──────────┬─────────────────────────┬────────────────┘
//!            │                         │
//! ┌──────────▼──────────┐   ┌──────────▼──────────────┐
//! │  Physical Mapper    │   │ Frame Allocators        │
//! │  identity / hosted  │   │ data pool, table pool   │
//! └─────────────────────┘   └─────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────┐
//! │         Kernel heap (first-fit free list)           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! * [`frame_alloc`]: bitmap allocator over a fixed physical window. One
//!   instance hands out data frames, a second one page tables.
//! * [`free_list`]: the kernel heap, a first-fit list of blocks with headers
//!   and forward merging on free.
//! * [`phys_mapper`]: how the kernel reaches a physical frame: through the
//!   identity map on the target, through simulated RAM in hosted tests.
//! * [`vmm`]: address-space lifecycle and page mapping on top of the above.
//!
//! The heap and the VMM are independent: page tables come from their own pool
//! and never from the heap.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod frame_alloc;
pub mod free_list;
pub mod phys_mapper;
pub mod vmm;
