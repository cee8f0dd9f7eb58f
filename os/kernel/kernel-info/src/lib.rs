//! # Kernel Configuration and ABI Constants
//!
//! This crate is the single source of truth for the fixed physical/virtual
//! memory layout of the 32-bit kernel and for the register values a freshly
//! created thread starts with.
//!
//! ## Architecture
//!
//! ### Memory Layout ([`memory`])
//! Establishes where the kernel keeps its structures:
//! * **Identity Map**: the first 4 MiB are mapped 1:1 into every address space
//! * **Kernel Heap**: the global allocator serves process and thread records between the kernel image and [`memory::KERNEL_HEAP_END`]
//! * **Page-Table Pool**: all page tables come from a dedicated physical window
//! * **Scratch Windows**: staging page and ELF staging window used while loading
//!
//! ```text
//! Physical / Kernel Virtual Layout (identity mapped below 4 MiB):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Kernel image, then kernel heap │
//! 0x0020_0000 ├─────────────────────────────────┤ PAGE_TABLE_POOL_BASE / KERNEL_HEAP_END
//!             │  Page-table pool (512 tables)   │
//! 0x0040_0000 ├─────────────────────────────────┤ RETURN_ADDR (user-visible trampoline page)
//! 0x0040_5000 ├─────────────────────────────────┤ KERNEL_THREAD_BASE
//!             │  Kernel thread stack slots      │
//! 0x0060_0000 ├─────────────────────────────────┤ STAGING_PAGE
//! 0x0070_0000 ├─────────────────────────────────┤ ELF_STAGING_BASE (1 MiB)
//! 0x0100_0000 ├─────────────────────────────────┤ FRAME_POOL_START
//!             │  Physical frames for mappings   │
//!             └─────────────────────────────────┘
//! ```
//!
//! ### Thread ABI ([`abi`])
//! Segment selectors, the initial `EFLAGS` value and the per-thread slot
//! geometry used when building the first stack frames of a thread.
//!
//! All values are `const` and guarded by compile-time assertions.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod abi;
pub mod memory;
