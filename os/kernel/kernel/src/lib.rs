//! # Kernel Process Core
//!
//! Processes, threads and executable loading for the 32-bit kernel, on top
//! of the VMM and heap in `kernel-alloc`.
//!
//! ```text
//!          start_process(name, args)
//!                    │
//!   ┌────────────────▼─────────────────┐      ┌──────────────┐
//!   │          ProcessManager          ├─────►│  Scheduler   │
//!   │  records on the kernel heap      │      └──────────────┘
//!   └──────┬──────────────────┬────────┘
//!          │                  │
//!   ┌──────▼──────┐    ┌──────▼──────┐      ┌──────────────┐
//!   │  ELF loader ├───►│     VMM     │      │  FileSystem  │
//!   └──────┬──────┘    └─────────────┘      └──────▲───────┘
//!          └───────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! * [`process`]: process and thread records, the slot layout above the
//!   image and the [`ProcessManager`](process::ProcessManager).
//! * [`elf`]: ELF32 validation and segment loading.
//! * [`sched`] / [`fs`]: the seams to the scheduler and the VFS.
//! * [`allocator`]: the global allocator over the kernel heap window.
//! * [`logger`]: `log` backend writing to the kernel console.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod allocator;
pub mod elf;
pub mod fs;
pub mod logger;
pub mod process;
pub mod sched;

#[cfg(test)]
mod test_support;
