//! # Processes and threads
//!
//! A process owns an address space (or runs in the kernel's) and a list of
//! threads. Its record lives on the kernel heap. Lifecycle:
//!
//! ```text
//! New ──(every setup step succeeded)──▶ Active ──(end_proc)──▶ Stopped
//!  │                                                            ▲
//!  └──────────────────(any setup step failed)───────────────────┘
//! ```
//!
//! Processes that fail during setup are never registered with the
//! scheduler; their resources are released before the error is returned.

pub mod layout;
pub mod manager;
pub mod thread;

pub use manager::ProcessManager;
pub use thread::{InterruptFrame, Thread};

use crate::elf::ElfError;
use crate::sched::ProcessHandle;
use alloc::collections::TryReserveError;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::num::NonZeroU32;
use kernel_alloc::free_list::HeapError;
use kernel_alloc::vmm::VmmError;
use kernel_vmem::{AddressSpace, SpaceRef};

/// Process identifier; never zero.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(NonZeroU32);

impl Pid {
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Option<Self> {
        match NonZeroU32::new(value) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessState {
    New,
    Active,
    Stopped,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("heap exhausted")]
    OutOfMemory(#[from] HeapError),
    #[error("mapping failed: {0}")]
    Mapping(#[from] VmmError),
    #[error("invalid executable: {0}")]
    InvalidImage(#[from] ElfError),
    #[error("too many arguments")]
    TooManyArguments,
    #[error("no free kernel thread slot")]
    NoKernelThreadSlot,
    #[error("no such process")]
    NoSuchProcess,
}

impl From<TryReserveError> for ProcessError {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory(HeapError::OutOfMemory)
    }
}

/// Where a process's mappings live.
#[derive(Debug)]
pub enum ProcessSpace {
    /// A user process's own directory.
    Owned(AddressSpace),
    /// A kernel process running in the master directory.
    Kernel,
}

impl ProcessSpace {
    /// The directory to walk, given the kernel's.
    #[must_use]
    pub fn handle(&self, kernel: SpaceRef) -> SpaceRef {
        match self {
            Self::Owned(space) => space.handle(),
            Self::Kernel => kernel,
        }
    }
}

pub struct Process {
    pub(crate) pid: Pid,
    pub(crate) name: String,
    pub(crate) state: ProcessState,
    pub(crate) space: ProcessSpace,
    pub(crate) threads: Vec<Thread>,
}

impl Process {
    #[inline]
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    #[inline]
    #[must_use]
    pub const fn space(&self) -> &ProcessSpace {
        &self.space
    }

    #[inline]
    #[must_use]
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    #[inline]
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    #[must_use]
    pub fn main_thread(&self) -> Option<&Thread> {
        self.threads.iter().find(|t| t.is_main())
    }

    #[inline]
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        matches!(self.space, ProcessSpace::Kernel)
    }

    /// The scheduler's view of this process.
    pub(crate) fn handle(&self, kernel: SpaceRef) -> Option<ProcessHandle> {
        let main = self.main_thread()?;
        Some(ProcessHandle {
            pid: self.pid,
            directory: self.space.handle(kernel).directory(),
            kernel_stack: main.esp_kernel(),
            kernel_stack_top: main.stack_kernel_limit(),
        })
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("threads", &self.threads.len())
            .finish_non_exhaustive()
    }
}
