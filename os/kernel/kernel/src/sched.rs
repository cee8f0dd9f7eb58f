//! # Scheduler seam
//!
//! The run queue and its switching policy live outside this crate. The
//! process manager hands it a [`ProcessHandle`] once a process is runnable
//! and takes it back on removal.

use crate::process::Pid;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::Preemption;

/// What the scheduler needs to dispatch a process's main thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: Pid,
    /// Directory to load into `CR3` before switching to the thread.
    pub directory: PhysicalPage<Size4K>,
    /// Kernel stack pointer at the thread's initial interrupt frame.
    pub kernel_stack: VirtualAddress,
    /// Top of the kernel stack page, for the TSS.
    pub kernel_stack_top: VirtualAddress,
}

/// The scheduler as seen by the process manager.
///
/// Methods take `&self`: the scheduler is a kernel-global and is only
/// touched with preemption disabled.
pub trait Scheduler: Preemption {
    /// Add a runnable process.
    fn register(&self, process: ProcessHandle);

    /// Drop the process from the run queue.
    fn deregister(&self, pid: Pid);

    /// The process currently running, if any.
    fn current(&self) -> Option<Pid>;
}
