//! # Kernel synchronization primitives
//!
//! The kernel runs on a single hardware thread; the only thing that can
//! interleave with kernel code is the scheduler's timer tick. Critical
//! sections that touch scheduler state switch preemption off, see
//! [`PreemptGuard`]. Shared allocator state sits behind a [`SpinLock`].

#![cfg_attr(not(any(test, doctest)), no_std)]

mod preempt;
mod spin_lock;

pub use preempt::{PreemptFlag, PreemptGuard, Preemption};
pub use spin_lock::{SpinLock, SpinLockGuard};
