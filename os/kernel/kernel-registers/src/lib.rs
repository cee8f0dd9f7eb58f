//! # Typed IA-32 Control Registers
//!
//! Only the registers the memory manager touches are modeled: [`cr0::Cr0`]
//! (paging enable) and [`cr3::Cr3`] (page-directory base). [`cpu::halt`] parks
//! a processor with interrupts enabled. Raw register access is only compiled
//! with the `asm` feature on an `x86` target.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cpu;

#[cfg(feature = "cr0")]
pub mod cr0;

#[cfg(feature = "cr3")]
pub mod cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}
