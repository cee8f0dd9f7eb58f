//! Processor control that has no register to model.

/// Enable interrupts and halt until the next one, forever.
///
/// Used when the current thread has nothing left to run and waits for the
/// scheduler to switch away. Without the `asm` feature on `x86` this spins.
pub fn halt() -> ! {
    loop {
        #[cfg(all(feature = "asm", target_arch = "x86"))]
        // SAFETY: ring 0; resumes after the next interrupt.
        unsafe {
            core::arch::asm!("sti; hlt", options(nomem, nostack));
        }
        #[cfg(not(all(feature = "asm", target_arch = "x86")))]
        core::hint::spin_loop();
    }
}
