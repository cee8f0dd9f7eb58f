use core::ops::Deref;
use core::sync::atomic::{AtomicBool, Ordering};

/// Switch for the scheduler's preemption.
pub trait Preemption {
    /// Turn preemption off, returning whether it was on.
    fn disable(&self) -> bool;

    /// Turn preemption on.
    fn enable(&self);
}

/// The scheduler's global preemption flag.
///
/// The timer tick only switches threads while the flag is set.
pub struct PreemptFlag {
    /// * `true`: the tick may switch threads
    /// * `false`: the running thread keeps the CPU
    enabled: AtomicBool,
}

impl PreemptFlag {
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl Default for PreemptFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Preemption for PreemptFlag {
    #[inline]
    fn disable(&self) -> bool {
        self.enabled.swap(false, Ordering::AcqRel)
    }

    #[inline]
    fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }
}

impl<P: Preemption + ?Sized> Preemption for &P {
    fn disable(&self) -> bool {
        (**self).disable()
    }

    fn enable(&self) {
        (**self).enable();
    }
}

/// RAII guard that disables preemption on creation and restores it on drop.
///
/// Preemption is only re-enabled if it was enabled when the guard was taken,
/// so guards nest.
///
/// # Examples
///
/// ```
/// use kernel_sync::{PreemptFlag, PreemptGuard};
///
/// let flag = PreemptFlag::new(true);
/// {
///     let _g = PreemptGuard::new(&flag);
///     assert!(!flag.is_enabled());
/// }
/// assert!(flag.is_enabled());
/// ```
#[must_use = "preemption is restored as soon as the guard is dropped"]
pub struct PreemptGuard<'a, P: Preemption + ?Sized> {
    gate: &'a P,
    /// Whether preemption was enabled when the guard was created.
    was_enabled: bool,
}

impl<'a, P: Preemption + ?Sized> PreemptGuard<'a, P> {
    #[inline]
    pub fn new(gate: &'a P) -> Self {
        let was_enabled = gate.disable();
        Self { gate, was_enabled }
    }

    /// Whether dropping the guard turns preemption back on.
    #[inline]
    #[must_use]
    pub const fn was_enabled(&self) -> bool {
        self.was_enabled
    }
}

impl<P: Preemption + ?Sized> Deref for PreemptGuard<'_, P> {
    type Target = P;

    fn deref(&self) -> &P {
        self.gate
    }
}

impl<P: Preemption + ?Sized> Drop for PreemptGuard<'_, P> {
    fn drop(&mut self) {
        if self.was_enabled {
            self.gate.enable();
        }
    }
}
