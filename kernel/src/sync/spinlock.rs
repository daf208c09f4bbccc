//! IRQ-safe spinlock with automatic interrupt disable/restore.
//!
//! The raw spinning is delegated to `spin::Mutex`; this wrapper disables
//! interrupts before acquiring and restores the previous interrupt state
//! when the guard drops, so a lock taken in thread context can also be
//! taken from an interrupt handler without self-deadlock on one CPU.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use crate::arch::hal;

/// An IRQ-safe spinlock protecting data of type `T`.
pub struct Spinlock<T> {
    inner: spin::Mutex<T>,
}

/// RAII guard for a held [`Spinlock`].
///
/// Provides `Deref`/`DerefMut` access to the protected data. On drop,
/// releases the lock and then restores the interrupt state that was saved
/// at acquisition time.
pub struct SpinlockGuard<'a, T> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    irq_was_enabled: bool,
}

impl<T> Spinlock<T> {
    /// Create a new unlocked spinlock wrapping the given data.
    pub const fn new(data: T) -> Self {
        Spinlock { inner: spin::Mutex::new(data) }
    }

    /// Acquire the lock, spinning until it becomes available.
    ///
    /// Interrupts are disabled before the first acquisition attempt so an
    /// IRQ arriving mid-critical-section cannot re-enter the same lock.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let was_enabled = hal::interrupts_enabled();
        hal::disable_interrupts();
        SpinlockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            irq_was_enabled: was_enabled,
        }
    }

    /// Try to acquire the lock without spinning.
    ///
    /// Returns `Some(guard)` on success; restores the interrupt state and
    /// returns `None` if the lock is held.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        let was_enabled = hal::interrupts_enabled();
        hal::disable_interrupts();
        match self.inner.try_lock() {
            Some(g) => Some(SpinlockGuard {
                guard: ManuallyDrop::new(g),
                irq_was_enabled: was_enabled,
            }),
            None => {
                if was_enabled {
                    hal::enable_interrupts();
                }
                None
            }
        }
    }

    /// Check if this lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<'a, T> Deref for SpinlockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for SpinlockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T> Drop for SpinlockGuard<'a, T> {
    fn drop(&mut self) {
        // Release the lock before touching the interrupt flag. For nested
        // locks the inner guard saved IF=0 and restores nothing; only the
        // outermost guard re-enables interrupts.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        if self.irq_was_enabled {
            hal::enable_interrupts();
        }
    }
}
