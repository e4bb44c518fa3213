//! Interrupt-safe spinlock
//!
//! `Mutex` masks local interrupts for as long as the lock is held. Engine
//! state touched only from thread and worker context uses plain
//! `spin::Mutex`; this lock is for the few places the interrupt handler also
//! needs exclusive access, such as an indexed register window where the
//! handler's "select register, read data port" pair must not interleave with
//! the worker's.
//!
//! ```text
//! 1. Worker writes RAP = 34 (select BCR34)
//! 2. Interrupt fires, handler writes RAP = 0 to read CSR0
//! 3. Worker reads BDP, expecting BCR34, gets garbage
//! ```
//!
//! On bare-metal aarch64 the IRQ mask bit in DAIF is set on lock and restored
//! on unlock. On other targets (host tests, the simulator) there is no
//! interrupt context to mask and the lock is an ordinary spinlock.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Spinlock that disables interrupts while locked
///
/// # Example
/// ```ignore
/// let window = Mutex::new(());
///
/// let _guard = window.lock();
/// regs.write32(RAP, csr);
/// let value = regs.read32(RDP);
/// // Interrupts restored when the guard drops
/// ```
pub struct Mutex<T> {
    inner: UnsafeCell<T>,
    locked: AtomicBool,
}

// SAFETY: Access to `inner` is serialized by the `locked` flag, and local
// interrupts are masked while the guard lives, so an interrupt handler on the
// same CPU cannot observe the data mid-update.
unsafe impl<T: Send> Sync for Mutex<T> {}
unsafe impl<T: Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: UnsafeCell::new(value),
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, masking interrupts first
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let irq_state = IrqState::disable();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        MutexGuard {
            mutex: self,
            irq_state,
        }
    }
}

/// Guard returned by [`Mutex::lock`]
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    irq_state: IrqState,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Lock is held, so we have exclusive access
        unsafe { &*self.mutex.inner.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Lock is held, so we have exclusive access
        unsafe { &mut *self.mutex.inner.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
        self.irq_state.restore();
    }
}

/// Saved DAIF value (bare-metal aarch64)
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
struct IrqState {
    daif: u64,
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
impl IrqState {
    fn disable() -> Self {
        let daif: u64;

        // SAFETY: DAIF is readable and writable at EL1. `daifset #2` masks
        // IRQs only; the previous value is kept for `restore`.
        unsafe {
            core::arch::asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack));
            core::arch::asm!("msr daifset, #2", options(nomem, nostack));
        }

        Self { daif }
    }

    fn restore(&self) {
        // SAFETY: Writes back the value read in `disable`
        unsafe {
            core::arch::asm!("msr daif, {}", in(reg) self.daif, options(nomem, nostack));
        }
    }
}

/// No interrupt context to mask on hosted targets
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
struct IrqState;

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
impl IrqState {
    fn disable() -> Self {
        IrqState
    }

    fn restore(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_serializes_updates() {
        let counter = Arc::new(Mutex::new(0u32));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.lock(), 4000);
    }
}
