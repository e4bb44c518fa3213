//! Register access
//!
//! Backends talk to their device through [`Registers`], never raw pointers,
//! so their register sequences can run against a fake register file in
//! tests. [`Mmio`] is the real thing: volatile accesses at a fixed base.
//!
//! Port-I/O devices (the PCnet DWIO window on PC hardware) are expected to be
//! wrapped by the platform in a type implementing the same trait.

use alloc::sync::Arc;
use core::sync::atomic::{fence, Ordering};

use volatile::Volatile;

/// Byte-offset register window
pub trait Registers: Send + Sync {
    fn read8(&self, offset: usize) -> u8;
    fn read16(&self, offset: usize) -> u16;
    fn read32(&self, offset: usize) -> u32;

    fn write8(&self, offset: usize, value: u8);
    fn write16(&self, offset: usize, value: u16);
    fn write32(&self, offset: usize, value: u32);

    /// Read-modify-write of a 32-bit register
    fn modify32(&self, offset: usize, f: impl FnOnce(u32) -> u32)
    where
        Self: Sized,
    {
        let value = self.read32(offset);
        self.write32(offset, f(value));
    }
}

/// Memory-mapped register window
pub struct Mmio {
    base: usize,
    len: usize,
}

impl Mmio {
    /// # Safety
    ///
    /// `base..base + len` must be a mapped device register window that stays
    /// mapped for the lifetime of the returned value, with no other code
    /// accessing it concurrently except through this handle.
    pub const unsafe fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    fn register<T: Copy>(&self, offset: usize) -> *mut Volatile<T> {
        assert!(offset + core::mem::size_of::<T>() <= self.len);
        (self.base + offset) as *mut Volatile<T>
    }
}

// SAFETY: Register accesses are individually volatile; the constructor
// contract rules out aliasing mappings.
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Registers for Mmio {
    fn read8(&self, offset: usize) -> u8 {
        // SAFETY: in-bounds per `register`, valid per constructor contract
        unsafe { (*self.register::<u8>(offset)).read() }
    }

    fn read16(&self, offset: usize) -> u16 {
        // SAFETY: As in read8
        unsafe { (*self.register::<u16>(offset)).read() }
    }

    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: As in read8
        unsafe { (*self.register::<u32>(offset)).read() }
    }

    fn write8(&self, offset: usize, value: u8) {
        // Descriptor writes must land before the device is poked
        fence(Ordering::SeqCst);
        // SAFETY: As in read8
        unsafe { (*self.register::<u8>(offset)).write(value) }
    }

    fn write16(&self, offset: usize, value: u16) {
        fence(Ordering::SeqCst);
        // SAFETY: As in read8
        unsafe { (*self.register::<u16>(offset)).write(value) }
    }

    fn write32(&self, offset: usize, value: u32) {
        fence(Ordering::SeqCst);
        // SAFETY: As in read8
        unsafe { (*self.register::<u32>(offset)).write(value) }
    }
}

/// Shared register windows, e.g. a fake inspected by a test
impl<T: Registers> Registers for Arc<T> {
    fn read8(&self, offset: usize) -> u8 {
        (**self).read8(offset)
    }

    fn read16(&self, offset: usize) -> u16 {
        (**self).read16(offset)
    }

    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write8(&self, offset: usize, value: u8) {
        (**self).write8(offset, value)
    }

    fn write16(&self, offset: usize, value: u16) {
        (**self).write16(offset, value)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mmio_over_plain_memory() {
        let mut window = [0u32; 4];
        let regs = unsafe { Mmio::new(window.as_mut_ptr() as usize, 16) };

        regs.write32(4, 0xDEAD_BEEF);
        regs.modify32(4, |v| v & 0xFFFF);
        regs.write16(8, 0x1234);
        regs.write8(12, 0x56);

        assert_eq!(regs.read32(4), 0xBEEF);
        assert_eq!(regs.read16(8), 0x1234);
        assert_eq!(regs.read8(12), 0x56);
        drop(regs);
        assert_eq!(window[1], 0xBEEF);
    }

    #[test]
    #[should_panic]
    fn test_mmio_bounds_checked() {
        let mut window = [0u32; 1];
        let regs = unsafe { Mmio::new(window.as_mut_ptr() as usize, 4) };
        regs.read32(4);
    }
}
