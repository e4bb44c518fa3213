//! OS services consumed by the engine
//!
//! The engine never calls into a specific kernel. Deferred work, the link
//! timer, DMA-capable memory and the clock are reached through [`Platform`],
//! which the embedding kernel (or the host simulator) implements once.

use core::ptr::NonNull;

use crate::drivers::timer::Clock;

/// Bus address as seen by the device
pub type PhysicalAddress = u64;

/// Whether `len` bytes starting at `base` all sit at or below `limit`
pub fn dma_reachable(base: PhysicalAddress, len: usize, limit: PhysicalAddress) -> bool {
    match len.checked_sub(1) {
        None => base <= limit,
        Some(last) => base
            .checked_add(last as PhysicalAddress)
            .is_some_and(|end| end <= limit),
    }
}

/// Physically contiguous, device-visible memory
///
/// Returned zeroed by [`Platform::dma_allocate`] and handed back to
/// [`Platform::dma_free`]. The engine never frees a region while the device
/// may still be reading descriptors from it.
#[derive(Debug)]
pub struct DmaRegion {
    virt: NonNull<u8>,
    physical: PhysicalAddress,
    len: usize,
    align: usize,
}

// SAFETY: A region is exclusively owned memory; moving the handle between
// threads moves that ownership with it.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    /// Wrap a platform allocation
    ///
    /// # Safety
    ///
    /// `virt` must be valid for reads and writes of `len` bytes until the region
    /// is passed back to the platform, and `physical` must be the device view of
    /// the same memory.
    pub unsafe fn new(virt: NonNull<u8>, physical: PhysicalAddress, len: usize, align: usize) -> Self {
        Self {
            virt,
            physical,
            len,
            align,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    pub fn physical(&self) -> PhysicalAddress {
        self.physical
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn align(&self) -> usize {
        self.align
    }
}

/// The platform could not queue the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleError;

/// Kernel services the engine depends on
pub trait Platform: Clock + Send + Sync {
    /// Queue one run of the deferred worker
    ///
    /// Must be idempotent: scheduling while a run is already queued is a
    /// successful no-op.
    fn schedule_worker(&self) -> Result<(), ScheduleError>;

    /// Start (or restart) the periodic link timer
    ///
    /// Each expiry should call [`Engine::link_timer_tick`](crate::Engine::link_timer_tick).
    fn arm_link_timer(&self, period_us: u64) -> Result<(), ScheduleError>;

    fn cancel_link_timer(&self);

    /// Allocate zeroed, physically contiguous memory
    fn dma_allocate(&self, size: usize, align: usize) -> Option<DmaRegion>;

    /// Like [`dma_allocate`](Self::dma_allocate), for devices that can only
    /// address memory up to `limit`
    ///
    /// Platforms with a low-memory zone should override this; the default
    /// gives back any region that lands out of reach.
    fn dma_allocate_below(
        &self,
        size: usize,
        align: usize,
        limit: PhysicalAddress,
    ) -> Option<DmaRegion> {
        let region = self.dma_allocate(size, align)?;
        if dma_reachable(region.physical(), region.len(), limit) {
            Some(region)
        } else {
            self.dma_free(region);
            None
        }
    }

    fn dma_free(&self, region: DmaRegion);

    /// Make device writes to `[physical, physical + len)` visible to the CPU
    fn dma_sync_for_cpu(&self, _physical: PhysicalAddress, _len: usize) {}

    /// Make CPU writes to `[physical, physical + len)` visible to the device
    fn dma_sync_for_device(&self, _physical: PhysicalAddress, _len: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::net::sim::SimPlatform;

    const LIMIT_32: PhysicalAddress = u32::MAX as PhysicalAddress;

    #[test]
    fn test_reachable_counts_the_last_byte() {
        assert!(dma_reachable(0xFFFF_F000, 0x1000, LIMIT_32));
        assert!(!dma_reachable(0xFFFF_F001, 0x1000, LIMIT_32));
        assert!(!dma_reachable(0x1_0010_0000, 16, LIMIT_32));
        assert!(dma_reachable(0x1_0010_0000, 0, PhysicalAddress::MAX));
    }

    #[test]
    fn test_reachable_rejects_wraparound() {
        assert!(dma_reachable(PhysicalAddress::MAX, 1, PhysicalAddress::MAX));
        assert!(!dma_reachable(PhysicalAddress::MAX, 2, PhysicalAddress::MAX));
    }

    #[test]
    fn test_allocation_below_limit_is_reachable() {
        let platform = SimPlatform::new();

        let region = platform.dma_allocate_below(64, 16, LIMIT_32).unwrap();
        assert!(dma_reachable(region.physical(), region.len(), LIMIT_32));
        assert_eq!(platform.last_bus(), region.physical());

        platform.dma_free(region);
        assert_eq!(platform.dma_regions(), 0);
    }

    #[test]
    fn test_unreachable_allocation_is_given_back() {
        let platform = SimPlatform::new();

        assert!(platform.dma_allocate_below(64, 16, 0xFFF).is_none());
        assert_eq!(platform.dma_regions(), 0);
    }
}
