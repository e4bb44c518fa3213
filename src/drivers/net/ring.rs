//! Descriptor Ring and Ownership Protocol
//!
//! A [`DescriptorRing`] is N hardware descriptors in one DMA region plus a
//! software tag per slot:
//!
//! ```text
//!            Begin                    End
//!              v                       v
//! +------+------+------+------+------+------+------+------+
//! | Free | Done | Own  | Own  | Own  | Free | Free | Free |
//! +------+------+------+------+------+------+------+------+
//!              \_______ in_flight = 4 _______/
//! ```
//!
//! - `Free`: software owns the slot and nothing is attached to it
//! - `DeviceOwned`: handed to hardware; software must not touch it
//! - `Complete`: hardware released it; software may read status
//!
//! `in_flight` counts every slot that is not `Free`, so
//! `(End - Begin) mod N == in_flight mod N` always holds and `in_flight`
//! tells a full ring from an empty one.
//!
//! ## Ordering
//!
//! Handing a slot to the device is always: codec writes buffer/length/flags,
//! a release fence, then the ownership write. Observing a released slot is:
//! ownership read, then an acquire fence before any status read.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{fence, Ordering};

use crate::drivers::net::backend::{Descriptor, RxDescriptor, TxDescriptor, TxRequest};
use crate::drivers::net::platform::{DmaRegion, PhysicalAddress, Platform};

/// Software tag for one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    DeviceOwned,
    Complete,
}

/// Result of inspecting a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reap {
    /// Hardware has released the slot
    Done,
    /// Hardware still owns the slot
    Owned,
    /// Nothing is posted in the slot
    Vacant,
}

/// The ring's DMA region could not be allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingAllocError;

/// A circular array of hardware descriptors
pub struct DescriptorRing<D> {
    region: Option<DmaRegion>,
    descriptors: NonNull<D>,
    states: Vec<SlotState>,
    begin: usize,
    end: usize,
    in_flight: usize,
    suspend_gap: bool,
    platform: Arc<dyn Platform>,
}

// SAFETY: The ring exclusively owns its DMA region; descriptors are only
// reached through `&mut self`.
unsafe impl<D: Send> Send for DescriptorRing<D> {}

impl<D: Descriptor> DescriptorRing<D> {
    /// Allocate and link a ring of `capacity` descriptors
    ///
    /// With `suspend_gap`, at most `capacity - 1` slots are ever in flight.
    pub fn new(
        platform: Arc<dyn Platform>,
        capacity: usize,
        align: usize,
        suspend_gap: bool,
    ) -> Result<Self, RingAllocError> {
        if capacity < 2 {
            return Err(RingAllocError);
        }

        let stride = size_of::<D>();
        let region = platform
            .dma_allocate(stride * capacity, align)
            .ok_or(RingAllocError)?;
        let descriptors = NonNull::new(region.as_ptr() as *mut D).ok_or(RingAllocError)?;
        let base = region.physical();

        let mut ring = Self {
            region: Some(region),
            descriptors,
            states: vec![SlotState::Free; capacity],
            begin: 0,
            end: 0,
            in_flight: 0,
            suspend_gap,
            platform,
        };

        for slot in 0..capacity {
            let next = (slot + 1) % capacity;
            let own = base + (slot * stride) as PhysicalAddress;
            let next_phys = base + (next * stride) as PhysicalAddress;
            ring.descriptor_mut(slot).link(own, next_phys, slot == capacity - 1);
        }

        Ok(ring)
    }

    pub fn capacity(&self) -> usize {
        self.states.len()
    }

    /// Most slots that may be in flight at once
    pub fn limit(&self) -> usize {
        if self.suspend_gap {
            self.capacity() - 1
        } else {
            self.capacity()
        }
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    /// Device address of the first descriptor
    pub fn base(&self) -> PhysicalAddress {
        self.region.as_ref().map_or(0, DmaRegion::physical)
    }

    /// Descriptor memory in bytes
    pub fn bytes(&self) -> usize {
        self.capacity() * size_of::<D>()
    }

    /// Device address of `slot`'s descriptor
    pub fn physical(&self, slot: usize) -> PhysicalAddress {
        self.base() + (slot * size_of::<D>()) as PhysicalAddress
    }

    pub fn next(&self, slot: usize) -> usize {
        (slot + 1) % self.capacity()
    }

    fn previous(&self, slot: usize) -> usize {
        (slot + self.capacity() - 1) % self.capacity()
    }

    pub fn descriptor(&self, slot: usize) -> &D {
        assert!(slot < self.capacity());
        // SAFETY: slot is in bounds and the region holds `capacity` D's
        unsafe { &*self.descriptors.as_ptr().add(slot) }
    }

    pub(crate) fn descriptor_mut(&mut self, slot: usize) -> &mut D {
        assert!(slot < self.capacity());
        // SAFETY: As in `descriptor`, with exclusivity from `&mut self`
        unsafe { &mut *self.descriptors.as_ptr().add(slot) }
    }

    /// Inspect `slot` without changing its ownership
    ///
    /// A device-owned slot whose descriptor has been released is latched as
    /// `Complete` so later inspections agree even if the device reuses the
    /// ownership bit.
    pub fn reap(&mut self, slot: usize) -> Reap {
        match self.states[slot] {
            SlotState::Free => Reap::Vacant,
            SlotState::Complete => Reap::Done,
            SlotState::DeviceOwned => {
                if self.descriptor(slot).released() {
                    fence(Ordering::Acquire);
                    self.states[slot] = SlotState::Complete;
                    Reap::Done
                } else {
                    Reap::Owned
                }
            }
        }
    }
}

impl<D: TxDescriptor> DescriptorRing<D> {
    /// Slot `End` can take another packet
    pub fn has_room(&self) -> bool {
        self.in_flight < self.limit() && self.states[self.end] == SlotState::Free
    }

    /// Program the next free slot and hand it to the device
    ///
    /// Returns the slot used, or `None` if the ring is full.
    pub fn post(&mut self, request: &TxRequest) -> Option<usize> {
        if !self.has_room() {
            return None;
        }

        let slot = self.end;
        let descriptor = self.descriptor_mut(slot);
        descriptor.prepare(request);
        fence(Ordering::Release);
        descriptor.give_to_device();

        let previous = self.previous(slot);
        self.descriptor_mut(previous).resume_chain();

        self.states[slot] = SlotState::DeviceOwned;
        self.end = self.next(slot);
        self.in_flight += 1;
        Some(slot)
    }

    /// Free the slot at `Begin` once it has completed
    ///
    /// Returns the slot that was freed.
    pub fn retire(&mut self) -> Option<usize> {
        let slot = self.begin;
        if self.states[slot] != SlotState::Complete {
            return None;
        }

        self.descriptor_mut(slot).clear();
        self.states[slot] = SlotState::Free;
        self.begin = self.next(slot);
        self.in_flight -= 1;
        Some(slot)
    }
}

impl<D: RxDescriptor> DescriptorRing<D> {
    /// Arm slot `End` with an empty buffer; used while building the ring
    pub fn fill(&mut self, buffer: PhysicalAddress, capacity: usize) -> Option<usize> {
        let slot = self.end;
        if self.in_flight == self.capacity() || self.states[slot] != SlotState::Free {
            return None;
        }

        self.arm(slot, buffer, capacity);
        self.states[slot] = SlotState::DeviceOwned;
        self.end = self.next(slot);
        self.in_flight += 1;
        Some(slot)
    }

    /// Re-arm `slot` with its buffer
    ///
    /// Returns `false`, touching nothing, if the device already owns the slot.
    pub fn recycle(&mut self, slot: usize, buffer: PhysicalAddress, capacity: usize) -> bool {
        match self.states[slot] {
            SlotState::DeviceOwned => false,
            state => {
                self.arm(slot, buffer, capacity);
                if state == SlotState::Free {
                    self.in_flight += 1;
                }
                self.states[slot] = SlotState::DeviceOwned;
                true
            }
        }
    }

    /// Rotate a full receive ring past its oldest slot
    ///
    /// The slot at `Begin` must have been recycled; it becomes the newest
    /// posted slot.
    pub fn advance(&mut self) {
        debug_assert_eq!(self.states[self.begin], SlotState::DeviceOwned);
        debug_assert_eq!(self.in_flight, self.capacity());
        self.begin = self.next(self.begin);
        self.end = self.begin;
    }

    fn arm(&mut self, slot: usize, buffer: PhysicalAddress, capacity: usize) {
        let descriptor = self.descriptor_mut(slot);
        RxDescriptor::prepare(descriptor, buffer, capacity);
        fence(Ordering::Release);
        RxDescriptor::give_to_device(descriptor);

        // The newly armed slot takes over as the end of the receive chain
        let previous = self.previous(slot);
        self.descriptor_mut(previous).resume_chain();
    }
}

impl<D> Drop for DescriptorRing<D> {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.platform.dma_free(region);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::net::packet::PacketFlags;
    use crate::drivers::net::sim::{SimPlatform, SimRxDescriptor, SimTxDescriptor};
    use proptest::prelude::*;

    fn request(buffer: PhysicalAddress) -> TxRequest {
        TxRequest {
            buffer,
            length: 64,
            flags: PacketFlags::empty(),
            interrupt: false,
        }
    }

    fn tx_ring(capacity: usize, gap: bool) -> DescriptorRing<SimTxDescriptor> {
        DescriptorRing::new(Arc::new(SimPlatform::new()), capacity, 16, gap).unwrap()
    }

    fn rx_ring(capacity: usize) -> DescriptorRing<SimRxDescriptor> {
        let mut ring =
            DescriptorRing::new(Arc::new(SimPlatform::new()), capacity, 16, false).unwrap();
        for slot in 0..capacity {
            assert_eq!(ring.fill(0x1000 * slot as u64, 1536), Some(slot));
        }
        ring
    }

    fn check_invariants<D: Descriptor>(ring: &DescriptorRing<D>) {
        let n = ring.capacity();
        let owned = ring
            .states
            .iter()
            .filter(|s| **s != SlotState::Free)
            .count();
        assert_eq!(owned, ring.in_flight());
        assert!(ring.in_flight() <= ring.limit());
        assert_eq!((ring.end() + n - ring.begin()) % n, ring.in_flight() % n);
    }

    #[test]
    fn test_last_descriptor_links_to_first() {
        let ring = tx_ring(4, false);
        for slot in 0..4 {
            let expected = ring.physical((slot + 1) % 4);
            assert_eq!(ring.descriptor(slot).next_link(), expected);
        }
        assert!(ring.descriptor(3).is_last());
        assert!(!ring.descriptor(2).is_last());
    }

    #[test]
    fn test_post_sets_ownership_and_fields() {
        let mut ring = tx_ring(4, false);

        assert_eq!(ring.post(&request(0xABC0)), Some(0));
        assert_eq!(ring.state(0), SlotState::DeviceOwned);
        assert!(ring.descriptor(0).device_owned());
        assert_eq!(ring.descriptor(0).buffer(), 0xABC0);
        assert_eq!(ring.reap(0), Reap::Owned);
        assert_eq!(ring.reap(1), Reap::Vacant);
    }

    #[test]
    fn test_full_ring_refuses_post() {
        let mut ring = tx_ring(4, false);
        for _ in 0..4 {
            assert!(ring.post(&request(0)).is_some());
        }
        assert_eq!(ring.post(&request(0)), None);
        assert_eq!(ring.begin(), ring.end());
        assert_eq!(ring.in_flight(), 4);
    }

    #[test]
    fn test_suspend_gap_keeps_one_slot() {
        let mut ring = tx_ring(4, true);
        for _ in 0..3 {
            assert!(ring.post(&request(0)).is_some());
        }
        assert_eq!(ring.post(&request(0)), None);
        assert_eq!(ring.state(3), SlotState::Free);
    }

    #[test]
    fn test_retire_follows_fifo_order() {
        let mut ring = tx_ring(4, false);
        ring.post(&request(0));
        ring.post(&request(0));

        // Completing slot 1 first does not let it retire ahead of slot 0
        ring.descriptor_mut(1).device_complete(0);
        assert_eq!(ring.reap(ring.begin()), Reap::Owned);
        assert_eq!(ring.retire(), None);

        ring.descriptor_mut(0).device_complete(0);
        assert_eq!(ring.reap(ring.begin()), Reap::Done);
        assert_eq!(ring.retire(), Some(0));
        assert_eq!(ring.reap(ring.begin()), Reap::Done);
        assert_eq!(ring.retire(), Some(1));
        assert_eq!(ring.in_flight(), 0);
        check_invariants(&ring);
    }

    #[test]
    fn test_recycle_is_idempotent() {
        let mut ring = rx_ring(4);

        assert!(!ring.recycle(0, 0x9000, 1536));
        assert_eq!(ring.in_flight(), 4);

        ring.descriptor_mut(0).device_receive(60, 0);
        assert_eq!(ring.reap(0), Reap::Done);
        assert!(ring.recycle(0, 0x9000, 1536));
        assert!(!ring.recycle(0, 0x9000, 1536));
        assert_eq!(ring.state(0), SlotState::DeviceOwned);
        ring.advance();

        assert_eq!(ring.begin(), 1);
        assert_eq!(ring.in_flight(), 4);
        check_invariants(&ring);
    }

    #[derive(Debug, Clone)]
    enum TxOp {
        Post,
        Complete,
        Retire,
    }

    fn tx_op() -> impl Strategy<Value = TxOp> {
        prop_oneof![Just(TxOp::Post), Just(TxOp::Complete), Just(TxOp::Retire)]
    }

    proptest! {
        #[test]
        fn prop_tx_ring_invariants(
            capacity in 2usize..17,
            gap in any::<bool>(),
            ops in proptest::collection::vec(tx_op(), 0..200),
        ) {
            let mut ring = tx_ring(capacity, gap);
            let mut device_cursor = 0usize;

            for op in ops {
                match op {
                    TxOp::Post => {
                        let room = ring.has_room();
                        prop_assert_eq!(ring.post(&request(0)).is_some(), room);
                    }
                    TxOp::Complete => {
                        // The device completes strictly in ring order
                        if ring.state(device_cursor) == SlotState::DeviceOwned {
                            ring.descriptor_mut(device_cursor).device_complete(0);
                            device_cursor = ring.next(device_cursor);
                        }
                    }
                    TxOp::Retire => {
                        let begin = ring.begin();
                        if ring.reap(begin) == Reap::Done {
                            prop_assert_eq!(ring.retire(), Some(begin));
                        } else {
                            prop_assert_eq!(ring.retire(), None);
                        }
                    }
                }
                check_invariants(&ring);
            }
        }

        #[test]
        fn prop_rx_ring_stays_full(
            capacity in 2usize..17,
            frames in 0usize..100,
        ) {
            let mut ring = rx_ring(capacity);
            for i in 0..frames {
                let slot = ring.begin();
                ring.descriptor_mut(slot).device_receive(64 + i % 64, 0);
                prop_assert_eq!(ring.reap(slot), Reap::Done);
                prop_assert!(ring.recycle(slot, 0x1000 * slot as u64, 1536));
                ring.advance();
                check_invariants(&ring);
                prop_assert_eq!(ring.in_flight(), capacity);
            }
        }
    }
}
