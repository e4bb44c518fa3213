//! Transmit pipeline
//!
//! Packets move through four states:
//!
//! ```text
//! Queued --drain--> Posted --device--> Completed --reap--> Freed
//! ```
//!
//! `Queued` packets wait in a FIFO for a free slot. The FIFO and the ring
//! together form the *backlog*; when drop mode is on and the backlog is at
//! its cap, whole batches are refused and freed instead of queued.
//!
//! Completion interrupts are requested sparingly: on the descriptor that
//! brings the in-flight count to a threshold (half the ring unless
//! configured otherwise), and on the final descriptor
//! of a drain that empties the queue. Anything in between is picked up by
//! the next reap.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use log::trace;

use crate::drivers::net::backend::{TxDescriptor, TxRequest};
use crate::drivers::net::packet::{Packet, PacketAllocator};
use crate::drivers::net::platform::{PhysicalAddress, Platform};
use crate::drivers::net::ring::{DescriptorRing, Reap};

/// Descriptor-level transmit failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// DMA could not keep up with the wire
    Underrun,
    /// Collision after the first slot time
    LateCollision,
    /// Retry limit reached
    ExcessiveCollisions,
    /// Carrier lost during transmission
    CarrierLost,
    /// Frame exceeded the jabber timer
    Jabber,
    /// Hardware could not insert a requested checksum
    Checksum,
    /// Error summary with no more specific cause
    Other,
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::Underrun => write!(f, "FIFO underrun"),
            TxError::LateCollision => write!(f, "late collision"),
            TxError::ExcessiveCollisions => write!(f, "excessive collisions"),
            TxError::CarrierLost => write!(f, "loss of carrier"),
            TxError::Jabber => write!(f, "jabber timeout"),
            TxError::Checksum => write!(f, "checksum insertion error"),
            TxError::Other => write!(f, "transmit error"),
        }
    }
}

/// What one drain posted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drained {
    pub posted: usize,
    pub bytes: u64,
    /// Descriptor address of the first slot posted
    pub first: Option<PhysicalAddress>,
}

/// What one reap released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reaped {
    pub completed: usize,
    pub errors: usize,
    pub last_error: Option<TxError>,
}

/// Transmit ring plus its pending queue
pub struct TxPipeline<D: TxDescriptor> {
    ring: DescriptorRing<D>,
    packets: Vec<Option<Packet>>,
    queue: VecDeque<Packet>,
    cap: usize,
    drop_when_full: bool,
    interrupt_threshold: usize,
    allocator: Arc<dyn PacketAllocator>,
    platform: Arc<dyn Platform>,
}

impl<D: TxDescriptor> TxPipeline<D> {
    pub fn new(
        ring: DescriptorRing<D>,
        cap: usize,
        drop_when_full: bool,
        allocator: Arc<dyn PacketAllocator>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        let mut packets = Vec::with_capacity(ring.capacity());
        packets.resize_with(ring.capacity(), || None);
        let interrupt_threshold = (ring.capacity() / 2).max(1);
        Self {
            ring,
            packets,
            queue: VecDeque::new(),
            cap,
            drop_when_full,
            interrupt_threshold,
            allocator,
            platform,
        }
    }

    /// Request a completion interrupt when `threshold` slots are in flight
    pub fn with_interrupt_threshold(mut self, threshold: usize) -> Self {
        self.interrupt_threshold = threshold.max(1);
        self
    }

    pub fn ring(&self) -> &DescriptorRing<D> {
        &self.ring
    }

    #[cfg(test)]
    pub(crate) fn ring_mut(&mut self) -> &mut DescriptorRing<D> {
        &mut self.ring
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queued plus in-flight packets
    pub fn backlog(&self) -> usize {
        self.queue.len() + self.ring.in_flight()
    }

    /// Accept a batch into the pending queue
    ///
    /// Fails with the number of packets dropped when drop mode is on and the
    /// backlog is at its cap. Dropped packets are already freed.
    pub fn submit(&mut self, batch: Vec<Packet>) -> Result<(), usize> {
        if self.drop_when_full && self.backlog() >= self.cap {
            let dropped = batch.len();
            for packet in batch {
                self.allocator.free(packet);
            }
            return Err(dropped);
        }

        self.queue.extend(batch);
        Ok(())
    }

    /// Move queued packets into free slots
    pub fn drain(&mut self) -> Drained {
        let mut drained = Drained::default();

        while self.ring.has_room() {
            let Some(packet) = self.queue.pop_front() else {
                break;
            };

            let interrupt =
                self.ring.in_flight() + 1 == self.interrupt_threshold || self.queue.is_empty();
            let request = TxRequest {
                buffer: packet.data_physical(),
                length: packet.len(),
                flags: packet.flags(),
                interrupt,
            };
            self.platform
                .dma_sync_for_device(request.buffer, request.length);

            let Some(slot) = self.ring.post(&request) else {
                // has_room() said otherwise; keep the packet at the head
                self.queue.push_front(packet);
                break;
            };

            drained.first.get_or_insert(self.ring.physical(slot));
            drained.posted += 1;
            drained.bytes += request.length as u64;
            self.packets[slot] = Some(packet);
        }

        if drained.posted > 0 {
            trace!(
                "[ethring] tx posted {} ({} in flight, {} queued)",
                drained.posted,
                self.ring.in_flight(),
                self.queue.len()
            );
        }
        drained
    }

    /// Release every completed slot in ring order
    pub fn reap(&mut self) -> Reaped {
        let mut reaped = Reaped::default();

        while self.ring.reap(self.ring.begin()) == Reap::Done {
            let slot = self.ring.begin();
            if let Err(error) = self.ring.descriptor(slot).completion() {
                trace!("[ethring] tx slot {}: {}", slot, error);
                reaped.errors += 1;
                reaped.last_error = Some(error);
            }

            if self.ring.retire().is_none() {
                break;
            }
            if let Some(packet) = self.packets[slot].take() {
                self.allocator.free(packet);
            }
            reaped.completed += 1;
        }

        reaped
    }
}

impl<D: TxDescriptor> Drop for TxPipeline<D> {
    fn drop(&mut self) {
        for packet in self.packets.iter_mut().filter_map(Option::take) {
            self.allocator.free(packet);
        }
        for packet in self.queue.drain(..) {
            self.allocator.free(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::net::sim::{HeapAllocator, SimPlatform, SimTxDescriptor};
    use alloc::vec;

    fn pipeline(
        capacity: usize,
        cap: usize,
        drop_when_full: bool,
    ) -> (TxPipeline<SimTxDescriptor>, Arc<HeapAllocator>) {
        let platform = Arc::new(SimPlatform::new());
        let allocator = Arc::new(HeapAllocator::new());
        let ring = DescriptorRing::new(platform.clone(), capacity, 16, false).unwrap();
        let pipeline = TxPipeline::new(ring, cap, drop_when_full, allocator.clone(), platform);
        (pipeline, allocator)
    }

    fn batch(allocator: &HeapAllocator, count: usize) -> Vec<Packet> {
        (0..count)
            .map(|_| allocator.allocate(0, 60, 0).unwrap())
            .collect()
    }

    fn complete_all(pipeline: &mut TxPipeline<SimTxDescriptor>, status: u32) {
        let ring = pipeline.ring_mut();
        for slot in 0..ring.capacity() {
            if ring.descriptor(slot).device_owned() {
                ring.descriptor_mut(slot).device_complete(status);
            }
        }
    }

    #[test]
    fn test_interrupt_requested_at_half_ring_and_queue_empty() {
        let (mut pipeline, allocator) = pipeline(8, 16, true);

        pipeline.submit(batch(&allocator, 6)).unwrap();
        let drained = pipeline.drain();
        assert_eq!(drained.posted, 6);

        let interrupts: Vec<bool> = (0..6)
            .map(|slot| pipeline.ring().descriptor(slot).interrupt_requested())
            .collect();
        assert_eq!(interrupts, vec![false, false, false, true, false, true]);
    }

    #[test]
    fn test_custom_interrupt_threshold() {
        let (pipeline, allocator) = pipeline(8, 16, true);
        let mut pipeline = pipeline.with_interrupt_threshold(2);

        pipeline.submit(batch(&allocator, 4)).unwrap();
        pipeline.drain();

        let interrupts: Vec<bool> = (0..4)
            .map(|slot| pipeline.ring().descriptor(slot).interrupt_requested())
            .collect();
        assert_eq!(interrupts, vec![false, true, false, true]);
    }

    #[test]
    fn test_drain_reports_first_descriptor() {
        let (mut pipeline, allocator) = pipeline(4, 8, true);

        pipeline.submit(batch(&allocator, 2)).unwrap();
        let drained = pipeline.drain();
        assert_eq!(drained.first, Some(pipeline.ring().physical(0)));
        assert_eq!(drained.bytes, 120);

        // Nothing queued: no doorbell address
        assert_eq!(pipeline.drain(), Drained::default());
    }

    #[test]
    fn test_backlog_cap_rejects_whole_batch() {
        let (mut pipeline, allocator) = pipeline(4, 8, true);

        pipeline.submit(batch(&allocator, 8)).unwrap();
        pipeline.drain();
        assert_eq!(pipeline.backlog(), 8);

        assert_eq!(pipeline.submit(batch(&allocator, 3)), Err(3));
        assert_eq!(pipeline.backlog(), 8);
        assert_eq!(allocator.outstanding(), 8);
    }

    #[test]
    fn test_queue_grows_without_drop_mode() {
        let (mut pipeline, allocator) = pipeline(4, 8, false);

        pipeline.submit(batch(&allocator, 20)).unwrap();
        pipeline.drain();
        assert_eq!(pipeline.queued(), 16);
        assert_eq!(pipeline.backlog(), 20);
    }

    #[test]
    fn test_reap_frees_packets_and_counts_errors() {
        let (mut pipeline, allocator) = pipeline(4, 8, true);

        pipeline.submit(batch(&allocator, 6)).unwrap();
        pipeline.drain();
        complete_all(&mut pipeline, SimTxDescriptor::STATUS_UNDERRUN);

        let reaped = pipeline.reap();
        assert_eq!(reaped.completed, 4);
        assert_eq!(reaped.errors, 4);
        assert_eq!(reaped.last_error, Some(TxError::Underrun));
        assert_eq!(allocator.outstanding(), 2);

        assert_eq!(pipeline.drain().posted, 2);
        assert_eq!(pipeline.queued(), 0);
    }

    #[test]
    fn test_drop_frees_everything() {
        let (mut pipeline, allocator) = pipeline(4, 16, true);

        pipeline.submit(batch(&allocator, 10)).unwrap();
        pipeline.drain();
        drop(pipeline);

        assert_eq!(allocator.outstanding(), 0);
    }
}
