//! Receive pipeline
//!
//! Every receive slot owns one long-lived buffer. A completed slot is decoded,
//! good frames are lent upward as a borrowed slice for the duration of
//! [`NetCore::deliver`], and the same buffer is handed straight back to the
//! device. Buffers are only released when the pipeline itself is dropped.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use log::trace;

use crate::drivers::net::backend::RxDescriptor;
use crate::drivers::net::netdev::NetCore;
use crate::drivers::net::packet::{Packet, PacketAllocator};
use crate::drivers::net::platform::{PhysicalAddress, Platform};
use crate::drivers::net::ring::{DescriptorRing, Reap};

bitflags! {
    /// Hardware checksum verdicts for one received frame
    ///
    /// An empty set means the device did not check anything.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RxChecksum: u32 {
        const IP_OK = 1 << 0;
        const IP_FAILED = 1 << 1;
        const TCP_OK = 1 << 2;
        const TCP_FAILED = 1 << 3;
        const UDP_OK = 1 << 4;
        const UDP_FAILED = 1 << 5;
    }
}

/// Frame-level receive result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Ok,
    CrcError,
    LengthError,
    /// Framing, overflow or other receive error
    FrameError,
}

impl fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameStatus::Ok => write!(f, "ok"),
            FrameStatus::CrcError => write!(f, "CRC error"),
            FrameStatus::LengthError => write!(f, "length error"),
            FrameStatus::FrameError => write!(f, "frame error"),
        }
    }
}

/// Decoded receive descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxStatus {
    /// Frame length excluding FCS
    pub length: usize,
    pub status: FrameStatus,
    pub checksum: RxChecksum,
}

/// Receive buffers could not be allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxBufferError;

/// What one reap handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxReaped {
    pub delivered: usize,
    pub bytes: u64,
    pub errors: usize,
    pub last_error: Option<FrameStatus>,
}

/// Receive ring plus its buffers
pub struct RxPipeline<D: RxDescriptor> {
    ring: DescriptorRing<D>,
    buffers: Vec<Option<Packet>>,
    buffer_size: usize,
    allocator: Arc<dyn PacketAllocator>,
    platform: Arc<dyn Platform>,
}

impl<D: RxDescriptor> RxPipeline<D> {
    /// Allocate one buffer per slot and post them all
    ///
    /// Buffers must sit at or below `dma_limit`.
    pub fn new(
        ring: DescriptorRing<D>,
        buffer_size: usize,
        dma_limit: PhysicalAddress,
        allocator: Arc<dyn PacketAllocator>,
        platform: Arc<dyn Platform>,
    ) -> Result<Self, RxBufferError> {
        let capacity = ring.capacity();
        let mut pipeline = Self {
            ring,
            buffers: Vec::with_capacity(capacity),
            buffer_size,
            allocator,
            platform,
        };

        for _ in 0..capacity {
            let buffer = pipeline
                .allocator
                .allocate_below(0, buffer_size, 0, dma_limit)
                .ok_or(RxBufferError)?;
            let physical = buffer.data_physical();
            pipeline.buffers.push(Some(buffer));
            pipeline.ring.fill(physical, buffer_size).ok_or(RxBufferError)?;
        }

        Ok(pipeline)
    }

    pub fn ring(&self) -> &DescriptorRing<D> {
        &self.ring
    }

    #[cfg(test)]
    pub(crate) fn ring_mut(&mut self) -> &mut DescriptorRing<D> {
        &mut self.ring
    }

    /// Deliver or drop every completed frame, re-arming each slot
    pub fn reap(&mut self, net: &dyn NetCore, checksum_offload: bool) -> RxReaped {
        let mut reaped = RxReaped::default();

        while self.ring.reap(self.ring.begin()) == Reap::Done {
            let slot = self.ring.begin();
            let mut status = self.ring.descriptor(slot).status(checksum_offload);

            let Some(buffer) = self.buffers[slot].as_ref() else {
                break;
            };

            if status.status == FrameStatus::Ok
                && (status.length == 0 || status.length > buffer.len())
            {
                status.status = FrameStatus::LengthError;
            }

            match status.status {
                FrameStatus::Ok => {
                    self.platform
                        .dma_sync_for_cpu(buffer.data_physical(), status.length);
                    net.deliver(&buffer.data()[..status.length], status.checksum);
                    reaped.delivered += 1;
                    reaped.bytes += status.length as u64;
                }
                error => {
                    trace!("[ethring] rx slot {}: {}", slot, error);
                    reaped.errors += 1;
                    reaped.last_error = Some(error);
                }
            }

            let physical = buffer.data_physical();
            self.ring.recycle(slot, physical, self.buffer_size);
            self.ring.advance();
        }

        reaped
    }
}

impl<D: RxDescriptor> Drop for RxPipeline<D> {
    fn drop(&mut self) {
        for buffer in self.buffers.iter_mut().filter_map(Option::take) {
            self.allocator.free(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::net::ring::SlotState;
    use crate::drivers::net::sim::{
        FailingAllocator, HeapAllocator, RecordingNetCore, SimPlatform, SimRxDescriptor,
    };

    fn pipeline(capacity: usize) -> (RxPipeline<SimRxDescriptor>, Arc<HeapAllocator>) {
        let platform = Arc::new(SimPlatform::new());
        let allocator = Arc::new(HeapAllocator::new());
        let ring = DescriptorRing::new(platform.clone(), capacity, 16, false).unwrap();
        let pipeline =
            RxPipeline::new(ring, 1536, PhysicalAddress::MAX, allocator.clone(), platform)
                .unwrap();
        (pipeline, allocator)
    }

    #[test]
    fn test_new_posts_every_slot() {
        let (pipeline, allocator) = pipeline(8);

        assert_eq!(allocator.outstanding(), 8);
        assert_eq!(pipeline.ring().in_flight(), 8);
        for slot in 0..8 {
            assert_eq!(pipeline.ring().state(slot), SlotState::DeviceOwned);
        }
    }

    #[test]
    fn test_good_frame_delivered_and_recycled() {
        let (mut pipeline, _allocator) = pipeline(4);
        let net = RecordingNetCore::new();

        pipeline.ring_mut().descriptor_mut(0).device_receive(100, 0);
        let reaped = pipeline.reap(&net, false);

        assert_eq!(reaped.delivered, 1);
        assert_eq!(reaped.bytes, 100);
        assert_eq!(net.frames().len(), 1);
        assert_eq!(net.frames()[0].len(), 100);
        assert_eq!(pipeline.ring().begin(), 1);
        assert_eq!(pipeline.ring().state(0), SlotState::DeviceOwned);
    }

    #[test]
    fn test_bad_frames_dropped() {
        let (mut pipeline, _allocator) = pipeline(4);
        let net = RecordingNetCore::new();

        pipeline
            .ring_mut()
            .descriptor_mut(0)
            .device_receive(100, SimRxDescriptor::STATUS_CRC);
        pipeline.ring_mut().descriptor_mut(1).device_receive(4000, 0);
        pipeline.ring_mut().descriptor_mut(2).device_receive(60, 0);

        let reaped = pipeline.reap(&net, false);

        assert_eq!(reaped.delivered, 1);
        assert_eq!(reaped.errors, 2);
        assert_eq!(reaped.last_error, Some(FrameStatus::LengthError));
        assert_eq!(pipeline.ring().begin(), 3);
    }

    #[test]
    fn test_checksum_verdict_passed_through() {
        let (mut pipeline, _allocator) = pipeline(2);
        let net = RecordingNetCore::new();

        pipeline
            .ring_mut()
            .descriptor_mut(0)
            .device_receive(80, SimRxDescriptor::STATUS_CSUM_OK);
        pipeline.reap(&net, true);

        assert_eq!(net.checksums(), [RxChecksum::IP_OK | RxChecksum::TCP_OK]);
    }

    #[test]
    fn test_allocation_failure_releases_partial_ring() {
        let platform = Arc::new(SimPlatform::new());
        let allocator = Arc::new(FailingAllocator::after(3));
        let ring: DescriptorRing<SimRxDescriptor> =
            DescriptorRing::new(platform.clone(), 8, 16, false).unwrap();

        let result = RxPipeline::new(ring, 1536, PhysicalAddress::MAX, allocator.clone(), platform);

        assert!(matches!(result, Err(RxBufferError)));
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_buffers_out_of_device_reach_are_refused() {
        let platform = Arc::new(SimPlatform::new());
        let allocator = Arc::new(HeapAllocator::new());
        let ring: DescriptorRing<SimRxDescriptor> =
            DescriptorRing::new(platform.clone(), 8, 16, false).unwrap();

        let result = RxPipeline::new(ring, 1536, 0xFFF, allocator.clone(), platform);

        assert!(matches!(result, Err(RxBufferError)));
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_drop_returns_buffers() {
        let (pipeline, allocator) = pipeline(8);
        drop(pipeline);
        assert_eq!(allocator.outstanding(), 0);
    }
}
