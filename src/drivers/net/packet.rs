//! Packet buffers
//!
//! A [`Packet`] is a contiguous, device-visible buffer split into three
//! regions:
//!
//! ```text
//! 0            data_offset              footer_offset          capacity
//! |  headroom  |        frame data      |        footer        |
//! ```
//!
//! The engine only ever hands `data_physical()..+len()` to hardware. Packets
//! come from, and must go back to, a [`PacketAllocator`]; the type has no
//! `Drop` impl because only the allocator knows how to release the memory.

use bitflags::bitflags;
use core::fmt;
use core::ptr::NonNull;

use crate::drivers::net::platform::{dma_reachable, PhysicalAddress};

bitflags! {
    /// Per-packet transmit requests
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u32 {
        /// Device should fill in the IPv4 header checksum
        const IP_CHECKSUM_OFFLOAD = 1 << 0;
        /// Device should fill in the UDP checksum
        const UDP_CHECKSUM_OFFLOAD = 1 << 1;
        /// Device should fill in the TCP checksum
        const TCP_CHECKSUM_OFFLOAD = 1 << 2;
    }
}

/// Errors from resizing a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// Requested length does not fit between the data offset and capacity
    InsufficientCapacity { requested: usize, available: usize },
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientCapacity {
                requested,
                available,
            } => write!(
                f,
                "packet length {} exceeds {} bytes available",
                requested, available
            ),
        }
    }
}

/// An owned frame buffer with virtual and physical addressing
#[derive(Debug)]
pub struct Packet {
    buffer: NonNull<u8>,
    physical: PhysicalAddress,
    capacity: usize,
    data_offset: usize,
    footer_offset: usize,
    flags: PacketFlags,
}

// SAFETY: A packet exclusively owns its buffer; sending it to another thread
// transfers that ownership.
unsafe impl Send for Packet {}

impl Packet {
    /// Assemble a packet from allocator-owned memory
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for reads and writes of `capacity` bytes until the
    /// packet is returned to its allocator, `physical` must be the device view
    /// of `buffer`, and `data_offset <= footer_offset <= capacity`.
    pub unsafe fn from_raw_parts(
        buffer: NonNull<u8>,
        physical: PhysicalAddress,
        capacity: usize,
        data_offset: usize,
        footer_offset: usize,
    ) -> Self {
        debug_assert!(data_offset <= footer_offset && footer_offset <= capacity);
        Self {
            buffer,
            physical,
            capacity,
            data_offset,
            footer_offset,
            flags: PacketFlags::empty(),
        }
    }

    /// Frame length in bytes
    pub fn len(&self) -> usize {
        self.footer_offset - self.data_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn headroom(&self) -> usize {
        self.data_offset
    }

    /// Start of the whole buffer, for allocators
    pub fn buffer(&self) -> NonNull<u8> {
        self.buffer
    }

    /// Device address of the start of the whole buffer
    pub fn physical(&self) -> PhysicalAddress {
        self.physical
    }

    /// Device address of the first frame byte
    pub fn data_physical(&self) -> PhysicalAddress {
        self.physical + self.data_offset as PhysicalAddress
    }

    pub fn data(&self) -> &[u8] {
        // SAFETY: data_offset..footer_offset lies within the buffer
        // (constructor contract, maintained by set_len)
        unsafe {
            core::slice::from_raw_parts(self.buffer.as_ptr().add(self.data_offset), self.len())
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: As in `data`, and `&mut self` guarantees exclusivity
        unsafe {
            core::slice::from_raw_parts_mut(self.buffer.as_ptr().add(self.data_offset), self.len())
        }
    }

    /// Change the frame length, keeping the data offset
    pub fn set_len(&mut self, len: usize) -> Result<(), PacketError> {
        let available = self.capacity - self.data_offset;
        if len > available {
            return Err(PacketError::InsufficientCapacity {
                requested: len,
                available,
            });
        }
        self.footer_offset = self.data_offset + len;
        Ok(())
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: PacketFlags) {
        self.flags = flags;
    }
}

/// Source of packet buffers
///
/// `allocate` returns a packet whose frame data is `size` bytes long, with at
/// least `headroom` bytes before it and `footer` bytes after it.
pub trait PacketAllocator: Send + Sync {
    fn allocate(&self, headroom: usize, size: usize, footer: usize) -> Option<Packet>;

    /// Like `allocate`, but the whole buffer must sit at or below `limit`
    fn allocate_below(
        &self,
        headroom: usize,
        size: usize,
        footer: usize,
        limit: PhysicalAddress,
    ) -> Option<Packet> {
        let packet = self.allocate(headroom, size, footer)?;
        if dma_reachable(packet.physical(), packet.capacity(), limit) {
            Some(packet)
        } else {
            self.free(packet);
            None
        }
    }

    fn free(&self, packet: Packet);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_over(storage: &mut [u8], headroom: usize, len: usize) -> Packet {
        let buffer = NonNull::new(storage.as_mut_ptr()).unwrap();
        unsafe {
            Packet::from_raw_parts(
                buffer,
                0x8000_0000,
                storage.len(),
                headroom,
                headroom + len,
            )
        }
    }

    #[test]
    fn test_data_region_respects_headroom() {
        let mut storage = [0u8; 128];
        storage[16] = 0xAA;
        let packet = packet_over(&mut storage, 16, 60);

        assert_eq!(packet.len(), 60);
        assert_eq!(packet.headroom(), 16);
        assert_eq!(packet.data()[0], 0xAA);
        assert_eq!(packet.data_physical(), 0x8000_0010);
    }

    #[test]
    fn test_set_len_bounds() {
        let mut storage = [0u8; 128];
        let mut packet = packet_over(&mut storage, 28, 0);

        assert!(packet.is_empty());
        assert_eq!(packet.set_len(100), Ok(()));
        assert_eq!(packet.len(), 100);
        assert_eq!(
            packet.set_len(101),
            Err(PacketError::InsufficientCapacity {
                requested: 101,
                available: 100
            })
        );
        assert_eq!(packet.len(), 100);
    }

    #[test]
    fn test_allocate_below_returns_unreachable_buffers() {
        use crate::drivers::net::sim::HeapAllocator;

        let allocator = HeapAllocator::new();

        assert!(allocator.allocate_below(0, 60, 0, 0xFFF).is_none());
        assert_eq!(allocator.outstanding(), 0);

        let packet = allocator
            .allocate_below(0, 60, 0, PhysicalAddress::MAX)
            .unwrap();
        assert_eq!(allocator.outstanding(), 1);
        allocator.free(packet);
    }
}
