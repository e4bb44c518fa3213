//! Fixed-Size DMA Packet Pool
//!
//! A [`PacketAllocator`] that carves one physically contiguous DMA block into
//! equal buffers. The receive pipeline refills its ring from here and the
//! transmit path returns completed frames here, so after start-up no buffer
//! ever goes through the general-purpose heap.
//!
//! ## Architecture
//!
//! - **One DMA block**: `count * buffer_size` bytes from [`Platform::dma_allocate`]
//! - **Lock-free allocation**: an [`AtomicBitmap`] tracks which buffers are out,
//!   so `allocate` and `free` are safe from any context
//! - **Address-derived slots**: a freed packet's buffer index is recovered from
//!   its physical address; packets from another allocator are rejected

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use log::{error, trace, warn};

use crate::drivers::net::packet::{Packet, PacketAllocator};
use crate::drivers::net::platform::{DmaRegion, Platform};

/// Buffers start on a cache-line boundary
pub const BUFFER_ALIGN: usize = 64;

/// Default buffer size: a full frame plus headroom, rounded to 2 KiB
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Atomic bitmap for lock-free slot allocation
///
/// Each bit: 0 = free, 1 = allocated. Bits past `len` in the final word start
/// out set so they are never handed out.
struct AtomicBitmap {
    words: Vec<AtomicU32>,
    len: usize,
}

impl AtomicBitmap {
    fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(32))
            .map(|word_idx| {
                let valid = (len - word_idx * 32).min(32);
                let unused = if valid == 32 { 0 } else { !0u32 << valid };
                AtomicU32::new(unused)
            })
            .collect();
        Self { words, len }
    }

    /// Acquire a free bit (set to 1)
    fn acquire_bit(&self) -> Option<usize> {
        for (word_idx, word) in self.words.iter().enumerate() {
            let mut current = word.load(Ordering::Acquire);
            loop {
                let free_bit = (!current).trailing_zeros();
                if free_bit >= 32 {
                    break;
                }

                let mask = 1u32 << free_bit;
                match word.compare_exchange_weak(
                    current,
                    current | mask,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(word_idx * 32 + free_bit as usize),
                    Err(actual) => current = actual,
                }
            }
        }

        None
    }

    /// Release a bit (set to 0)
    ///
    /// Returns `false` if the bit was already clear (double free).
    fn release_bit(&self, bit_idx: usize) -> bool {
        debug_assert!(bit_idx < self.len);
        let mask = 1u32 << (bit_idx % 32);
        let prev = self.words[bit_idx / 32].fetch_and(!mask, Ordering::AcqRel);
        prev & mask != 0
    }

    #[cfg(test)]
    fn is_allocated(&self, bit_idx: usize) -> bool {
        let mask = 1u32 << (bit_idx % 32);
        self.words[bit_idx / 32].load(Ordering::Acquire) & mask != 0
    }
}

/// Pool construction failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Zero buffers or zero-sized buffers requested
    Empty,
    /// The platform could not supply the DMA block
    NoMemory { bytes: usize },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Empty => write!(f, "packet pool needs at least one non-empty buffer"),
            PoolError::NoMemory { bytes } => {
                write!(f, "no DMA memory for a {}-byte packet pool", bytes)
            }
        }
    }
}

/// Packet pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketPoolStats {
    /// Total allocations
    pub alloc_count: usize,

    /// Total frees
    pub free_count: usize,

    /// Allocation failures (pool exhausted or request too large)
    pub alloc_failures: usize,

    /// Buffers currently handed out
    pub in_use: usize,
}

/// Fixed-size DMA buffer pool
pub struct PacketPool {
    platform: Arc<dyn Platform>,
    /// Taken on drop
    region: Option<DmaRegion>,
    buffer_size: usize,
    count: usize,
    free_list: AtomicBitmap,

    alloc_count: AtomicUsize,
    free_count: AtomicUsize,
    alloc_failures: AtomicUsize,
}

// SAFETY: the DMA block is only reached through raw pointers handed out one
// buffer at a time; the bitmap guarantees each buffer has a single owner.
unsafe impl Sync for PacketPool {}

impl PacketPool {
    /// Allocate `count` buffers of at least `buffer_size` bytes each
    pub fn new(
        platform: Arc<dyn Platform>,
        count: usize,
        buffer_size: usize,
    ) -> Result<Self, PoolError> {
        if count == 0 || buffer_size == 0 {
            return Err(PoolError::Empty);
        }

        let buffer_size = buffer_size.next_multiple_of(BUFFER_ALIGN);
        let bytes = count * buffer_size;
        let region = platform
            .dma_allocate(bytes, BUFFER_ALIGN)
            .ok_or(PoolError::NoMemory { bytes })?;

        Ok(Self {
            platform,
            region: Some(region),
            buffer_size,
            count,
            free_list: AtomicBitmap::new(count),
            alloc_count: AtomicUsize::new(0),
            free_count: AtomicUsize::new(0),
            alloc_failures: AtomicUsize::new(0),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.count
    }

    pub fn stats(&self) -> PacketPoolStats {
        let alloc_count = self.alloc_count.load(Ordering::Relaxed);
        let free_count = self.free_count.load(Ordering::Relaxed);
        PacketPoolStats {
            alloc_count,
            free_count,
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
            in_use: alloc_count.saturating_sub(free_count),
        }
    }

    /// Buffer index of a packet this pool handed out
    fn index_of(&self, packet: &Packet) -> Option<usize> {
        let region = self.region.as_ref()?;
        let offset = packet.physical().checked_sub(region.physical())? as usize;
        let index = offset / self.buffer_size;
        (offset % self.buffer_size == 0 && index < self.count).then_some(index)
    }
}

impl PacketAllocator for PacketPool {
    fn allocate(&self, headroom: usize, size: usize, footer: usize) -> Option<Packet> {
        let region = self.region.as_ref()?;
        let needed = headroom + size + footer;
        if needed > self.buffer_size {
            trace!(
                "[pool] {}-byte request exceeds {}-byte buffers",
                needed, self.buffer_size
            );
            self.alloc_failures.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let Some(index) = self.free_list.acquire_bit() else {
            self.alloc_failures.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let offset = index * self.buffer_size;
        // SAFETY: offset + buffer_size <= region length
        let buffer = NonNull::new(unsafe { region.as_ptr().add(offset) })?;
        self.alloc_count.fetch_add(1, Ordering::Relaxed);

        // SAFETY: the bit we just set makes this buffer exclusively ours
        // until it comes back through `free`
        Some(unsafe {
            Packet::from_raw_parts(
                buffer,
                region.physical() + offset as u64,
                self.buffer_size,
                headroom,
                headroom + size,
            )
        })
    }

    fn free(&self, packet: Packet) {
        let Some(index) = self.index_of(&packet) else {
            error!(
                "[pool] packet at {:#x} does not belong to this pool",
                packet.physical()
            );
            return;
        };

        if self.free_list.release_bit(index) {
            self.free_count.fetch_add(1, Ordering::Relaxed);
        } else {
            error!("[pool] double free of buffer {}", index);
        }
    }
}

impl Drop for PacketPool {
    fn drop(&mut self) {
        let in_use = self.stats().in_use;
        if in_use > 0 {
            warn!("[pool] dropped with {} buffers still out", in_use);
        }
        if let Some(region) = self.region.take() {
            self.platform.dma_free(region);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::drivers::net::engine::{Engine, Services};
    use crate::drivers::net::caps::Capabilities;
    use crate::drivers::net::netdev::{Duplex, LinkSpeed, LinkState, MacAddress};
    use crate::drivers::net::sim::{RecordingNetCore, SimNic, SimPlatform};
    use proptest::prelude::*;

    fn pool(count: usize) -> (PacketPool, Arc<SimPlatform>) {
        let platform = Arc::new(SimPlatform::new());
        (
            PacketPool::new(platform.clone(), count, 1536).unwrap(),
            platform,
        )
    }

    #[test]
    fn test_atomic_bitmap_acquire_release() {
        let bitmap = AtomicBitmap::new(64);

        let bit0 = bitmap.acquire_bit().unwrap();
        assert_eq!(bit0, 0);
        assert!(bitmap.is_allocated(0));

        let bit1 = bitmap.acquire_bit().unwrap();
        assert_eq!(bit1, 1);

        assert!(bitmap.release_bit(bit0));
        assert!(!bitmap.is_allocated(0));
        assert!(!bitmap.release_bit(bit0));

        // Re-acquire should get bit 0 again
        assert_eq!(bitmap.acquire_bit(), Some(0));
    }

    #[test]
    fn test_atomic_bitmap_partial_word() {
        let bitmap = AtomicBitmap::new(40);

        let bits: Vec<usize> = (0..40).map(|_| bitmap.acquire_bit().unwrap()).collect();
        assert_eq!(bits.last(), Some(&39));
        assert!(bitmap.acquire_bit().is_none());

        bitmap.release_bit(33);
        assert_eq!(bitmap.acquire_bit(), Some(33));
    }

    #[test]
    fn test_buffer_size_rounds_to_alignment() {
        let (pool, _platform) = pool(4);
        assert_eq!(pool.buffer_size(), 1536);

        let platform = Arc::new(SimPlatform::new());
        let pool = PacketPool::new(platform, 4, 1500).unwrap();
        assert_eq!(pool.buffer_size(), 1536);
    }

    #[test]
    fn test_empty_pool_rejected() {
        let platform = Arc::new(SimPlatform::new());
        assert_eq!(
            PacketPool::new(platform.clone(), 0, 1536).err(),
            Some(PoolError::Empty)
        );

        platform.set_fail_dma(true);
        assert_eq!(
            PacketPool::new(platform, 4, 1536).err(),
            Some(PoolError::NoMemory { bytes: 4 * 1536 })
        );
    }

    #[test]
    fn test_packets_are_laid_out_in_the_block() {
        let (pool, _platform) = pool(4);

        let first = pool.allocate(14, 60, 4).unwrap();
        let second = pool.allocate(0, 1536, 0).unwrap();

        assert_eq!(first.headroom(), 14);
        assert_eq!(first.len(), 60);
        assert_eq!(first.capacity(), 1536);
        assert_eq!(second.physical(), first.physical() + 1536);
        assert_eq!(first.data_physical(), first.physical() + 14);

        pool.free(first);
        pool.free(second);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_exhaustion_and_oversize() {
        let (pool, _platform) = pool(2);

        let a = pool.allocate(0, 60, 0).unwrap();
        let b = pool.allocate(0, 60, 0).unwrap();
        assert!(pool.allocate(0, 60, 0).is_none());
        pool.free(a);
        assert!(pool.allocate(0, 1537, 0).is_none());

        let stats = pool.stats();
        assert_eq!(stats.alloc_count, 2);
        assert_eq!(stats.free_count, 1);
        assert_eq!(stats.alloc_failures, 2);
        assert_eq!(stats.in_use, 1);
        pool.free(b);
    }

    #[test]
    fn test_foreign_packet_is_rejected() {
        let (pool, _platform) = pool(2);
        let (other, _other_platform) = self::pool(2);

        let foreign = other.allocate(0, 60, 0).unwrap();
        let physical = foreign.physical();
        pool.free(foreign);
        assert_eq!(pool.stats().free_count, 0);

        // Still usable by its owner
        let back = other.allocate(0, 60, 0).unwrap();
        assert_ne!(back.physical(), physical);
    }

    #[test]
    fn test_drop_returns_dma_block() {
        let (pool, platform) = pool(8);
        assert_eq!(platform.dma_regions(), 1);
        drop(pool);
        assert_eq!(platform.dma_regions(), 0);
    }

    #[test]
    fn test_engine_refills_receive_ring_from_pool() {
        let platform = Arc::new(SimPlatform::new());
        let pool = Arc::new(PacketPool::new(platform.clone(), 64, 1536).unwrap());
        let net = Arc::new(RecordingNetCore::new());
        let nic = SimNic::new(
            MacAddress([0x02, 0, 0, 0, 0, 1]),
            Capabilities::empty(),
        );
        nic.set_link(LinkState::Up {
            speed: LinkSpeed::Mbps100,
            duplex: Duplex::Full,
        });
        let engine = Engine::new(
            nic,
            EngineConfig::default(),
            Services {
                platform,
                allocator: pool.clone(),
                net: net.clone(),
            },
        )
        .unwrap();

        engine.reset().unwrap();
        assert_eq!(pool.stats().in_use, 32);

        assert!(engine.backend().inject_rx(&[0x5A; 64], 0));
        engine.handle_interrupt();
        engine.handle_deferred_work();

        assert_eq!(net.frames(), vec![vec![0x5A; 64]]);
        assert_eq!(pool.stats().in_use, 32);

        engine.teardown();
        assert_eq!(pool.stats().in_use, 0);
    }

    proptest! {
        #[test]
        fn prop_pool_never_hands_out_a_buffer_twice(
            count in 1usize..70,
            ops in proptest::collection::vec(any::<bool>(), 0..300),
        ) {
            let (pool, _platform) = pool(count);
            let mut held: Vec<Packet> = Vec::new();

            for allocate in ops {
                if allocate {
                    match pool.allocate(0, 64, 0) {
                        Some(packet) => {
                            prop_assert!(held.iter().all(|p| p.physical() != packet.physical()));
                            held.push(packet);
                        }
                        None => prop_assert_eq!(held.len(), count),
                    }
                } else if let Some(packet) = held.pop() {
                    pool.free(packet);
                }
                prop_assert_eq!(pool.stats().in_use, held.len());
            }

            for packet in held {
                pool.free(packet);
            }
        }
    }
}
