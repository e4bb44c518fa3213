//! Received-Frame Queue
//!
//! [`FrameQueue`] is the [`NetCore`] the engine delivers into when the
//! consumer is a polled stack such as smoltcp: every frame the receive
//! pipeline hands up is copied out of its DMA buffer (so the slot can be
//! re-armed at once) and parked here until the stack asks for it.
//!
//! ## Design Pattern
//!
//! A bounded single-producer single-consumer ring:
//! - Power-of-2 capacity for modulo via masking
//! - Atomic head/tail indices with Acquire/Release ordering
//! - One slot always stays empty to tell full from empty
//!
//! Each side is serialized by its own lock, so the engine's receive path and
//! the stack's poll loop never wait on each other.
//!
//! When the queue is full, new frames are dropped and counted; the oldest
//! frames are kept so a slow consumer sees a gap rather than reordering.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::trace;
use spin::Mutex;

use crate::drivers::net::netdev::{LinkState, NetCore};
use crate::drivers::net::rx::RxChecksum;

/// Default queue depth: two full receive rings
pub const DEFAULT_DEPTH: usize = 64;

/// One delivered frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxFrame {
    pub data: Vec<u8>,
    pub checksum: RxChecksum,
}

/// Bounded SPSC queue of received frames
pub struct FrameQueue {
    /// Note: one slot always remains empty to distinguish full from empty
    slots: Box<[UnsafeCell<Option<RxFrame>>]>,
    mask: usize,

    /// Write index (producer only)
    head: AtomicUsize,
    /// Read index (consumer only)
    tail: AtomicUsize,

    producer: Mutex<()>,
    consumer: Mutex<()>,

    dropped: AtomicU64,
    link: Mutex<LinkState>,
}

// SAFETY: a slot is written only by the producer while it lies outside
// [tail, head) and taken only by the consumer while it lies inside; the
// Release store of the index that moves it across publishes the contents.
// The side locks keep each index single-writer.
unsafe impl Sync for FrameQueue {}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_DEPTH)
    }
}

impl FrameQueue {
    /// Queue holding at least `depth` frames
    pub fn new(depth: usize) -> Self {
        let capacity = (depth + 1).next_power_of_two().max(2);
        Self {
            slots: (0..capacity).map(|_| UnsafeCell::new(None)).collect(),
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            producer: Mutex::new(()),
            consumer: Mutex::new(()),
            dropped: AtomicU64::new(0),
            link: Mutex::new(LinkState::Unknown),
        }
    }

    /// Usable capacity (one less than the slot count)
    pub fn capacity(&self) -> usize {
        self.mask
    }

    /// Enqueue a frame (producer)
    ///
    /// Returns the frame back if the queue is full.
    pub fn enqueue(&self, frame: RxFrame) -> Result<(), RxFrame> {
        let _producer = self.producer.lock();
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        let next_head = (head + 1) & self.mask;
        if next_head == tail {
            return Err(frame);
        }

        // SAFETY: head is outside [tail, head) so the consumer is not
        // touching this slot
        unsafe { *self.slots[head].get() = Some(frame) };

        self.head.store(next_head, Ordering::Release);
        Ok(())
    }

    /// Dequeue the oldest frame (consumer)
    pub fn dequeue(&self) -> Option<RxFrame> {
        let _consumer = self.consumer.lock();
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        // SAFETY: tail is inside [tail, head) so the producer is done with it
        let frame = unsafe { (*self.slots[tail].get()).take() };

        self.tail.store((tail + 1) & self.mask, Ordering::Release);
        frame
    }

    /// Drop every queued frame
    pub fn drain(&self) -> DrainIterator<'_> {
        DrainIterator { queue: self }
    }

    /// Queue depth (approximate, may be stale)
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail) & self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.mask
    }

    /// Frames refused because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Most recent link state reported by the engine
    pub fn link_state(&self) -> LinkState {
        *self.link.lock()
    }
}

/// Iterator that dequeues until the queue is empty
pub struct DrainIterator<'a> {
    queue: &'a FrameQueue,
}

impl Iterator for DrainIterator<'_> {
    type Item = RxFrame;

    fn next(&mut self) -> Option<Self::Item> {
        self.queue.dequeue()
    }
}

impl NetCore for FrameQueue {
    fn deliver(&self, frame: &[u8], checksum: RxChecksum) {
        let frame = RxFrame {
            data: frame.to_vec(),
            checksum,
        };
        if self.enqueue(frame).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("[ethring] frame queue full, dropping frame");
        }
    }

    fn link_state_changed(&self, state: LinkState) {
        *self.link.lock() = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::net::netdev::{Duplex, LinkSpeed};
    use alloc::sync::Arc;
    use alloc::vec;

    fn frame(id: u8) -> RxFrame {
        RxFrame {
            data: vec![id; 64],
            checksum: RxChecksum::empty(),
        }
    }

    #[test]
    fn test_queue_new_empty() {
        let queue = FrameQueue::new(7);
        assert_eq!(queue.capacity(), 7);
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());
        assert!(!queue.is_full());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_depth_rounds_up() {
        assert_eq!(FrameQueue::new(8).capacity(), 15);
        assert_eq!(FrameQueue::new(0).capacity(), 1);
        assert_eq!(FrameQueue::default().capacity(), 127);
    }

    #[test]
    fn test_queue_full() {
        let queue = FrameQueue::new(3);

        for i in 0..3 {
            assert!(queue.enqueue(frame(i)).is_ok());
        }
        assert!(queue.is_full());
        assert_eq!(queue.enqueue(frame(9)), Err(frame(9)));
    }

    #[test]
    fn test_queue_fifo_order_across_wraparound() {
        let queue = FrameQueue::new(3);

        for round in 0..4u8 {
            for i in 0..3 {
                queue.enqueue(frame(round * 10 + i)).unwrap();
            }
            for i in 0..3 {
                assert_eq!(queue.dequeue(), Some(frame(round * 10 + i)));
            }
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn test_deliver_copies_and_counts_drops() {
        let queue = FrameQueue::new(1);

        queue.deliver(&[1, 2, 3], RxChecksum::IP_OK);
        queue.deliver(&[4, 5, 6], RxChecksum::empty());

        assert_eq!(queue.dropped(), 1);
        assert_eq!(
            queue.dequeue(),
            Some(RxFrame {
                data: vec![1, 2, 3],
                checksum: RxChecksum::IP_OK,
            })
        );
    }

    #[test]
    fn test_link_state_is_recorded() {
        let queue = FrameQueue::default();
        assert_eq!(queue.link_state(), LinkState::Unknown);

        let up = LinkState::Up {
            speed: LinkSpeed::Mbps1000,
            duplex: Duplex::Full,
        };
        queue.link_state_changed(up);
        assert_eq!(queue.link_state(), up);
    }

    #[test]
    fn test_queue_drain() {
        let queue = FrameQueue::new(8);
        for i in 0..5 {
            queue.enqueue(frame(i)).unwrap();
        }

        assert_eq!(queue.drain().count(), 5);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_producer_and_consumer_threads() {
        let queue = Arc::new(FrameQueue::new(16));
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..=255u8 {
                    let mut item = frame(i);
                    while let Err(back) = queue.enqueue(item) {
                        item = back;
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0u16;
        while expected < 256 {
            match queue.dequeue() {
                Some(received) => {
                    assert_eq!(received, frame(expected as u8));
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
    }
}
