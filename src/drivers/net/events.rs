//! Interrupt to worker hand-off
//!
//! The ISR and the link timer record work by OR-ing [`Events`] into an
//! [`EventMask`]; the deferred worker takes the whole word at once with an
//! atomic exchange. Nothing here blocks, so every method is safe in interrupt
//! context.
//!
//! ```text
//! ISR / timer                          worker
//! -----------                          ------
//! newly = mask.post(events)
//! if newly != 0: schedule_worker()     events = mask.take()
//!   on failure: mask.rollback(newly)   dispatch(events)
//! ```
//!
//! Rolling back only the bits a call newly set means a failed schedule never
//! strands an event: the bit reads clear again, so the next ISR or timer
//! firing sets it anew and retries scheduling. Bits that were already
//! pending belong to a worker run that is already queued.

use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::drivers::net::platform::ScheduleError;

bitflags! {
    /// Portable interrupt causes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Events: u32 {
        /// At least one receive descriptor completed
        const RX_READY = 1 << 0;
        /// Receive unit ran out of descriptors and stopped
        const RX_STALLED = 1 << 1;
        /// At least one transmit descriptor completed
        const TX_DONE = 1 << 2;
        /// Abnormal or fatal condition reported by the device
        const ERROR = 1 << 3;
        /// Link state should be re-evaluated
        const LINK_CHECK = 1 << 31;
    }
}

/// Outcome of [`EventMask::raise`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Raise {
    /// New bits were set and the worker was scheduled
    Scheduled,
    /// Every bit was already pending; the queued worker will see them
    Coalesced,
    /// Scheduling failed; the newly set bits were rolled back
    Failed,
}

/// Pending-event word shared by interrupt and worker context
#[derive(Debug, Default)]
pub struct EventMask {
    pending: AtomicU32,
}

impl EventMask {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
        }
    }

    /// OR `events` in; returns the bits that were not already pending
    pub fn post(&self, events: Events) -> Events {
        let previous = self.pending.fetch_or(events.bits(), Ordering::AcqRel);
        Events::from_bits_retain(events.bits() & !previous)
    }

    /// Clear `events` again after a failed schedule
    pub fn rollback(&self, events: Events) {
        self.pending.fetch_and(!events.bits(), Ordering::AcqRel);
    }

    /// Take every pending event, leaving the mask empty
    pub fn take(&self) -> Events {
        Events::from_bits_retain(self.pending.swap(0, Ordering::AcqRel))
    }

    /// Pending events, without consuming them
    pub fn peek(&self) -> Events {
        Events::from_bits_retain(self.pending.load(Ordering::Acquire))
    }

    /// Post `events` and schedule the worker if any bit is new
    pub fn raise(
        &self,
        events: Events,
        schedule: impl FnOnce() -> Result<(), ScheduleError>,
    ) -> Raise {
        let newly = self.post(events);
        if newly.is_empty() {
            return Raise::Coalesced;
        }

        match schedule() {
            Ok(()) => Raise::Scheduled,
            Err(ScheduleError) => {
                self.rollback(newly);
                Raise::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[test]
    fn test_repeated_posts_coalesce() {
        let mask = EventMask::new();
        let schedules = Cell::new(0);
        let schedule = || {
            schedules.set(schedules.get() + 1);
            Ok(())
        };

        assert_eq!(mask.raise(Events::RX_READY, schedule), Raise::Scheduled);
        for _ in 0..9 {
            let schedule = || {
                schedules.set(schedules.get() + 1);
                Ok(())
            };
            assert_eq!(mask.raise(Events::RX_READY, schedule), Raise::Coalesced);
        }

        assert_eq!(schedules.get(), 1);
        assert_eq!(mask.take(), Events::RX_READY);
        assert_eq!(mask.take(), Events::empty());
    }

    #[test]
    fn test_new_bit_schedules_again() {
        let mask = EventMask::new();

        assert_eq!(mask.raise(Events::RX_READY, || Ok(())), Raise::Scheduled);
        assert_eq!(
            mask.raise(Events::RX_READY | Events::TX_DONE, || Ok(())),
            Raise::Scheduled
        );
        assert_eq!(mask.peek(), Events::RX_READY | Events::TX_DONE);
    }

    #[test]
    fn test_failed_schedule_rolls_back_only_new_bits() {
        let mask = EventMask::new();
        mask.post(Events::TX_DONE);

        let result = mask.raise(Events::TX_DONE | Events::LINK_CHECK, || Err(ScheduleError));

        assert_eq!(result, Raise::Failed);
        assert_eq!(mask.peek(), Events::TX_DONE);

        // The rolled-back bit is seen as new by the next attempt
        assert_eq!(mask.raise(Events::LINK_CHECK, || Ok(())), Raise::Scheduled);
        assert_eq!(mask.take(), Events::TX_DONE | Events::LINK_CHECK);
    }

    #[test]
    fn test_concurrent_posts_lose_nothing() {
        use std::sync::Arc;
        use std::thread;

        let mask = Arc::new(EventMask::new());
        let bits = [
            Events::RX_READY,
            Events::RX_STALLED,
            Events::TX_DONE,
            Events::ERROR,
        ];

        let handles: Vec<_> = bits
            .iter()
            .map(|&bit| {
                let mask = Arc::clone(&mask);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        mask.post(bit);
                    }
                })
            })
            .collect();

        let mut seen = Events::empty();
        for handle in handles {
            handle.join().unwrap();
        }
        seen |= mask.take();

        assert_eq!(seen, Events::RX_READY | Events::RX_STALLED | Events::TX_DONE | Events::ERROR);
    }
}
