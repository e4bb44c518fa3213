//! Time source and bounded polling
//!
//! Hardware reset, ring initialization and MDIO transactions all wait for a
//! register bit to flip. None of them may hang if the device never answers, so
//! every wait goes through [`poll_until`] with a wall-clock deadline taken
//! from the platform's [`Clock`].
//!
//! ## Clock contract
//!
//! - `now_us` is a free-running microsecond counter (monotonic, may wrap)
//! - `delay_us` busy-waits at least the requested time
//!
//! Deadline arithmetic uses wrapping subtraction, so a counter that rolls over
//! mid-wait still times out correctly.

/// Microsecond time source supplied by the platform
pub trait Clock {
    /// Current counter value in microseconds
    fn now_us(&self) -> u64;

    /// Busy-wait for at least `microseconds`
    fn delay_us(&self, microseconds: u64) {
        let start = self.now_us();
        while self.now_us().wrapping_sub(start) < microseconds {
            core::hint::spin_loop();
        }
    }
}

/// A point in time after which a wait is abandoned
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: u64,
    timeout_us: u64,
}

impl Deadline {
    pub fn after<C: Clock + ?Sized>(clock: &C, timeout_us: u64) -> Self {
        Self {
            start: clock.now_us(),
            timeout_us,
        }
    }

    pub fn expired<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        clock.now_us().wrapping_sub(self.start) >= self.timeout_us
    }
}

/// The condition never became true before the deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

/// Poll `condition` every `interval_us` until it holds or `timeout_us` passes
///
/// The condition is always evaluated once more after the deadline expires, so
/// a device that answers during the final delay is not reported as timed out.
pub fn poll_until<C: Clock + ?Sized>(
    clock: &C,
    timeout_us: u64,
    interval_us: u64,
    mut condition: impl FnMut() -> bool,
) -> Result<(), TimedOut> {
    let deadline = Deadline::after(clock, timeout_us);
    loop {
        if condition() {
            return Ok(());
        }

        if deadline.expired(clock) {
            return if condition() { Ok(()) } else { Err(TimedOut) };
        }

        clock.delay_us(interval_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    /// Clock that advances only when someone delays
    struct StepClock {
        now: Cell<u64>,
    }

    impl Clock for StepClock {
        fn now_us(&self) -> u64 {
            self.now.get()
        }

        fn delay_us(&self, microseconds: u64) {
            self.now.set(self.now.get().wrapping_add(microseconds));
        }
    }

    #[test]
    fn test_poll_until_succeeds_before_deadline() {
        let clock = StepClock { now: Cell::new(0) };
        let mut polls = 0;

        let result = poll_until(&clock, 1_000, 10, || {
            polls += 1;
            polls == 5
        });

        assert_eq!(result, Ok(()));
        assert_eq!(clock.now_us(), 40);
    }

    #[test]
    fn test_poll_until_times_out() {
        let clock = StepClock { now: Cell::new(0) };

        let result = poll_until(&clock, 1_000, 100, || false);

        assert_eq!(result, Err(TimedOut));
        assert!(clock.now_us() >= 1_000);
    }

    #[test]
    fn test_deadline_survives_counter_wrap() {
        let clock = StepClock {
            now: Cell::new(u64::MAX - 50),
        };
        let deadline = Deadline::after(&clock, 100);

        clock.delay_us(60);
        assert!(!deadline.expired(&clock));

        clock.delay_us(40);
        assert!(deadline.expired(&clock));
    }
}
