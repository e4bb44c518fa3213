//! Per-device counters
//!
//! Counters are plain atomics updated with `Relaxed` ordering from whichever
//! path observes the event. They are never used for synchronization, only
//! read back as a [`StatsSnapshot`].

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Live counters for one engine
pub struct EngineStats {
    /// Packets handed to hardware
    pub tx_packets: AtomicUsize,

    /// Bytes handed to hardware
    pub tx_bytes: AtomicU64,

    /// Packets rejected by backpressure
    pub tx_dropped: AtomicUsize,

    /// Transmit descriptors that completed with an error
    pub tx_errors: AtomicUsize,

    /// Good frames delivered upward
    pub rx_packets: AtomicUsize,

    /// Bytes delivered upward
    pub rx_bytes: AtomicU64,

    /// Frames dropped for CRC, length or framing errors
    pub rx_errors: AtomicUsize,

    /// Times the receive unit ran out of descriptors
    pub rx_stalls: AtomicUsize,

    /// Interrupts with a non-zero cause
    pub interrupts: AtomicUsize,

    /// Interrupts with a zero cause (shared line, not ours)
    pub spurious_interrupts: AtomicUsize,

    /// Deferred worker runs
    pub worker_runs: AtomicUsize,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_packets: usize,
    pub tx_bytes: u64,
    pub tx_dropped: usize,
    pub tx_errors: usize,
    pub rx_packets: usize,
    pub rx_bytes: u64,
    pub rx_errors: usize,
    pub rx_stalls: usize,
    pub interrupts: usize,
    pub spurious_interrupts: usize,
    pub worker_runs: usize,
}

impl EngineStats {
    pub const fn new() -> Self {
        Self {
            tx_packets: AtomicUsize::new(0),
            tx_bytes: AtomicU64::new(0),
            tx_dropped: AtomicUsize::new(0),
            tx_errors: AtomicUsize::new(0),
            rx_packets: AtomicUsize::new(0),
            rx_bytes: AtomicU64::new(0),
            rx_errors: AtomicUsize::new(0),
            rx_stalls: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
            spurious_interrupts: AtomicUsize::new(0),
            worker_runs: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            rx_stalls: self.rx_stalls.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            spurious_interrupts: self.spurious_interrupts.load(Ordering::Relaxed),
            worker_runs: self.worker_runs.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate limiter for drop and error log lines
///
/// Callers record every drop; at most once per interval the accumulated
/// count is handed back to be logged.
pub struct DropReporter {
    unreported: AtomicUsize,
    last_report_us: AtomicU64,
    interval_us: u64,
}

impl DropReporter {
    pub const fn new(interval_us: u64) -> Self {
        Self {
            unreported: AtomicUsize::new(0),
            last_report_us: AtomicU64::new(0),
            interval_us,
        }
    }

    /// Record `count` drops at time `now_us`
    ///
    /// Returns the number of drops to log if the interval has elapsed since
    /// the last report, `None` otherwise.
    pub fn record(&self, count: usize, now_us: u64) -> Option<usize> {
        self.unreported.fetch_add(count, Ordering::Relaxed);

        let last = self.last_report_us.load(Ordering::Relaxed);
        if last != 0 && now_us.wrapping_sub(last) < self.interval_us {
            return None;
        }

        // Only one caller wins the right to report this interval
        self.last_report_us
            .compare_exchange(last, now_us.max(1), Ordering::AcqRel, Ordering::Relaxed)
            .ok()?;

        match self.unreported.swap(0, Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_drop_is_reported() {
        let reporter = DropReporter::new(1_000_000);
        assert_eq!(reporter.record(3, 500), Some(3));
    }

    #[test]
    fn test_drops_accumulate_until_interval() {
        let reporter = DropReporter::new(1_000_000);
        assert_eq!(reporter.record(1, 10), Some(1));

        assert_eq!(reporter.record(5, 20), None);
        assert_eq!(reporter.record(7, 999_000), None);
        assert_eq!(reporter.record(1, 1_000_010), Some(13));
        assert_eq!(reporter.record(1, 1_000_020), None);
    }

    #[test]
    fn test_snapshot_reads_counters() {
        let stats = EngineStats::new();
        stats.tx_packets.fetch_add(4, Ordering::Relaxed);
        stats.rx_errors.fetch_add(1, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.tx_packets, 4);
        assert_eq!(snapshot.rx_errors, 1);
        assert_eq!(snapshot.tx_dropped, 0);
    }
}
