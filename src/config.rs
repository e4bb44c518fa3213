//! Engine configuration
//!
//! Everything tunable about an [`Engine`](crate::Engine) lives in
//! [`EngineConfig`]. Hardware constants (register offsets, descriptor bits)
//! stay with their backend; this struct only carries policy.
//!
//! ```ignore
//! let config = EngineConfig::default()
//!     .with_tx_ring_size(64)
//!     .with_drop_when_full(false);
//! config.validate()?;
//! ```

use core::fmt;

/// Default number of transmit descriptors
pub const DEFAULT_TX_RING_SIZE: usize = 32;

/// Default number of receive descriptors
pub const DEFAULT_RX_RING_SIZE: usize = 32;

/// Default receive buffer size (fits a 1518-byte frame plus slack)
pub const DEFAULT_RX_BUFFER_SIZE: usize = 1536;

/// Smallest ring the engine accepts
pub const MIN_RING_SIZE: usize = 2;

/// Largest ring the engine accepts
pub const MAX_RING_SIZE: usize = 256;

/// Smallest receive buffer that still holds a minimum-size frame with FCS
pub const MIN_RX_BUFFER_SIZE: usize = 64;

const MICROSECONDS_PER_SECOND: u64 = 1_000_000;

/// Policy knobs for one engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Transmit descriptors
    pub tx_ring_size: usize,

    /// Receive descriptors
    pub rx_ring_size: usize,

    /// Bytes per receive buffer
    pub rx_buffer_size: usize,

    /// Transmit backlog cap, as a multiple of `tx_ring_size`
    pub queue_cap_multiplier: usize,

    /// Reject batches once the backlog reaches its cap
    ///
    /// With this off, the pending queue grows without bound.
    pub drop_when_full: bool,

    /// Link poll period
    pub link_check_interval_us: u64,

    /// Deadline for software reset and ring initialization
    pub reset_timeout_us: u64,

    /// Deadline for a single MDIO transaction
    pub mdio_timeout_us: u64,

    /// Minimum spacing between drop-count log lines
    pub drop_log_interval_us: u64,

    /// A transmit completion interrupt is requested once
    /// `tx_ring_size / tx_interrupt_divisor` descriptors are in flight
    pub tx_interrupt_divisor: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tx_ring_size: DEFAULT_TX_RING_SIZE,
            rx_ring_size: DEFAULT_RX_RING_SIZE,
            rx_buffer_size: DEFAULT_RX_BUFFER_SIZE,
            queue_cap_multiplier: 2,
            drop_when_full: true,
            link_check_interval_us: 5 * MICROSECONDS_PER_SECOND,
            reset_timeout_us: MICROSECONDS_PER_SECOND,
            mdio_timeout_us: 5_000,
            drop_log_interval_us: MICROSECONDS_PER_SECOND,
            tx_interrupt_divisor: 2,
        }
    }
}

impl EngineConfig {
    pub fn with_tx_ring_size(mut self, size: usize) -> Self {
        self.tx_ring_size = size;
        self
    }

    pub fn with_rx_ring_size(mut self, size: usize) -> Self {
        self.rx_ring_size = size;
        self
    }

    pub fn with_rx_buffer_size(mut self, size: usize) -> Self {
        self.rx_buffer_size = size;
        self
    }

    pub fn with_queue_cap_multiplier(mut self, multiplier: usize) -> Self {
        self.queue_cap_multiplier = multiplier;
        self
    }

    pub fn with_drop_when_full(mut self, drop: bool) -> Self {
        self.drop_when_full = drop;
        self
    }

    pub fn with_link_check_interval_us(mut self, interval: u64) -> Self {
        self.link_check_interval_us = interval;
        self
    }

    pub fn with_reset_timeout_us(mut self, timeout: u64) -> Self {
        self.reset_timeout_us = timeout;
        self
    }

    pub fn with_tx_interrupt_divisor(mut self, divisor: usize) -> Self {
        self.tx_interrupt_divisor = divisor;
        self
    }

    /// In-flight count at which a transmit descriptor asks for an interrupt
    pub fn tx_interrupt_threshold(&self) -> usize {
        (self.tx_ring_size / self.tx_interrupt_divisor.max(1)).max(1)
    }

    /// Maximum transmit backlog (queued plus in flight)
    pub fn tx_queue_cap(&self) -> usize {
        self.tx_ring_size * self.queue_cap_multiplier
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (ring, size) in [("tx", self.tx_ring_size), ("rx", self.rx_ring_size)] {
            if !(MIN_RING_SIZE..=MAX_RING_SIZE).contains(&size) {
                return Err(ConfigError::RingSize { ring, size });
            }
        }

        if self.rx_buffer_size < MIN_RX_BUFFER_SIZE {
            return Err(ConfigError::RxBufferTooSmall(self.rx_buffer_size));
        }

        if self.queue_cap_multiplier == 0 {
            return Err(ConfigError::ZeroQueueCap);
        }

        if self.tx_interrupt_divisor == 0 || self.tx_interrupt_divisor > self.tx_ring_size {
            return Err(ConfigError::InterruptDivisor(self.tx_interrupt_divisor));
        }

        if self.link_check_interval_us == 0
            || self.reset_timeout_us == 0
            || self.mdio_timeout_us == 0
        {
            return Err(ConfigError::ZeroInterval);
        }

        Ok(())
    }
}

/// Reasons an [`EngineConfig`] is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Ring size outside `MIN_RING_SIZE..=MAX_RING_SIZE`
    RingSize { ring: &'static str, size: usize },

    /// The backend only handles power-of-two rings
    RingNotPowerOfTwo { ring: &'static str, size: usize },

    /// Receive buffer cannot hold a minimum frame
    RxBufferTooSmall(usize),

    /// Receive buffer exceeds what the descriptor length field can express
    RxBufferTooLarge { size: usize, max: usize },

    /// Backlog cap of zero would drop everything
    ZeroQueueCap,

    /// Interrupt divisor of zero or larger than the transmit ring
    InterruptDivisor(usize),

    /// A timer or deadline was configured as zero
    ZeroInterval,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RingSize { ring, size } => write!(
                f,
                "{} ring size {} outside {}..={}",
                ring, size, MIN_RING_SIZE, MAX_RING_SIZE
            ),
            Self::RingNotPowerOfTwo { ring, size } => {
                write!(f, "{} ring size {} is not a power of two", ring, size)
            }
            Self::RxBufferTooSmall(size) => write!(f, "receive buffer of {} bytes too small", size),
            Self::RxBufferTooLarge { size, max } => {
                write!(f, "receive buffer of {} bytes exceeds {}", size, max)
            }
            Self::ZeroQueueCap => write!(f, "transmit queue cap is zero"),
            Self::InterruptDivisor(divisor) => {
                write!(f, "transmit interrupt divisor {} out of range", divisor)
            }
            Self::ZeroInterval => write!(f, "timer interval or deadline is zero"),
        }
    }
}
