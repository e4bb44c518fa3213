//! Network Device Abstraction
//!
//! This module holds the types that cross the engine boundary in either
//! direction:
//!
//! - **Downward** (administrative layer -> engine): the [`NetworkDevice`]
//!   trait and its result types [`SendError`], [`InfoError`], [`ResetError`],
//!   [`InterruptStatus`].
//! - **Upward** (engine -> network core): the [`NetCore`] trait, through
//!   which received frames and link transitions are published.
//!
//! ## Error model
//!
//! Per-packet problems never surface as errors here. A frame with a bad CRC
//! is counted and dropped inside the receive pipeline; a transmit underrun
//! is logged and the buffer freed. What the caller sees is whole-batch
//! backpressure (`Busy`), absent link (`NoLink`) and whole-device failure
//! (`HardFailure`, a failed `reset`).
//!
//! ## Example Usage
//!
//! ```ignore
//! use ethring::{NetworkDevice, SendError};
//!
//! device.reset()?;
//!
//! let mut packet = device.allocate_packet(64).ok_or(SendError::HardFailure)?;
//! packet.data_mut().copy_from_slice(&frame);
//!
//! match device.send(vec![packet]) {
//!     Ok(()) => {}
//!     Err(SendError::Busy { dropped }) => { /* backlog full, try later */ }
//!     Err(e) => log::warn!("send failed: {}", e),
//! }
//! ```

use alloc::vec::Vec;
use core::fmt;

use crate::drivers::net::caps::Capabilities;
use crate::drivers::net::events::Events;
use crate::drivers::net::packet::Packet;
use crate::drivers::net::rx::RxChecksum;

/// Ethernet hardware address
pub use smoltcp::wire::EthernetAddress as MacAddress;

/// Negotiated line rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkSpeed {
    Mbps10,
    Mbps100,
    Mbps1000,
}

impl LinkSpeed {
    pub fn bits_per_second(self) -> u64 {
        match self {
            LinkSpeed::Mbps10 => 10_000_000,
            LinkSpeed::Mbps100 => 100_000_000,
            LinkSpeed::Mbps1000 => 1_000_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplex {
    Half,
    Full,
}

/// Link state as tracked by the link monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Not evaluated since the last reset
    #[default]
    Unknown,

    Down,

    Up { speed: LinkSpeed, duplex: Duplex },
}

impl LinkState {
    pub fn is_up(&self) -> bool {
        matches!(self, LinkState::Up { .. })
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Unknown => write!(f, "unknown"),
            LinkState::Down => write!(f, "down"),
            LinkState::Up { speed, duplex } => {
                let mbps = speed.bits_per_second() / 1_000_000;
                let duplex = match duplex {
                    Duplex::Full => "full",
                    Duplex::Half => "half",
                };
                write!(f, "up {} Mb/s {} duplex", mbps, duplex)
            }
        }
    }
}

/// Why a batch was not accepted by [`NetworkDevice::send`]
///
/// The batch is consumed either way; rejected packets go back to the
/// allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Transmit backlog is at its cap; `dropped` packets were discarded
    Busy { dropped: usize },

    /// Link is down
    NoLink,

    /// Device is not running, or a packet cannot be sent by this hardware
    HardFailure,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Busy { dropped } => write!(f, "transmit busy, {} packets dropped", dropped),
            SendError::NoLink => write!(f, "no network connection"),
            SendError::HardFailure => write!(f, "transmit hardware failure"),
        }
    }
}

/// Settings reachable through [`NetworkDevice::get_set_information`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformationKind {
    /// 32-bit little-endian [`Capabilities`] word, checksum bits only
    ChecksumOffload,

    /// 32-bit little-endian boolean
    PromiscuousMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoError {
    /// Requested capability is not supported by this hardware
    NotSupported,

    /// Buffer is not the size this setting uses
    InvalidSize { expected: usize, actual: usize },

    /// Hardware did not accept the new setting; nothing was changed
    Device(HardwareError),
}

impl fmt::Display for InfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfoError::NotSupported => write!(f, "not supported"),
            InfoError::InvalidSize { expected, actual } => {
                write!(f, "invalid buffer size {} (expected {})", actual, expected)
            }
            InfoError::Device(e) => write!(f, "device error: {}", e),
        }
    }
}

/// Register-level failures reported by backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareError {
    /// A polled bit did not change before its deadline
    Timeout(&'static str),

    /// No PHY answered on the management bus
    PhyNotFound,

    /// The operation is not implemented by this hardware
    NotSupported,

    /// DMA memory for a setup block could not be allocated
    NoMemory(&'static str),

    /// A bus address does not fit the device's address registers
    AddressOutOfRange(&'static str),
}

impl fmt::Display for HardwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareError::Timeout(what) => write!(f, "timeout waiting for {}", what),
            HardwareError::PhyNotFound => write!(f, "PHY not found"),
            HardwareError::NotSupported => write!(f, "operation not supported"),
            HardwareError::NoMemory(what) => write!(f, "no DMA memory for {}", what),
            HardwareError::AddressOutOfRange(what) => {
                write!(f, "{} is beyond the device's DMA reach", what)
            }
        }
    }
}

/// Why [`NetworkDevice::reset`] failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetError {
    /// The device did not respond (reset or init timeout, missing PHY)
    Io(HardwareError),

    /// Resources needed to run the device could not be obtained
    NotReady(&'static str),
}

impl fmt::Display for ResetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetError::Io(e) => write!(f, "device I/O error: {}", e),
            ResetError::NotReady(what) => write!(f, "device not ready: {}", what),
        }
    }
}

impl From<HardwareError> for ResetError {
    fn from(e: HardwareError) -> Self {
        match e {
            HardwareError::NoMemory(what) | HardwareError::AddressOutOfRange(what) => {
                ResetError::NotReady(what)
            }
            e => ResetError::Io(e),
        }
    }
}

/// Result of [`NetworkDevice::handle_interrupt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptStatus {
    Claimed,
    NotClaimed,
}

/// Upcalls from the engine into the network core
///
/// Both methods run in worker context with no engine lock held, except that
/// `deliver` is called with the receive lock held and must not call back into
/// the engine's receive path.
pub trait NetCore: Send + Sync {
    /// A good frame arrived
    ///
    /// `frame` points into a ring-owned receive buffer and is only valid for
    /// the duration of the call.
    fn deliver(&self, frame: &[u8], checksum: RxChecksum);

    /// The link changed state
    fn link_state_changed(&self, state: LinkState);
}

/// Administrative interface of a ring-engine network device
///
/// # Design Decisions
///
/// - **Batched transmit**: `send` takes ownership of a whole batch
/// - **Interrupt split**: `handle_interrupt` is safe in interrupt context;
///   everything else needs worker context
/// - **Opaque settings**: `get_set_information` speaks byte buffers so it can
///   sit behind a generic ioctl-style path
pub trait NetworkDevice: Send + Sync {
    /// Queue a batch of frames for transmission
    fn send(&self, batch: Vec<Packet>) -> Result<(), SendError>;

    /// Read or change a device setting
    ///
    /// Returns the number of bytes read or consumed from `buffer`.
    fn get_set_information(
        &self,
        kind: InformationKind,
        buffer: &mut [u8],
        is_set: bool,
    ) -> Result<usize, InfoError>;

    /// Interrupt service routine
    fn handle_interrupt(&self) -> InterruptStatus;

    /// Deferred worker; returns the events it processed
    fn handle_deferred_work(&self) -> Events;

    /// Reset the hardware and re-arm rings, PHY and link timer
    #[must_use = "reset failure leaves the device stopped"]
    fn reset(&self) -> Result<(), ResetError>;

    fn mac_address(&self) -> MacAddress;

    fn link_state(&self) -> LinkState;

    /// Largest frame `send` accepts, excluding FCS
    fn max_frame_size(&self) -> usize;

    /// Currently enabled offloads
    fn enabled_capabilities(&self) -> Capabilities;

    /// Allocate a transmit packet with `len` bytes of frame data
    fn allocate_packet(&self, len: usize) -> Option<Packet>;
}
