//! Hardware backend interface
//!
//! The engine is written once; what differs between chips is captured by
//! three traits:
//!
//! - [`TxDescriptor`] / [`RxDescriptor`]: encode requests into, and decode
//!   status out of, one hardware descriptor. The ring decides *when* fields
//!   and ownership are written; the codec decides *which bits*.
//! - [`Backend`]: register-level operations (reset, start, halt, interrupt
//!   cause, doorbells, link sensing, offload switches).
//!
//! Descriptor layouts are private to each backend. The engine only sees
//! "released or not", a [`TxError`] and an [`RxStatus`].

use crate::drivers::net::caps::Capabilities;
use crate::drivers::net::events::Events;
use crate::drivers::net::netdev::{Duplex, HardwareError, LinkSpeed, LinkState, MacAddress};
use crate::drivers::net::packet::PacketFlags;
use crate::drivers::net::platform::{PhysicalAddress, Platform};
use crate::drivers::net::rx::RxStatus;
use crate::drivers::net::tx::TxError;

/// Behaviour common to transmit and receive descriptors
pub trait Descriptor {
    /// Set up the static ring linkage
    ///
    /// Called once per slot when the ring is created. `own` is this
    /// descriptor's device address, `next` the following slot's (slot 0 for
    /// the final descriptor, which also has `last` set).
    fn link(&mut self, own: PhysicalAddress, next: PhysicalAddress, last: bool);

    /// Device has handed this descriptor back (ownership bit clear, or
    /// completion bit set)
    fn released(&self) -> bool;

    /// Let the device run past this descriptor
    ///
    /// Called on a slot's predecessor after the slot is handed to the device.
    /// Backends that park the device with a per-descriptor suspend bit clear
    /// it here; others do nothing.
    fn resume_chain(&mut self) {}
}

/// One frame to transmit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRequest {
    pub buffer: PhysicalAddress,
    pub length: usize,
    pub flags: PacketFlags,
    /// Raise a completion interrupt for this descriptor
    pub interrupt: bool,
}

pub trait TxDescriptor: Descriptor {
    /// Write everything except the ownership hand-off
    fn prepare(&mut self, request: &TxRequest);

    /// Transfer ownership to the device; the final write to the descriptor
    fn give_to_device(&mut self);

    /// Decode the completion status of a released descriptor
    fn completion(&self) -> Result<(), TxError>;

    /// Return a reaped descriptor to its idle state
    fn clear(&mut self);
}

pub trait RxDescriptor: Descriptor {
    /// Point the descriptor at a buffer and reset its status
    fn prepare(&mut self, buffer: PhysicalAddress, capacity: usize);

    /// Transfer ownership to the device; the final write to the descriptor
    fn give_to_device(&mut self);

    /// Decode a released descriptor
    ///
    /// `checksum_offload` says whether receive checksum offload is enabled,
    /// i.e. whether checksum status bits are meaningful.
    fn status(&self, checksum_offload: bool) -> RxStatus;
}

/// Where the rings live, for programming base registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub tx_base: PhysicalAddress,
    pub tx_count: usize,
    pub rx_base: PhysicalAddress,
    pub rx_count: usize,
    pub rx_buffer_size: usize,
}

/// Device configuration applied on start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartSettings {
    pub mac: MacAddress,
    pub rx_checksum: bool,
    pub promiscuous: bool,
}

/// Narrow a bus address for a 32-bit address register
pub fn bus_address32(address: PhysicalAddress, what: &'static str) -> Result<u32, HardwareError> {
    u32::try_from(address).map_err(|_| HardwareError::AddressOutOfRange(what))
}

/// Services and deadlines for register sequences that wait on hardware
#[derive(Clone, Copy)]
pub struct HwContext<'a> {
    pub platform: &'a dyn Platform,
    pub reset_timeout_us: u64,
    pub mdio_timeout_us: u64,
}

/// One NIC family
///
/// Methods take `&self`; backends keep whatever interior locking their
/// register file needs. `read_cause` and `acknowledge` are called from
/// interrupt context and must not block.
pub trait Backend: Send + Sync {
    type TxDescriptor: TxDescriptor + Send;
    type RxDescriptor: RxDescriptor + Send;

    /// Log prefix
    const NAME: &'static str;

    /// Keep the most recently reaped transmit slot unfilled so a device
    /// parked on a suspend bit always has one descriptor to park on
    const SUSPEND_GAP: bool = false;

    /// Ring lengths must be powers of two
    const POWER_OF_TWO_RINGS: bool = false;

    /// Largest frame (without FCS) the transmit path accepts
    const MAX_FRAME_SIZE: usize = 1514;

    /// Largest receive buffer the descriptor length field can describe
    const MAX_RX_BUFFER_SIZE: usize = 2047;

    /// Required alignment of descriptor rings
    const RING_ALIGN: usize = 16;

    /// Highest bus address the device can reach; rings, receive buffers and
    /// transmitted packets all have to sit at or below it
    const DMA_LIMIT: PhysicalAddress = PhysicalAddress::MAX;

    /// Offloads this device can perform
    fn supported_capabilities(&self) -> Capabilities;

    /// Station address as currently programmed or stored on the device
    fn read_mac_address(&self) -> MacAddress;

    /// Software reset, polled against `ctx.reset_timeout_us`
    fn reset(&self, ctx: &HwContext<'_>) -> Result<(), HardwareError>;

    /// Program ring bases and MAC settings, then enable DMA and interrupts
    fn start(
        &self,
        rings: &RingLayout,
        settings: &StartSettings,
        ctx: &HwContext<'_>,
    ) -> Result<(), HardwareError>;

    /// Stop DMA in both directions and mask interrupts
    fn halt(&self);

    /// Locate the PHY; called on every reset
    fn probe_phy(&self, _ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        Ok(())
    }

    /// Sample the current link state
    fn sense_link(&self, ctx: &HwContext<'_>) -> Result<LinkState, HardwareError>;

    /// Match MAC speed/duplex to a newly resolved link
    fn set_link_mode(&self, _speed: LinkSpeed, _duplex: Duplex) {}

    /// Read the interrupt cause register once; zero means "not ours"
    fn read_cause(&self) -> u32;

    /// Translate cause bits into portable events
    fn decode_cause(&self, cause: u32) -> Events;

    /// Acknowledge (clear) the given cause bits
    fn acknowledge(&self, cause: u32);

    /// Tell the transmit engine new descriptors are ready
    ///
    /// `first_posted` is the device address of the first descriptor posted
    /// since the previous doorbell.
    fn ring_doorbell(&self, first_posted: PhysicalAddress);

    /// Restart a receive unit that stalled for lack of descriptors
    fn resume_receive(&self) {}

    /// Whether the receive unit is parked for lack of descriptors
    ///
    /// Checked after every receive pass, since the stall interrupt may be
    /// folded into an earlier cause read and never seen on its own.
    fn receive_suspended(&self) -> bool {
        false
    }

    /// Turn receive checksum offload on or off
    fn set_rx_checksum(&self, _enable: bool, _ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        Err(HardwareError::NotSupported)
    }

    /// Turn promiscuous reception on or off
    fn set_promiscuous(&self, _enable: bool, _ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        Err(HardwareError::NotSupported)
    }
}
