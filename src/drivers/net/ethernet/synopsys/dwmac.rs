//! Synopsys DesignWare Ethernet MAC (GMAC 3.x) backend
//!
//! The DesignWare core splits into a MAC block at offset 0 (configuration,
//! filtering, GMII management, station address) and a DMA block at 0x1000
//! (bus mode, descriptor lists, status). Descriptors use the alternate
//! (enhanced) 32-byte layout in chained mode: every descriptor carries the
//! device address of its successor, so the rings never need an end-of-ring
//! marker.
//!
//! # Implementation Notes
//!
//! - DMA status bits 0-16 are write-1-to-clear; the MAC line interface
//!   summary (bit 26) is cleared by reading the RGMII status register
//! - Transmit checksum insertion is selected per descriptor; receive checksum
//!   results arrive in the extended status word when IPC is enabled
//! - MDIO goes through the GMII address/data pair and must be polled for
//!   completion, bounded by the caller's MDIO deadline
//! - CRC is stripped by the MAC (ACS + CST), so frame lengths exclude FCS
//!
//! # References
//!
//! - Synopsys DesignWare Cores Ethernet MAC Universal databook, 3.70a
//! - Linux: drivers/net/ethernet/stmicro/stmmac/dwmac1000_{core,dma}.c

use core::sync::atomic::{AtomicU8, Ordering};

use log::{debug, trace, warn};
use volatile::Volatile;

use crate::drivers::net::backend::{
    bus_address32, Backend, Descriptor, HwContext, RingLayout, RxDescriptor, StartSettings,
    TxDescriptor, TxRequest,
};
use crate::drivers::net::caps::Capabilities;
use crate::drivers::net::events::Events;
use crate::drivers::net::mii::{self, Mdio};
use crate::drivers::net::mmio::Registers;
use crate::drivers::net::netdev::{Duplex, HardwareError, LinkSpeed, LinkState, MacAddress};
use crate::drivers::net::packet::PacketFlags;
use crate::drivers::net::platform::{PhysicalAddress, Platform};
use crate::drivers::net::rx::{FrameStatus, RxChecksum, RxStatus};
use crate::drivers::net::tx::TxError;
use crate::drivers::timer::poll_until;

// ============================================================================
// MAC Registers
// ============================================================================

const MAC_CONFIGURATION: usize = 0x0000;
const MAC_FRAME_FILTER: usize = 0x0004;
const GMII_ADDRESS: usize = 0x0010;
const GMII_DATA: usize = 0x0014;
const MAC_INTERRUPT_MASK: usize = 0x003C;
const MAC_ADDRESS0_HIGH: usize = 0x0040;
const MAC_ADDRESS0_LOW: usize = 0x0044;
const RGMII_STATUS: usize = 0x00D8;
const MMC_RX_INTERRUPT_MASK: usize = 0x010C;
const MMC_TX_INTERRUPT_MASK: usize = 0x0110;
const MMC_IPC_RX_INTERRUPT_MASK: usize = 0x0200;

const MAC_CONFIG_RECEIVE_ENABLE: u32 = 1 << 2;
const MAC_CONFIG_TRANSMIT_ENABLE: u32 = 1 << 3;
const MAC_CONFIG_AUTO_PAD_CRC_STRIP: u32 = 1 << 7;
const MAC_CONFIG_CHECKSUM_OFFLOAD: u32 = 1 << 10;
const MAC_CONFIG_DUPLEX: u32 = 1 << 11;
const MAC_CONFIG_SPEED_100: u32 = 1 << 14;
/// Port select: MII (10/100) rather than GMII
const MAC_CONFIG_PORT_MII: u32 = 1 << 15;
const MAC_CONFIG_FRAME_BURST: u32 = 1 << 21;
const MAC_CONFIG_JABBER_DISABLE: u32 = 1 << 22;
/// Strip CRC from Ethernet II frames too
const MAC_CONFIG_TYPE_CRC_STRIP: u32 = 1 << 25;

const FRAME_FILTER_PROMISCUOUS: u32 = 1 << 0;
const FRAME_FILTER_HASH_MULTICAST: u32 = 1 << 2;

/// RGMII link change is the only MAC interrupt left unmasked
const MAC_INTERRUPT_RGMII: u32 = 1 << 0;
const MAC_INTERRUPT_MASK_ALL: u32 = 0x020F;

const MAC_ADDRESS_ENABLE: u32 = 1 << 31;

const MMC_MASK_ALL: u32 = 0x03FF_FFFF;
const MMC_IPC_MASK_ALL: u32 = 0x3FFF_3FFF;

const GMII_BUSY: u32 = 1 << 0;
const GMII_WRITE: u32 = 1 << 1;
const GMII_CLOCK_RANGE_SHIFT: u32 = 2;
/// CSR clock 20-35 MHz
const GMII_CLOCK_RANGE: u32 = 0x2;
const GMII_REGISTER_SHIFT: u32 = 6;
const GMII_PHY_SHIFT: u32 = 11;
const GMII_FIELD_MASK: u32 = 0x1F;

// ============================================================================
// DMA Registers
// ============================================================================

const DMA_BUS_MODE: usize = 0x1000;
const DMA_TX_POLL_DEMAND: usize = 0x1004;
const DMA_RX_POLL_DEMAND: usize = 0x1008;
const DMA_RX_LIST_ADDRESS: usize = 0x100C;
const DMA_TX_LIST_ADDRESS: usize = 0x1010;
const DMA_STATUS: usize = 0x1014;
const DMA_OPERATION_MODE: usize = 0x1018;
const DMA_INTERRUPT_ENABLE: usize = 0x101C;

const BUS_MODE_SOFTWARE_RESET: u32 = 1 << 0;
/// Alternate descriptor size: 32-byte descriptors
const BUS_MODE_ALTERNATE_DESCRIPTORS: u32 = 1 << 7;
const BUS_MODE_BURST_LENGTH_SHIFT: u32 = 8;
const BUS_MODE_BURST_LENGTH: u32 = 8;
const BUS_MODE_BURST_LENGTH_X8: u32 = 1 << 24;

const OP_MODE_START_RECEIVE: u32 = 1 << 1;
const OP_MODE_SECOND_FRAME: u32 = 1 << 2;
const OP_MODE_RX_THRESHOLD_32: u32 = 1 << 3;
const OP_MODE_FORWARD_UNDERSIZED: u32 = 1 << 6;
const OP_MODE_START_TRANSMIT: u32 = 1 << 13;
const OP_MODE_TX_STORE_FORWARD: u32 = 1 << 21;
const OP_MODE_RX_STORE_FORWARD: u32 = 1 << 25;

// Interrupt enable and status share bit positions
const DMA_TRANSMIT: u32 = 1 << 0;
const DMA_TRANSMIT_STOPPED: u32 = 1 << 1;
const DMA_TRANSMIT_JABBER: u32 = 1 << 3;
const DMA_RECEIVE_OVERFLOW: u32 = 1 << 4;
const DMA_TRANSMIT_UNDERFLOW: u32 = 1 << 5;
const DMA_RECEIVE: u32 = 1 << 6;
const DMA_RECEIVE_UNAVAILABLE: u32 = 1 << 7;
const DMA_RECEIVE_STOPPED: u32 = 1 << 8;
const DMA_RECEIVE_WATCHDOG: u32 = 1 << 9;
const DMA_FATAL_BUS_ERROR: u32 = 1 << 13;
const DMA_ABNORMAL_SUMMARY: u32 = 1 << 15;
const DMA_NORMAL_SUMMARY: u32 = 1 << 16;
/// Status only: MAC line interface (RGMII) interrupt
const DMA_STATUS_LINE_INTERFACE: u32 = 1 << 26;

const DMA_STATUS_CLEARABLE: u32 = 0x0001_FFFF;
const DMA_STATUS_ERRORS: u32 = DMA_TRANSMIT_JABBER
    | DMA_RECEIVE_OVERFLOW
    | DMA_TRANSMIT_UNDERFLOW
    | DMA_RECEIVE_WATCHDOG
    | DMA_FATAL_BUS_ERROR;

const DMA_INTERRUPTS: u32 = DMA_TRANSMIT
    | DMA_RECEIVE
    | DMA_RECEIVE_UNAVAILABLE
    | DMA_TRANSMIT_UNDERFLOW
    | DMA_FATAL_BUS_ERROR
    | DMA_ABNORMAL_SUMMARY
    | DMA_NORMAL_SUMMARY;

const POLL_INTERVAL_US: u64 = 10;

/// Locally administered; used when the station address registers were
/// never programmed
const FALLBACK_MAC: MacAddress = MacAddress([0x02, 0xDE, 0xC0, 0x00, 0x00, 0x01]);

// ============================================================================
// Descriptors
// ============================================================================

const DESC_OWN: u32 = 1 << 31;
const DESC_BUFFER_SIZE_MASK: u32 = 0x1FFF;

// TDES0
const TX_DEFERRED: u32 = 1 << 0;
const TX_UNDERFLOW: u32 = 1 << 1;
const TX_EXCESSIVE_COLLISIONS: u32 = 1 << 8;
const TX_LATE_COLLISION: u32 = 1 << 9;
const TX_NO_CARRIER: u32 = 1 << 10;
const TX_LOSS_OF_CARRIER: u32 = 1 << 11;
const TX_PAYLOAD_CHECKSUM_ERROR: u32 = 1 << 12;
const TX_JABBER_TIMEOUT: u32 = 1 << 14;
const TX_ERROR_SUMMARY: u32 = 1 << 15;
const TX_HEADER_CHECKSUM_ERROR: u32 = 1 << 16;
const TX_CHAINED: u32 = 1 << 20;
const TX_CHECKSUM_SHIFT: u32 = 22;
const TX_CHECKSUM_IP_HEADER: u32 = 1 << TX_CHECKSUM_SHIFT;
const TX_CHECKSUM_PSEUDOHEADER: u32 = 3 << TX_CHECKSUM_SHIFT;
const TX_FIRST_SEGMENT: u32 = 1 << 28;
const TX_LAST_SEGMENT: u32 = 1 << 29;
const TX_INTERRUPT_ON_COMPLETE: u32 = 1 << 30;

// RDES0
const RX_EXTENDED_STATUS: u32 = 1 << 0;
const RX_CRC_ERROR: u32 = 1 << 1;
const RX_LAST_DESCRIPTOR: u32 = 1 << 8;
const RX_FIRST_DESCRIPTOR: u32 = 1 << 9;
const RX_LENGTH_ERROR: u32 = 1 << 11;
const RX_SOURCE_FILTER_FAIL: u32 = 1 << 13;
/// Frame truncated for lack of buffer space
const RX_DESCRIPTOR_ERROR: u32 = 1 << 14;
const RX_ERROR_SUMMARY: u32 = 1 << 15;
const RX_FRAME_LENGTH_SHIFT: u32 = 16;
const RX_FRAME_LENGTH_MASK: u32 = 0x3FFF;
const RX_DESTINATION_FILTER_FAIL: u32 = 1 << 30;
const RX_ERRORS: u32 = RX_LENGTH_ERROR
    | RX_SOURCE_FILTER_FAIL
    | RX_DESCRIPTOR_ERROR
    | RX_ERROR_SUMMARY
    | RX_DESTINATION_FILTER_FAIL;

// RDES1
const RX_CHAINED: u32 = 1 << 14;

// RDES4 (extended status)
const RX_PAYLOAD_TYPE_MASK: u32 = 0x7;
const RX_PAYLOAD_UDP: u32 = 1;
const RX_PAYLOAD_TCP: u32 = 2;
const RX_IP_HEADER_ERROR: u32 = 1 << 3;
const RX_IP_PAYLOAD_ERROR: u32 = 1 << 4;
const RX_CHECKSUM_BYPASSED: u32 = 1 << 5;

/// Enhanced descriptor, shared layout for both directions
#[repr(C)]
pub struct DwmacDescriptor {
    /// TDES0/RDES0: ownership, control and status
    control: Volatile<u32>,
    buffer_size: Volatile<u32>,
    buffer: Volatile<u32>,
    next: Volatile<u32>,
    extended_status: Volatile<u32>,
    reserved: Volatile<u32>,
    timestamp_low: Volatile<u32>,
    timestamp_high: Volatile<u32>,
}

impl DwmacDescriptor {
    fn zero(&mut self) {
        self.control.write(0);
        self.buffer_size.write(0);
        self.buffer.write(0);
        self.next.write(0);
        self.extended_status.write(0);
        self.reserved.write(0);
        self.timestamp_low.write(0);
        self.timestamp_high.write(0);
    }
}

#[repr(transparent)]
pub struct DwmacTxDescriptor(DwmacDescriptor);

#[repr(transparent)]
pub struct DwmacRxDescriptor(DwmacDescriptor);

impl Descriptor for DwmacTxDescriptor {
    fn link(&mut self, _own: PhysicalAddress, next: PhysicalAddress, _last: bool) {
        self.0.zero();
        self.0.control.write(TX_CHAINED);
        self.0.next.write(next as u32);
    }

    fn released(&self) -> bool {
        self.0.control.read() & DESC_OWN == 0
    }
}

fn checksum_insertion(flags: PacketFlags) -> u32 {
    if !flags.contains(PacketFlags::IP_CHECKSUM_OFFLOAD) {
        0
    } else if flags.intersects(PacketFlags::TCP_CHECKSUM_OFFLOAD | PacketFlags::UDP_CHECKSUM_OFFLOAD)
    {
        TX_CHECKSUM_PSEUDOHEADER
    } else {
        TX_CHECKSUM_IP_HEADER
    }
}

impl TxDescriptor for DwmacTxDescriptor {
    fn prepare(&mut self, request: &TxRequest) {
        let mut control =
            TX_CHAINED | TX_FIRST_SEGMENT | TX_LAST_SEGMENT | checksum_insertion(request.flags);
        if request.interrupt {
            control |= TX_INTERRUPT_ON_COMPLETE;
        }

        // Frames above DMA_LIMIT never reach the ring
        self.0.buffer.write(request.buffer as u32);
        self.0
            .buffer_size
            .write(request.length as u32 & DESC_BUFFER_SIZE_MASK);
        self.0.control.write(control);
    }

    fn give_to_device(&mut self) {
        self.0.control.update(|control| *control |= DESC_OWN);
    }

    fn completion(&self) -> Result<(), TxError> {
        let status = self.0.control.read();
        if status & TX_ERROR_SUMMARY == 0 {
            if status & TX_DEFERRED != 0 {
                trace!("[dwmac] transmit deferred");
            }
            return Ok(());
        }

        Err(if status & TX_UNDERFLOW != 0 {
            TxError::Underrun
        } else if status & TX_LATE_COLLISION != 0 {
            TxError::LateCollision
        } else if status & TX_EXCESSIVE_COLLISIONS != 0 {
            TxError::ExcessiveCollisions
        } else if status & (TX_NO_CARRIER | TX_LOSS_OF_CARRIER) != 0 {
            TxError::CarrierLost
        } else if status & TX_JABBER_TIMEOUT != 0 {
            TxError::Jabber
        } else if status & (TX_HEADER_CHECKSUM_ERROR | TX_PAYLOAD_CHECKSUM_ERROR) != 0 {
            TxError::Checksum
        } else {
            TxError::Other
        })
    }

    fn clear(&mut self) {
        self.0.control.write(TX_CHAINED);
        self.0.buffer_size.write(0);
    }
}

impl Descriptor for DwmacRxDescriptor {
    fn link(&mut self, _own: PhysicalAddress, next: PhysicalAddress, _last: bool) {
        self.0.zero();
        self.0.buffer_size.write(RX_CHAINED);
        self.0.next.write(next as u32);
    }

    fn released(&self) -> bool {
        self.0.control.read() & DESC_OWN == 0
    }
}

impl DwmacRxDescriptor {
    fn checksum(&self, control: u32) -> RxChecksum {
        if control & RX_EXTENDED_STATUS == 0 {
            return RxChecksum::empty();
        }

        let extended = self.0.extended_status.read();
        if extended & RX_IP_HEADER_ERROR != 0 {
            return RxChecksum::IP_FAILED;
        }
        if extended & RX_CHECKSUM_BYPASSED != 0 {
            return RxChecksum::empty();
        }

        let payload_failed = extended & RX_IP_PAYLOAD_ERROR != 0;
        RxChecksum::IP_OK
            | match (extended & RX_PAYLOAD_TYPE_MASK, payload_failed) {
                (RX_PAYLOAD_TCP, false) => RxChecksum::TCP_OK,
                (RX_PAYLOAD_TCP, true) => RxChecksum::TCP_FAILED,
                (RX_PAYLOAD_UDP, false) => RxChecksum::UDP_OK,
                (RX_PAYLOAD_UDP, true) => RxChecksum::UDP_FAILED,
                _ => RxChecksum::empty(),
            }
    }
}

impl RxDescriptor for DwmacRxDescriptor {
    fn prepare(&mut self, buffer: PhysicalAddress, capacity: usize) {
        self.0.buffer.write(buffer as u32);
        self.0
            .buffer_size
            .write(RX_CHAINED | (capacity as u32 & DESC_BUFFER_SIZE_MASK));
        self.0.extended_status.write(0);
        self.0.control.write(0);
    }

    fn give_to_device(&mut self) {
        self.0.control.write(DESC_OWN);
    }

    fn status(&self, checksum_offload: bool) -> RxStatus {
        let control = self.0.control.read();
        let whole_frame = RX_FIRST_DESCRIPTOR | RX_LAST_DESCRIPTOR;

        let status = if control & RX_ERRORS != 0 {
            if control & RX_CRC_ERROR != 0 {
                FrameStatus::CrcError
            } else if control & (RX_LENGTH_ERROR | RX_DESCRIPTOR_ERROR) != 0 {
                FrameStatus::LengthError
            } else {
                FrameStatus::FrameError
            }
        } else if control & whole_frame != whole_frame {
            FrameStatus::LengthError
        } else {
            FrameStatus::Ok
        };

        let checksum = if checksum_offload && status == FrameStatus::Ok {
            self.checksum(control)
        } else {
            RxChecksum::empty()
        };

        RxStatus {
            length: ((control >> RX_FRAME_LENGTH_SHIFT) & RX_FRAME_LENGTH_MASK) as usize,
            status,
            checksum,
        }
    }
}

// ============================================================================
// GMII Management
// ============================================================================

/// MDIO through the GMII address/data pair, bounded by one deadline per
/// access
struct Gmii<'a, R: Registers> {
    regs: &'a R,
    platform: &'a dyn Platform,
    timeout_us: u64,
}

impl<R: Registers> Gmii<'_, R> {
    fn command(phy: u8, reg: u8) -> u32 {
        ((phy as u32 & GMII_FIELD_MASK) << GMII_PHY_SHIFT)
            | ((reg as u32 & GMII_FIELD_MASK) << GMII_REGISTER_SHIFT)
            | (GMII_CLOCK_RANGE << GMII_CLOCK_RANGE_SHIFT)
            | GMII_BUSY
    }

    fn wait(&self) -> Result<(), HardwareError> {
        poll_until(self.platform, self.timeout_us, POLL_INTERVAL_US, || {
            self.regs.read32(GMII_ADDRESS) & GMII_BUSY == 0
        })
        .map_err(|_| HardwareError::Timeout("MDIO"))
    }
}

impl<R: Registers> Mdio for Gmii<'_, R> {
    fn mdio_read(&self, phy: u8, reg: u8) -> Result<u16, HardwareError> {
        self.regs.write32(GMII_ADDRESS, Self::command(phy, reg));
        self.wait()?;
        Ok(self.regs.read32(GMII_DATA) as u16)
    }

    fn mdio_write(&self, phy: u8, reg: u8, value: u16) -> Result<(), HardwareError> {
        self.regs.write32(GMII_DATA, value as u32);
        self.regs
            .write32(GMII_ADDRESS, Self::command(phy, reg) | GMII_WRITE);
        self.wait()
    }
}

// ============================================================================
// Backend
// ============================================================================

const NO_PHY: u8 = u8::MAX;

/// One DesignWare GMAC
pub struct Dwmac<R: Registers> {
    regs: R,
    phy: AtomicU8,
    fallback_mac: MacAddress,
}

impl<R: Registers> Dwmac<R> {
    pub fn new(regs: R) -> Self {
        Self {
            regs,
            phy: AtomicU8::new(NO_PHY),
            fallback_mac: FALLBACK_MAC,
        }
    }

    /// Station address to use when the MAC registers read back unprogrammed,
    /// typically taken from firmware tables
    pub fn with_fallback_mac(mut self, mac: MacAddress) -> Self {
        self.fallback_mac = mac;
        self
    }

    fn gmii<'a>(&'a self, ctx: &HwContext<'a>) -> Gmii<'a, R> {
        Gmii {
            regs: &self.regs,
            platform: ctx.platform,
            timeout_us: ctx.mdio_timeout_us,
        }
    }
}

impl<R: Registers> Backend for Dwmac<R> {
    type TxDescriptor = DwmacTxDescriptor;
    type RxDescriptor = DwmacRxDescriptor;

    const NAME: &'static str = "dwmac";
    const RING_ALIGN: usize = 32;
    const DMA_LIMIT: PhysicalAddress = u32::MAX as PhysicalAddress;

    fn supported_capabilities(&self) -> Capabilities {
        Capabilities::CHECKSUM | Capabilities::PROMISCUOUS
    }

    fn read_mac_address(&self) -> MacAddress {
        let low = self.regs.read32(MAC_ADDRESS0_LOW);
        let high = self.regs.read32(MAC_ADDRESS0_HIGH) & 0xFFFF;
        if low == u32::MAX && high == 0xFFFF {
            warn!(
                "[dwmac] station address not programmed, using {}",
                self.fallback_mac
            );
            return self.fallback_mac;
        }

        let low = low.to_le_bytes();
        let high = high.to_le_bytes();
        MacAddress([low[0], low[1], low[2], low[3], high[0], high[1]])
    }

    fn reset(&self, ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        self.regs
            .modify32(DMA_BUS_MODE, |v| v | BUS_MODE_SOFTWARE_RESET);
        poll_until(ctx.platform, ctx.reset_timeout_us, POLL_INTERVAL_US, || {
            self.regs.read32(DMA_BUS_MODE) & BUS_MODE_SOFTWARE_RESET == 0
        })
        .map_err(|_| HardwareError::Timeout("software reset"))?;

        self.regs.modify32(DMA_BUS_MODE, |v| {
            v | BUS_MODE_ALTERNATE_DESCRIPTORS
                | BUS_MODE_BURST_LENGTH_X8
                | (BUS_MODE_BURST_LENGTH << BUS_MODE_BURST_LENGTH_SHIFT)
        });

        debug!("[dwmac] reset complete");
        Ok(())
    }

    fn start(
        &self,
        rings: &RingLayout,
        settings: &StartSettings,
        _ctx: &HwContext<'_>,
    ) -> Result<(), HardwareError> {
        let regs = &self.regs;
        let tx_base = bus_address32(rings.tx_base, "transmit descriptor list")?;
        let rx_base = bus_address32(rings.rx_base, "receive descriptor list")?;

        regs.modify32(DMA_OPERATION_MODE, |v| {
            v & !(OP_MODE_START_RECEIVE | OP_MODE_START_TRANSMIT)
        });
        regs.write32(DMA_TX_LIST_ADDRESS, tx_base);
        regs.write32(DMA_RX_LIST_ADDRESS, rx_base);

        let mac = settings.mac.as_bytes();
        regs.write32(
            MAC_ADDRESS0_LOW,
            u32::from_le_bytes([mac[0], mac[1], mac[2], mac[3]]),
        );
        regs.write32(
            MAC_ADDRESS0_HIGH,
            MAC_ADDRESS_ENABLE | u16::from_le_bytes([mac[4], mac[5]]) as u32,
        );

        let mut filter = FRAME_FILTER_HASH_MULTICAST;
        if settings.promiscuous {
            filter |= FRAME_FILTER_PROMISCUOUS;
        }
        regs.write32(MAC_FRAME_FILTER, filter);

        regs.modify32(DMA_OPERATION_MODE, |v| {
            (v & !OP_MODE_RX_STORE_FORWARD)
                | OP_MODE_TX_STORE_FORWARD
                | OP_MODE_SECOND_FRAME
                | OP_MODE_FORWARD_UNDERSIZED
                | OP_MODE_RX_THRESHOLD_32
        });

        regs.write32(DMA_STATUS, DMA_STATUS_CLEARABLE);
        regs.write32(DMA_INTERRUPT_ENABLE, DMA_INTERRUPTS);
        regs.write32(
            MAC_INTERRUPT_MASK,
            MAC_INTERRUPT_MASK_ALL & !MAC_INTERRUPT_RGMII,
        );
        regs.write32(MMC_RX_INTERRUPT_MASK, MMC_MASK_ALL);
        regs.write32(MMC_TX_INTERRUPT_MASK, MMC_MASK_ALL);
        regs.write32(MMC_IPC_RX_INTERRUPT_MASK, MMC_IPC_MASK_ALL);

        regs.modify32(DMA_OPERATION_MODE, |v| {
            v | OP_MODE_START_RECEIVE | OP_MODE_START_TRANSMIT
        });

        regs.modify32(MAC_CONFIGURATION, |mut v| {
            v |= MAC_CONFIG_JABBER_DISABLE
                | MAC_CONFIG_AUTO_PAD_CRC_STRIP
                | MAC_CONFIG_TYPE_CRC_STRIP
                | MAC_CONFIG_FRAME_BURST
                | MAC_CONFIG_TRANSMIT_ENABLE
                | MAC_CONFIG_RECEIVE_ENABLE;
            if settings.rx_checksum {
                v |= MAC_CONFIG_CHECKSUM_OFFLOAD;
            } else {
                v &= !MAC_CONFIG_CHECKSUM_OFFLOAD;
            }
            v
        });

        Ok(())
    }

    fn halt(&self) {
        self.regs.write32(DMA_INTERRUPT_ENABLE, 0);
        self.regs.modify32(DMA_OPERATION_MODE, |v| {
            v & !(OP_MODE_START_RECEIVE | OP_MODE_START_TRANSMIT)
        });
        self.regs.modify32(MAC_CONFIGURATION, |v| {
            v & !(MAC_CONFIG_TRANSMIT_ENABLE | MAC_CONFIG_RECEIVE_ENABLE)
        });
    }

    fn probe_phy(&self, ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        let gmii = self.gmii(ctx);
        let phy = mii::probe_phy(&gmii)?;
        mii::configure_phy(&gmii, phy, ctx.platform, ctx.reset_timeout_us)?;
        self.phy.store(phy, Ordering::Release);

        debug!(
            "[dwmac] PHY {:#010x} at address {}",
            mii::read_phy_id(&gmii, phy).unwrap_or(0),
            phy
        );
        Ok(())
    }

    fn sense_link(&self, ctx: &HwContext<'_>) -> Result<LinkState, HardwareError> {
        match self.phy.load(Ordering::Acquire) {
            NO_PHY => Err(HardwareError::PhyNotFound),
            phy => mii::read_link(&self.gmii(ctx), phy),
        }
    }

    fn set_link_mode(&self, speed: LinkSpeed, duplex: Duplex) {
        self.regs.modify32(MAC_CONFIGURATION, |mut v| {
            v &= !(MAC_CONFIG_SPEED_100 | MAC_CONFIG_PORT_MII | MAC_CONFIG_DUPLEX);
            match speed {
                LinkSpeed::Mbps1000 => {}
                LinkSpeed::Mbps100 => v |= MAC_CONFIG_SPEED_100 | MAC_CONFIG_PORT_MII,
                LinkSpeed::Mbps10 => v |= MAC_CONFIG_PORT_MII,
            }
            if duplex == Duplex::Full {
                v |= MAC_CONFIG_DUPLEX;
            }
            v
        });
    }

    fn read_cause(&self) -> u32 {
        self.regs.read32(DMA_STATUS) & (DMA_STATUS_CLEARABLE | DMA_STATUS_LINE_INTERFACE)
    }

    fn decode_cause(&self, cause: u32) -> Events {
        let mut events = Events::empty();

        if cause & DMA_RECEIVE != 0 {
            events |= Events::RX_READY;
        }
        if cause & DMA_RECEIVE_UNAVAILABLE != 0 {
            events |= Events::RX_READY | Events::RX_STALLED;
        }
        if cause & DMA_TRANSMIT != 0 {
            events |= Events::TX_DONE;
        }
        if cause & DMA_STATUS_ERRORS != 0 {
            events |= Events::ERROR;
        }
        if cause & DMA_STATUS_LINE_INTERFACE != 0 {
            events |= Events::LINK_CHECK;
        }
        if cause & (DMA_TRANSMIT_STOPPED | DMA_RECEIVE_STOPPED) != 0 {
            trace!("[dwmac] DMA stopped: {:#x}", cause);
        }
        events
    }

    fn acknowledge(&self, cause: u32) {
        let clearable = cause & DMA_STATUS_CLEARABLE;
        if clearable != 0 {
            self.regs.write32(DMA_STATUS, clearable);
        }
        if cause & DMA_STATUS_LINE_INTERFACE != 0 {
            self.regs.read32(RGMII_STATUS);
        }
    }

    fn ring_doorbell(&self, _first_posted: PhysicalAddress) {
        self.regs.write32(DMA_TX_POLL_DEMAND, 1);
    }

    fn resume_receive(&self) {
        self.regs.write32(DMA_RX_POLL_DEMAND, 1);
    }

    fn set_rx_checksum(&self, enable: bool, _ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        self.regs.modify32(MAC_CONFIGURATION, |v| {
            if enable {
                v | MAC_CONFIG_CHECKSUM_OFFLOAD
            } else {
                v & !MAC_CONFIG_CHECKSUM_OFFLOAD
            }
        });
        Ok(())
    }

    fn set_promiscuous(&self, enable: bool, _ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        self.regs.modify32(MAC_FRAME_FILTER, |v| {
            if enable {
                v | FRAME_FILTER_PROMISCUOUS
            } else {
                v & !FRAME_FILTER_PROMISCUOUS
            }
        });
        Ok(())
    }
}
