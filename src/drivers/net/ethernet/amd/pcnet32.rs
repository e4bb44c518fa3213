//! AMD PCnet-PCI (Am79C97x) backend
//!
//! The PCnet family hides almost everything behind an indexed window: write a
//! register number to the register address port (RAP), then read or write the
//! control and status register (CSR) through RDP or the bus control register
//! (BCR) through BDP. The interrupt handler reads and acknowledges CSR0
//! through the same window the worker uses for MII access, so every
//! select-then-access pair runs under an interrupt-masking
//! [`Mutex`](crate::sync::Mutex).
//!
//! Descriptors use the classic OWN bit and live in contiguous rings whose
//! length is encoded as a power of two in the initialization block.
//!
//! # Implementation Notes
//!
//! - The chip is switched to 32-bit I/O (DWIO) and software style 3
//!   (PCnet-PCI II, 32-bit structures) on every reset
//! - The part number in CSR88/CSR89 selects per-chip quirks: auto-select,
//!   full duplex, and whether link comes from an MII PHY or the BCR4 LED
//! - The initialization block is built in a scratch DMA block and freed once
//!   the chip reports IDON
//! - Interrupt enable in CSR0 is write-0-to-clear, so every CSR0 write that
//!   acknowledges or kicks the chip also writes IENA
//! - Received message counts include the FCS, which is stripped here
//!
//! # References
//!
//! - AMD Am79C973/Am79C975 PCnet-FAST III datasheet
//! - AMD Am79C970A PCnet-PCI II datasheet
//! - Linux: drivers/net/ethernet/amd/pcnet32.c

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use bitflags::bitflags;
use log::{debug, info, trace, warn};
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
use crate::drivers::net::platform::PhysicalAddress;
use crate::drivers::net::rx::{FrameStatus, RxChecksum, RxStatus};
use crate::drivers::net::tx::TxError;
use crate::drivers::timer::poll_until;
use crate::sync::mutex::MutexGuard;
use crate::sync::Mutex;

// ============================================================================
// I/O Ports
// ============================================================================

/// Station address PROM, readable bytewise in either I/O mode
const APROM: usize = 0x00;

// 16-bit I/O (WIO), the mode after hardware reset
const WIO_RESET: usize = 0x14;

// 32-bit I/O (DWIO)
const DWIO_RDP: usize = 0x10;
const DWIO_RAP: usize = 0x14;
const DWIO_RESET: usize = 0x18;
const DWIO_BDP: usize = 0x1C;

// ============================================================================
// Control and Status Registers
// ============================================================================

const CSR0_STATUS: u32 = 0;
const CSR1_INIT_BLOCK_LOW: u32 = 1;
const CSR2_INIT_BLOCK_HIGH: u32 = 2;
const CSR3_INTERRUPT_MASKS: u32 = 3;
const CSR4_FEATURES: u32 = 4;
const CSR5_EXTENDED_CONTROL: u32 = 5;
const CSR15_MODE: u32 = 15;
const CSR88_CHIP_ID_LOW: u32 = 88;
const CSR89_CHIP_ID_HIGH: u32 = 89;

// CSR0 bits
const CSR0_ERROR: u16 = 1 << 15;
const CSR0_BABBLE: u16 = 1 << 14;
const CSR0_COLLISION_ERROR: u16 = 1 << 13;
const CSR0_MISSED_FRAME: u16 = 1 << 12;
const CSR0_MEMORY_ERROR: u16 = 1 << 11;
const CSR0_RECEIVE_INTERRUPT: u16 = 1 << 10;
const CSR0_TRANSMIT_INTERRUPT: u16 = 1 << 9;
const CSR0_INIT_DONE: u16 = 1 << 8;
const CSR0_INTERRUPT_ENABLE: u16 = 1 << 6;
const CSR0_TRANSMIT_DEMAND: u16 = 1 << 3;
const CSR0_STOP: u16 = 1 << 2;
const CSR0_START: u16 = 1 << 1;
const CSR0_INIT: u16 = 1 << 0;

/// Write-1-to-clear cause bits; ERR is their read-only summary
const CSR0_CAUSE_MASK: u16 = CSR0_BABBLE
    | CSR0_COLLISION_ERROR
    | CSR0_MISSED_FRAME
    | CSR0_MEMORY_ERROR
    | CSR0_RECEIVE_INTERRUPT
    | CSR0_TRANSMIT_INTERRUPT;

// CSR3 bits
const CSR3_INIT_DONE_MASK: u16 = 1 << 8;

// CSR4 bits
const CSR4_AUTO_PAD_TRANSMIT: u16 = 1 << 11;
const CSR4_AUTO_STRIP_RECEIVE: u16 = 1 << 10;
const CSR4_TRANSMIT_START_MASK: u16 = 1 << 2;

// CSR5 bits
const CSR5_SUSPEND: u16 = 1 << 0;

// CSR15 (mode) bits, also the low half of the init block mode word
const MODE_PROMISCUOUS: u16 = 1 << 15;
const MODE_PORT_SELECT_SHIFT: u16 = 7;
const MODE_PORT_SELECT_PHY: u16 = 0x3;

const CHIP_ID_PART_SHIFT: u32 = 12;
const CHIP_ID_PART_MASK: u32 = 0xFFFF;

// ============================================================================
// Bus Control Registers
// ============================================================================

const BCR2_MISC: u32 = 2;
const BCR4_LED_CONTROL: u32 = 4;
const BCR9_FULL_DUPLEX: u32 = 9;
const BCR20_SOFTWARE_STYLE: u32 = 20;
const BCR32_PHY_CONTROL: u32 = 32;
const BCR33_PHY_ADDRESS: u32 = 33;
const BCR34_PHY_DATA: u32 = 34;

const BCR2_AUTO_SELECT: u16 = 1 << 1;
const BCR2_LED_PROGRAMMING: u16 = 1 << 12;

const BCR4_LED_OUT: u16 = 1 << 15;
const BCR4_FULL_DUPLEX_STATUS: u16 = 1 << 8;
const BCR4_PULSE_STRETCH: u16 = 1 << 7;
const BCR4_LINK_STATUS: u16 = 1 << 6;
const BCR4_DEFAULT_MASK: u16 = BCR4_LINK_STATUS | BCR4_PULSE_STRETCH;
const BCR4_FULL_DUPLEX_MASK: u16 = BCR4_DEFAULT_MASK | BCR4_FULL_DUPLEX_STATUS;

const BCR9_FULL_DUPLEX_ENABLE: u16 = 1 << 0;
const BCR9_AUI_FULL_DUPLEX: u16 = 1 << 1;

/// PCnet-PCI II: 32-bit descriptors and initialization block
const BCR20_STYLE_PCNET_PCI_II: u16 = 0x03;

const BCR32_DISABLE_AUTONEG_SETUP: u16 = 1 << 7;
const BCR32_AUTONEG_ENABLE: u16 = 1 << 5;
const BCR32_FULL_DUPLEX: u16 = 1 << 4;
const BCR32_100_MBPS: u16 = 1 << 3;

const BCR33_PHY_SHIFT: u16 = 5;
const BCR33_FIELD_MASK: u16 = 0x1F;

/// Source: PCNET_INITIALIZATION_TIMEOUT / PCNET_SUSPEND_TIMEOUT (1 s each);
/// callers pass the reset deadline from [`HwContext`]
const POLL_INTERVAL_US: u64 = 10;

const FCS_LEN: usize = 4;

// ============================================================================
// Chip Identification
// ============================================================================

bitflags! {
    /// Per-part behaviour
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChipFeatures: u32 {
        /// BCR2 auto-selects between AUI and 10BASE-T
        const AUTO_SELECT = 1 << 0;
        const FULL_DUPLEX = 1 << 1;
        /// Integrated MII PHY, reached through BCR33/BCR34
        const PHY = 1 << 2;
        const MBPS_100 = 1 << 3;
        /// Full duplex is also possible on the AUI port
        const AUI = 1 << 4;
        /// Link LED cannot be read; assume the link is up
        const NO_LINK_STATUS = 1 << 5;
    }
}

struct ChipInfo {
    part: u32,
    name: &'static str,
    features: ChipFeatures,
}

const CHIPS: [ChipInfo; 4] = [
    ChipInfo {
        part: 0x243B,
        name: "Am79C970",
        features: ChipFeatures::AUTO_SELECT.union(ChipFeatures::AUI),
    },
    ChipInfo {
        part: 0x2621,
        name: "Am79C970A",
        features: ChipFeatures::AUTO_SELECT
            .union(ChipFeatures::AUI)
            .union(ChipFeatures::FULL_DUPLEX),
    },
    ChipInfo {
        part: 0x2625,
        name: "Am79C973",
        features: ChipFeatures::FULL_DUPLEX
            .union(ChipFeatures::PHY)
            .union(ChipFeatures::MBPS_100),
    },
    ChipInfo {
        part: 0x2627,
        name: "Am79C975",
        features: ChipFeatures::FULL_DUPLEX
            .union(ChipFeatures::PHY)
            .union(ChipFeatures::MBPS_100),
    },
];

// ============================================================================
// Descriptors
// ============================================================================

const DESC_OWN: u32 = 1 << 31;
const DESC_ERROR: u32 = 1 << 30;
const DESC_START_OF_PACKET: u32 = 1 << 25;
const DESC_END_OF_PACKET: u32 = 1 << 24;
/// Must-be-ones field above the byte count
const DESC_ONES: u32 = 0xF000;
const DESC_BYTE_COUNT_MASK: u32 = 0x0FFF;

const TX_ADD_FCS: u32 = 1 << 29;

// Transmit status word
/// Chip ran out of buffer mid-frame; always reported with UFLO
const TX_STATUS_BUFFER: u32 = 1 << 31;
const TX_STATUS_UNDERFLOW: u32 = 1 << 30;
const TX_STATUS_LATE_COLLISION: u32 = 1 << 28;
const TX_STATUS_LOSS_OF_CARRIER: u32 = 1 << 27;
const TX_STATUS_RETRY: u32 = 1 << 26;

const RX_CRC: u32 = 1 << 27;
const RX_BUFFER: u32 = 1 << 26;
const RX_MESSAGE_LENGTH_MASK: u32 = 0x0FFF;

/// Byte counts are stored negated, in twelve bits
fn byte_count(length: usize) -> u32 {
    DESC_ONES | ((length as u32).wrapping_neg() & DESC_BYTE_COUNT_MASK)
}

/// Transmit descriptor (TMD), 32-bit software style
#[repr(C)]
pub struct Pcnet32TxDescriptor {
    buffer: Volatile<u32>,
    control: Volatile<u32>,
    status: Volatile<u32>,
    reserved: Volatile<u32>,
}

impl Descriptor for Pcnet32TxDescriptor {
    fn link(&mut self, _own: PhysicalAddress, _next: PhysicalAddress, _last: bool) {
        self.buffer.write(0);
        self.control.write(0);
        self.status.write(0);
        self.reserved.write(0);
    }

    fn released(&self) -> bool {
        self.control.read() & DESC_OWN == 0
    }
}

impl TxDescriptor for Pcnet32TxDescriptor {
    // No per-descriptor interrupt select in this style; every completion
    // raises TINT
    fn prepare(&mut self, request: &TxRequest) {
        // Frames above DMA_LIMIT never reach the ring
        self.buffer.write(request.buffer as u32);
        self.status.write(0);
        self.control.write(
            DESC_START_OF_PACKET | DESC_END_OF_PACKET | TX_ADD_FCS | byte_count(request.length),
        );
    }

    fn give_to_device(&mut self) {
        self.control.update(|control| *control |= DESC_OWN);
    }

    fn completion(&self) -> Result<(), TxError> {
        if self.control.read() & DESC_ERROR == 0 {
            return Ok(());
        }

        let status = self.status.read();
        Err(if status & (TX_STATUS_UNDERFLOW | TX_STATUS_BUFFER) != 0 {
            TxError::Underrun
        } else if status & TX_STATUS_LATE_COLLISION != 0 {
            TxError::LateCollision
        } else if status & TX_STATUS_RETRY != 0 {
            TxError::ExcessiveCollisions
        } else if status & TX_STATUS_LOSS_OF_CARRIER != 0 {
            TxError::CarrierLost
        } else {
            TxError::Other
        })
    }

    fn clear(&mut self) {
        self.control.write(0);
        self.status.write(0);
    }
}

/// Receive descriptor (RMD), 32-bit software style
#[repr(C)]
pub struct Pcnet32RxDescriptor {
    buffer: Volatile<u32>,
    control: Volatile<u32>,
    message_length: Volatile<u32>,
    reserved: Volatile<u32>,
}

impl Descriptor for Pcnet32RxDescriptor {
    fn link(&mut self, _own: PhysicalAddress, _next: PhysicalAddress, _last: bool) {
        self.buffer.write(0);
        self.control.write(0);
        self.message_length.write(0);
        self.reserved.write(0);
    }

    fn released(&self) -> bool {
        self.control.read() & DESC_OWN == 0
    }
}

impl RxDescriptor for Pcnet32RxDescriptor {
    fn prepare(&mut self, buffer: PhysicalAddress, capacity: usize) {
        self.buffer.write(buffer as u32);
        self.message_length.write(0);
        self.control.write(byte_count(capacity));
    }

    fn give_to_device(&mut self) {
        self.control.update(|control| *control |= DESC_OWN);
    }

    fn status(&self, _checksum_offload: bool) -> RxStatus {
        let control = self.control.read();
        let whole_frame = DESC_START_OF_PACKET | DESC_END_OF_PACKET;

        let status = if control & DESC_ERROR != 0 {
            if control & RX_CRC != 0 {
                FrameStatus::CrcError
            } else if control & RX_BUFFER != 0 {
                FrameStatus::LengthError
            } else {
                // Framing or FIFO overflow
                FrameStatus::FrameError
            }
        } else if control & whole_frame != whole_frame {
            // Frame spilled into a second buffer
            FrameStatus::LengthError
        } else {
            FrameStatus::Ok
        };

        let length = (self.message_length.read() & RX_MESSAGE_LENGTH_MASK) as usize;
        RxStatus {
            length: length.saturating_sub(FCS_LEN),
            status,
            checksum: RxChecksum::empty(),
        }
    }
}

/// Initialization block, 32-bit software style
#[repr(C)]
#[allow(dead_code)] // read by the chip
struct InitBlock {
    /// CSR15 mode in the low half, log2 ring lengths in the high nibbles
    mode: u32,
    mac: [u8; 6],
    reserved: u16,
    logical_filter: [u32; 2],
    rx_ring: u32,
    tx_ring: u32,
}

const INIT_RX_LENGTH_SHIFT: u32 = 20;
const INIT_TX_LENGTH_SHIFT: u32 = 28;

// ============================================================================
// Register Window
// ============================================================================

/// The RAP/RDP/BDP window, held for one select-then-access sequence
struct Window<'a, R: Registers> {
    regs: &'a R,
    _guard: MutexGuard<'a, ()>,
}

impl<R: Registers> Window<'_, R> {
    fn read_csr(&self, csr: u32) -> u16 {
        self.regs.write32(DWIO_RAP, csr);
        self.regs.read32(DWIO_RDP) as u16
    }

    fn write_csr(&self, csr: u32, value: u16) {
        self.regs.write32(DWIO_RAP, csr);
        self.regs.write32(DWIO_RDP, value as u32);
    }

    fn read_bcr(&self, bcr: u32) -> u16 {
        self.regs.write32(DWIO_RAP, bcr);
        self.regs.read32(DWIO_BDP) as u16
    }

    fn write_bcr(&self, bcr: u32, value: u16) {
        self.regs.write32(DWIO_RAP, bcr);
        self.regs.write32(DWIO_BDP, value as u32);
    }

    fn modify_csr(&self, csr: u32, f: impl FnOnce(u16) -> u16) {
        let value = self.read_csr(csr);
        self.write_csr(csr, f(value));
    }

    fn modify_bcr(&self, bcr: u32, f: impl FnOnce(u16) -> u16) {
        let value = self.read_bcr(bcr);
        self.write_bcr(bcr, f(value));
    }
}

// ============================================================================
// Backend
// ============================================================================

/// No PHY found (or none expected)
const NO_PHY: u8 = u8::MAX;

/// One PCnet controller
pub struct Pcnet32<R: Registers> {
    regs: R,
    window: Mutex<()>,
    /// [`ChipFeatures`] of the part found by the last reset
    features: AtomicU32,
    phy: AtomicU8,
}

impl<R: Registers> Pcnet32<R> {
    pub fn new(regs: R) -> Self {
        Self {
            regs,
            window: Mutex::new(()),
            features: AtomicU32::new(0),
            phy: AtomicU8::new(NO_PHY),
        }
    }

    fn window(&self) -> Window<'_, R> {
        Window {
            regs: &self.regs,
            _guard: self.window.lock(),
        }
    }

    pub fn features(&self) -> ChipFeatures {
        ChipFeatures::from_bits_truncate(self.features.load(Ordering::Acquire))
    }

    fn read_csr(&self, csr: u32) -> u16 {
        self.window().read_csr(csr)
    }

    /// Read CSR88/89 and look the part up
    fn identify(&self) -> ChipFeatures {
        let window = self.window();
        let chip_id = window.read_csr(CSR88_CHIP_ID_LOW) as u32
            | (window.read_csr(CSR89_CHIP_ID_HIGH) as u32) << 16;
        drop(window);
        let part = (chip_id >> CHIP_ID_PART_SHIFT) & CHIP_ID_PART_MASK;

        match CHIPS.iter().find(|chip| chip.part == part) {
            Some(chip) => {
                info!("[pcnet32] {} (part {:#06x})", chip.name, part);
                chip.features
            }
            None => {
                warn!(
                    "[pcnet32] untested part {:#06x}, treating it like {}",
                    part, CHIPS[0].name
                );
                CHIPS[0].features
            }
        }
    }

    /// Apply per-part BCR/CSR settings after a reset
    fn configure(&self, features: ChipFeatures) {
        let window = self.window();

        window.write_bcr(BCR20_SOFTWARE_STYLE, BCR20_STYLE_PCNET_PCI_II);

        if features.contains(ChipFeatures::AUTO_SELECT) {
            window.modify_bcr(BCR2_MISC, |v| v | BCR2_AUTO_SELECT);
        }

        if features.contains(ChipFeatures::FULL_DUPLEX) {
            window.modify_bcr(BCR9_FULL_DUPLEX, |mut v| {
                v |= BCR9_FULL_DUPLEX_ENABLE;
                if features.contains(ChipFeatures::AUI) {
                    v |= BCR9_AUI_FULL_DUPLEX;
                }
                v
            });
            // The link LED must also report full-duplex link
            window.modify_bcr(BCR2_MISC, |v| v | BCR2_LED_PROGRAMMING);
            window.modify_bcr(BCR4_LED_CONTROL, |v| v | BCR4_FULL_DUPLEX_MASK);
        }

        window.modify_csr(CSR4_FEATURES, |v| {
            v | CSR4_AUTO_PAD_TRANSMIT | CSR4_AUTO_STRIP_RECEIVE | CSR4_TRANSMIT_START_MASK
        });
        window.modify_csr(CSR3_INTERRUPT_MASKS, |v| v | CSR3_INIT_DONE_MASK);
    }

    fn mode(&self, promiscuous: bool) -> u16 {
        let mut mode = 0;
        // Parts with an internal PHY have no BCR2 auto-select
        if self.features().contains(ChipFeatures::PHY) {
            mode |= MODE_PORT_SELECT_PHY << MODE_PORT_SELECT_SHIFT;
        }
        if promiscuous {
            mode |= MODE_PROMISCUOUS;
        }
        mode
    }

    /// Link from the BCR4 LED register, for parts without an MII PHY
    fn led_link(&self) -> LinkState {
        let features = self.features();
        let duplex = if features.contains(ChipFeatures::FULL_DUPLEX) {
            Duplex::Full
        } else {
            Duplex::Half
        };
        let up = LinkState::Up {
            speed: LinkSpeed::Mbps10,
            duplex,
        };

        if features.contains(ChipFeatures::NO_LINK_STATUS) {
            return up;
        }

        let mask = if features.contains(ChipFeatures::FULL_DUPLEX) {
            BCR4_FULL_DUPLEX_MASK
        } else {
            BCR4_DEFAULT_MASK
        };
        let led = self.window().read_bcr(BCR4_LED_CONTROL);
        if led & !mask & BCR4_LED_OUT != 0 {
            up
        } else {
            LinkState::Down
        }
    }
}

impl<R: Registers> Mdio for Pcnet32<R> {
    fn mdio_read(&self, phy: u8, reg: u8) -> Result<u16, HardwareError> {
        let window = self.window();
        window.write_bcr(BCR33_PHY_ADDRESS, phy_address(phy, reg));
        Ok(window.read_bcr(BCR34_PHY_DATA))
    }

    fn mdio_write(&self, phy: u8, reg: u8, value: u16) -> Result<(), HardwareError> {
        let window = self.window();
        window.write_bcr(BCR33_PHY_ADDRESS, phy_address(phy, reg));
        window.write_bcr(BCR34_PHY_DATA, value);
        Ok(())
    }
}

fn phy_address(phy: u8, reg: u8) -> u16 {
    ((phy as u16 & BCR33_FIELD_MASK) << BCR33_PHY_SHIFT) | (reg as u16 & BCR33_FIELD_MASK)
}

impl<R: Registers> Backend for Pcnet32<R> {
    type TxDescriptor = Pcnet32TxDescriptor;
    type RxDescriptor = Pcnet32RxDescriptor;

    const NAME: &'static str = "pcnet32";
    const POWER_OF_TWO_RINGS: bool = true;
    const MAX_RX_BUFFER_SIZE: usize = DESC_BYTE_COUNT_MASK as usize;
    const DMA_LIMIT: PhysicalAddress = u32::MAX as PhysicalAddress;

    fn supported_capabilities(&self) -> Capabilities {
        Capabilities::PROMISCUOUS
    }

    fn read_mac_address(&self) -> MacAddress {
        let mut mac = [0u8; 6];
        for (index, byte) in mac.iter_mut().enumerate() {
            *byte = self.regs.read8(APROM + index);
        }
        MacAddress(mac)
    }

    fn reset(&self, ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        {
            let _window = self.window.lock();
            // Reading the reset port resets the chip into 16-bit mode; a
            // 32-bit write to RDP then latches DWIO until the next reset
            self.regs.read16(WIO_RESET);
            self.regs.read32(DWIO_RESET);
            self.regs.write32(DWIO_RDP, 0);
        }

        poll_until(ctx.platform, ctx.reset_timeout_us, POLL_INTERVAL_US, || {
            self.read_csr(CSR0_STATUS) & CSR0_STOP != 0
        })
        .map_err(|_| HardwareError::Timeout("software reset"))?;

        let features = self.identify();
        self.features.store(features.bits(), Ordering::Release);
        self.configure(features);

        debug!("[pcnet32] reset complete, features {:?}", features);
        Ok(())
    }

    fn start(
        &self,
        rings: &RingLayout,
        settings: &StartSettings,
        ctx: &HwContext<'_>,
    ) -> Result<(), HardwareError> {
        let rx_ring = bus_address32(rings.rx_base, "receive ring")?;
        let tx_ring = bus_address32(rings.tx_base, "transmit ring")?;
        let region = ctx
            .platform
            .dma_allocate_below(core::mem::size_of::<InitBlock>(), 16, Self::DMA_LIMIT)
            .ok_or(HardwareError::NoMemory("initialization block"))?;

        let mut mac = [0u8; 6];
        mac.copy_from_slice(settings.mac.as_bytes());
        let block = InitBlock {
            mode: self.mode(settings.promiscuous) as u32
                | (rings.rx_count.trailing_zeros() << INIT_RX_LENGTH_SHIFT)
                | (rings.tx_count.trailing_zeros() << INIT_TX_LENGTH_SHIFT),
            mac,
            reserved: 0,
            logical_filter: [0; 2],
            rx_ring,
            tx_ring,
        };
        // SAFETY: the region is sized and aligned for one InitBlock and is
        // exclusively ours until freed
        unsafe {
            (region.as_ptr() as *mut InitBlock).write_volatile(block);
        }
        ctx.platform
            .dma_sync_for_device(region.physical(), region.len());

        // Allocated below DMA_LIMIT
        let address = region.physical() as u32;
        {
            let window = self.window();
            window.write_csr(CSR1_INIT_BLOCK_LOW, address as u16);
            window.write_csr(CSR2_INIT_BLOCK_HIGH, (address >> 16) as u16);
            window.write_csr(CSR0_STATUS, CSR0_INIT);
        }

        let done = poll_until(ctx.platform, ctx.reset_timeout_us, POLL_INTERVAL_US, || {
            self.read_csr(CSR0_STATUS) & CSR0_INIT_DONE != 0
        });
        // The chip copies the block during INIT
        ctx.platform.dma_free(region);
        done.map_err(|_| HardwareError::Timeout("initialization"))?;

        let window = self.window();
        window.write_csr(CSR0_STATUS, CSR0_INIT_DONE);
        window.write_csr(CSR0_STATUS, CSR0_START | CSR0_INTERRUPT_ENABLE);
        Ok(())
    }

    fn halt(&self) {
        self.window().write_csr(CSR0_STATUS, CSR0_STOP);
    }

    fn probe_phy(&self, _ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        if !self.features().contains(ChipFeatures::PHY) {
            self.phy.store(NO_PHY, Ordering::Release);
            return Ok(());
        }

        let phy = mii::probe_phy(self)?;
        self.phy.store(phy, Ordering::Release);

        // Autonegotiation through plain BMCR does not take on these parts;
        // BCR32 drives it instead
        self.window().modify_bcr(BCR32_PHY_CONTROL, |v| {
            (v & !(BCR32_DISABLE_AUTONEG_SETUP
                | BCR32_AUTONEG_ENABLE
                | BCR32_FULL_DUPLEX
                | BCR32_100_MBPS))
                | BCR32_AUTONEG_ENABLE
        });

        debug!("[pcnet32] PHY at address {}", phy);
        Ok(())
    }

    fn sense_link(&self, _ctx: &HwContext<'_>) -> Result<LinkState, HardwareError> {
        match self.phy.load(Ordering::Acquire) {
            NO_PHY => Ok(self.led_link()),
            phy => mii::read_link(self, phy),
        }
    }

    fn set_link_mode(&self, _speed: LinkSpeed, duplex: Duplex) {
        if !self.features().contains(ChipFeatures::FULL_DUPLEX) {
            return;
        }
        self.window().modify_bcr(BCR9_FULL_DUPLEX, |v| match duplex {
            Duplex::Full => v | BCR9_FULL_DUPLEX_ENABLE,
            Duplex::Half => v & !BCR9_FULL_DUPLEX_ENABLE,
        });
    }

    fn read_cause(&self) -> u32 {
        (self.read_csr(CSR0_STATUS) & CSR0_CAUSE_MASK) as u32
    }

    fn decode_cause(&self, cause: u32) -> Events {
        let cause = cause as u16;
        let mut events = Events::empty();

        // A missed frame means the ring ran dry; reaping frees descriptors
        // and the chip polls the ring again on its own
        if cause & (CSR0_RECEIVE_INTERRUPT | CSR0_MISSED_FRAME) != 0 {
            events |= Events::RX_READY;
        }
        if cause & CSR0_TRANSMIT_INTERRUPT != 0 {
            events |= Events::TX_DONE;
        }
        if cause & (CSR0_BABBLE | CSR0_MEMORY_ERROR) != 0 {
            events |= Events::ERROR;
        }
        if cause & CSR0_COLLISION_ERROR != 0 {
            trace!("[pcnet32] SQE test error");
        }
        events
    }

    fn acknowledge(&self, cause: u32) {
        // Cause bits are write-1-to-clear, IENA is write-0-to-clear
        self.window()
            .write_csr(CSR0_STATUS, cause as u16 | CSR0_INTERRUPT_ENABLE);
    }

    fn ring_doorbell(&self, _first_posted: PhysicalAddress) {
        self.window()
            .write_csr(CSR0_STATUS, CSR0_TRANSMIT_DEMAND | CSR0_INTERRUPT_ENABLE);
    }

    fn set_promiscuous(&self, enable: bool, ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        let running = self.read_csr(CSR0_STATUS) & CSR0_STOP == 0;

        // CSR15 is only writable while stopped or suspended
        if running {
            self.window()
                .modify_csr(CSR5_EXTENDED_CONTROL, |v| v | CSR5_SUSPEND);
            poll_until(ctx.platform, ctx.reset_timeout_us, POLL_INTERVAL_US, || {
                self.read_csr(CSR5_EXTENDED_CONTROL) & CSR5_SUSPEND != 0
            })
            .map_err(|_| HardwareError::Timeout("suspend"))?;
        }

        let window = self.window();
        window.modify_csr(CSR15_MODE, |v| {
            if enable {
                v | MODE_PROMISCUOUS
            } else {
                v & !MODE_PROMISCUOUS
            }
        });
        if running {
            window.modify_csr(CSR5_EXTENDED_CONTROL, |v| v & !CSR5_SUSPEND);
        }
        Ok(())
    }
}
