//! Intel 8255x (e100) Fast Ethernet backend
//!
//! The 8255x has no ownership bit. The command unit (CU) walks a linked list
//! of command blocks and parks on any block carrying the suspend bit; the
//! receive unit (RU) does the same over receive frame descriptors. Posting a
//! block is therefore: fill it in with the suspend bit set, clear the suspend
//! bit of its predecessor, then poke the CU with a resume command.
//!
//! Because the CU parks *on* the most recently posted block, that block must
//! not be rewritten while the device may still be looking at it, so this
//! backend runs with [`Backend::SUSPEND_GAP`]: one transmit slot always stays
//! unfilled.
//!
//! # Implementation Notes
//!
//! - Transmit blocks use flexible mode with a single inline TBD, so packet
//!   buffers are never copied
//! - Receive frames use flexible mode with the RBD embedded in the same
//!   32-byte descriptor
//! - The station address is programmed with an IA Setup command from a
//!   scratch block before the transmit ring is attached
//! - Link state comes straight from the general status register
//!
//! # References
//!
//! - Intel 8255x 10/100 Mbps Ethernet Controller Family Open Source Software
//!   Developer Manual
//! - Linux: drivers/net/ethernet/intel/e100.c

use core::sync::atomic::{fence, Ordering};

use log::{debug, trace, warn};
use volatile::Volatile;

use crate::drivers::net::backend::{
    bus_address32, Backend, Descriptor, HwContext, RingLayout, RxDescriptor, StartSettings,
    TxDescriptor, TxRequest,
};
use crate::drivers::net::caps::Capabilities;
use crate::drivers::net::events::Events;
use crate::drivers::net::mmio::Registers;
use crate::drivers::net::netdev::{Duplex, HardwareError, LinkSpeed, LinkState, MacAddress};
use crate::drivers::net::platform::PhysicalAddress;
use crate::drivers::net::rx::{FrameStatus, RxChecksum, RxStatus};
use crate::drivers::net::tx::TxError;
use crate::drivers::timer::poll_until;

// ============================================================================
// System Control Block (SCB)
// ============================================================================

/// Status word: unit states in the low byte, STAT/ACK in the high byte
const SCB_STATUS: usize = 0x00;
/// Write-1-to-clear view of the STAT/ACK byte
const SCB_ACK: usize = 0x01;
const SCB_COMMAND: usize = 0x02;
const SCB_INTERRUPT_MASK: usize = 0x03;
const SCB_POINTER: usize = 0x04;
const PORT: usize = 0x08;
/// Link, speed and duplex as resolved by the PHY (82558 and later)
const GENERAL_STATUS: usize = 0x1D;

// SCB_STATUS interrupt bits
const STATUS_COMMAND_COMPLETE: u16 = 1 << 15;
const STATUS_FRAME_RECEIVED: u16 = 1 << 14;
const STATUS_COMMAND_NOT_ACTIVE: u16 = 1 << 13;
const STATUS_RECEIVE_NOT_READY: u16 = 1 << 12;
const STATUS_MDI_COMPLETE: u16 = 1 << 11;
const STATUS_SOFTWARE_INTERRUPT: u16 = 1 << 10;
const STATUS_EARLY_RECEIVE: u16 = 1 << 9;
const STATUS_FLOW_CONTROL_PAUSE: u16 = 1 << 8;
const STATUS_INTERRUPT_MASK: u16 = 0xFF00;

// SCB_STATUS unit states
const STATUS_COMMAND_UNIT_MASK: u16 = 3 << 6;
const STATUS_COMMAND_UNIT_IDLE: u16 = 0;
const STATUS_RECEIVE_UNIT_MASK: u16 = 0xF << 2;
const STATUS_RECEIVE_UNIT_IDLE: u16 = 0;
const STATUS_RECEIVE_UNIT_SUSPENDED: u16 = 1 << 2;
const STATUS_RECEIVE_UNIT_READY: u16 = 4 << 2;

// SCB_COMMAND values
const COMMAND_RECEIVE_START: u8 = 0x01;
const COMMAND_RECEIVE_RESUME: u8 = 0x02;
const COMMAND_RECEIVE_LOAD_BASE: u8 = 0x06;
const COMMAND_UNIT_START: u8 = 0x10;
const COMMAND_UNIT_RESUME: u8 = 0x20;
const COMMAND_UNIT_LOAD_BASE: u8 = 0x60;

// SCB_INTERRUPT_MASK bits
const INTERRUPT_MASK_ALL: u8 = 1 << 0;

// PORT commands
const PORT_SOFTWARE_RESET: u32 = 0;
const PORT_SELECTIVE_RESET: u32 = 2;

/// Source: Intel manual, 6.3.3.1 (10 us after a PORT reset)
const PORT_RESET_DELAY_US: u64 = 20;

// GENERAL_STATUS bits
const GENERAL_STATUS_LINK_UP: u8 = 1 << 0;
const GENERAL_STATUS_100_MBPS: u8 = 1 << 1;
const GENERAL_STATUS_FULL_DUPLEX: u8 = 1 << 2;

/// Spins allowed for the SCB to accept a command
///
/// Doorbells have no clock to hand, so this wait is counted, not timed.
/// Source: Linux e100 E100_WAIT_SCB_TIMEOUT
const SCB_COMMAND_SPINS: usize = 20_000;

const POLL_INTERVAL_US: u64 = 10;

// ============================================================================
// Command Block / Receive Frame Descriptor Fields
// ============================================================================
// Dword 0 of both: status in bits 0-15, command in bits 16-31

const CB_STATUS_COMPLETE: u32 = 1 << 15;
const CB_STATUS_OK: u32 = 1 << 13;
const CB_STATUS_UNDERRUN: u32 = 1 << 12;

const CB_COMMAND_SHIFT: u32 = 16;
const CB_COMMAND_IA_SETUP: u32 = 1;
const CB_COMMAND_TRANSMIT: u32 = 4;
const CB_FLEXIBLE_MODE: u32 = 1 << 19;
const CB_INTERRUPT: u32 = 1 << 29;
const CB_SUSPEND: u32 = 1 << 30;
const CB_END_OF_LIST: u32 = 1 << 31;

/// Transmit threshold in units of 8 bytes
const TRANSMIT_THRESHOLD: u32 = 0xE0;
const TBD_COUNT_SHIFT: u32 = 24;
const TBD_THRESHOLD_SHIFT: u32 = 16;
const TBD_END_OF_LIST: u32 = 1 << 16;

const RFD_STATUS_COMPLETE: u32 = 1 << 15;
const RFD_STATUS_OK: u32 = 1 << 13;
const RFD_STATUS_CRC_ERROR: u32 = 1 << 11;
const RFD_STATUS_ALIGNMENT_ERROR: u32 = 1 << 10;
const RFD_STATUS_NO_RESOURCES: u32 = 1 << 9;
const RFD_STATUS_OVERRUN: u32 = 1 << 8;
const RFD_STATUS_TOO_SHORT: u32 = 1 << 7;
const RFD_STATUS_RECEIVE_ERROR: u32 = 1 << 4;
const RFD_FLEXIBLE_MODE: u32 = 1 << 19;
const RFD_SUSPEND: u32 = 1 << 30;

const RBD_COUNT_MASK: u32 = 0x3FFF;
const RBD_END_OF_FRAME: u32 = 1 << 15;

// ============================================================================
// Descriptors
// ============================================================================

/// Transmit command block with its one transmit buffer descriptor
#[repr(C)]
pub struct E100Command {
    status_command: Volatile<u32>,
    link: Volatile<u32>,
    tbd_array: Volatile<u32>,
    tbd_properties: Volatile<u32>,
    buffer: Volatile<u32>,
    buffer_size: Volatile<u32>,
    /// Software only: this block's own bus address
    own: Volatile<u32>,
    /// Software only: interrupt request carried from `prepare`
    interrupt: Volatile<u32>,
}

/// Offset of the inline TBD within [`E100Command`]
const TBD_OFFSET: u32 = 16;

impl Descriptor for E100Command {
    fn link(&mut self, own: PhysicalAddress, next: PhysicalAddress, _last: bool) {
        self.own.write(own as u32);
        self.link.write(next as u32);
        self.status_command.write(0);
    }

    fn released(&self) -> bool {
        self.status_command.read() & CB_STATUS_COMPLETE != 0
    }

    fn resume_chain(&mut self) {
        self.status_command.update(|word| *word &= !CB_SUSPEND);
    }
}

impl TxDescriptor for E100Command {
    fn prepare(&mut self, request: &TxRequest) {
        self.tbd_array.write(self.own.read() + TBD_OFFSET);
        self.tbd_properties
            .write((1 << TBD_COUNT_SHIFT) | (TRANSMIT_THRESHOLD << TBD_THRESHOLD_SHIFT));
        // Frames above DMA_LIMIT never reach the ring
        self.buffer.write(request.buffer as u32);
        self.buffer_size
            .write((request.length as u32 & RBD_COUNT_MASK) | TBD_END_OF_LIST);
        self.interrupt.write(request.interrupt as u32);
    }

    fn give_to_device(&mut self) {
        let mut command =
            (CB_COMMAND_TRANSMIT << CB_COMMAND_SHIFT) | CB_FLEXIBLE_MODE | CB_SUSPEND;
        if self.interrupt.read() != 0 {
            command |= CB_INTERRUPT;
        }
        self.status_command.write(command);
    }

    fn completion(&self) -> Result<(), TxError> {
        let status = self.status_command.read();
        if status & CB_STATUS_OK != 0 {
            Ok(())
        } else if status & CB_STATUS_UNDERRUN != 0 {
            Err(TxError::Underrun)
        } else {
            Err(TxError::Other)
        }
    }

    fn clear(&mut self) {
        self.status_command.write(0);
        self.interrupt.write(0);
    }
}

/// Receive frame descriptor with its receive buffer descriptor
#[repr(C)]
pub struct E100ReceiveFrame {
    status_command: Volatile<u32>,
    link: Volatile<u32>,
    rbd: Volatile<u32>,
    sizes: Volatile<u32>,
    rbd_count: Volatile<u32>,
    rbd_link: Volatile<u32>,
    rbd_buffer: Volatile<u32>,
    rbd_size: Volatile<u32>,
}

const RBD_OFFSET: u32 = 16;

impl Descriptor for E100ReceiveFrame {
    fn link(&mut self, own: PhysicalAddress, next: PhysicalAddress, _last: bool) {
        self.link.write(next as u32);
        self.rbd.write(own as u32 + RBD_OFFSET);
        self.rbd_link.write(next as u32 + RBD_OFFSET);
        self.status_command.write(0);
    }

    fn released(&self) -> bool {
        self.status_command.read() & RFD_STATUS_COMPLETE != 0
    }

    fn resume_chain(&mut self) {
        self.status_command.update(|word| *word &= !RFD_SUSPEND);
    }
}

impl RxDescriptor for E100ReceiveFrame {
    fn prepare(&mut self, buffer: PhysicalAddress, capacity: usize) {
        self.rbd_buffer.write(buffer as u32);
        self.rbd_size.write(capacity as u32 & RBD_COUNT_MASK);
        self.rbd_count.write(0);
        self.sizes.write(0);
    }

    fn give_to_device(&mut self) {
        self.status_command.write(RFD_FLEXIBLE_MODE | RFD_SUSPEND);
    }

    fn status(&self, _checksum_offload: bool) -> RxStatus {
        let status = self.status_command.read();
        let count = self.rbd_count.read();

        let status = if status & RFD_STATUS_OK != 0 && count & RBD_END_OF_FRAME != 0 {
            FrameStatus::Ok
        } else if status & RFD_STATUS_CRC_ERROR != 0 {
            FrameStatus::CrcError
        } else if status & RFD_STATUS_TOO_SHORT != 0 {
            FrameStatus::LengthError
        } else if status
            & (RFD_STATUS_ALIGNMENT_ERROR
                | RFD_STATUS_NO_RESOURCES
                | RFD_STATUS_OVERRUN
                | RFD_STATUS_RECEIVE_ERROR)
            != 0
        {
            FrameStatus::FrameError
        } else if count & RBD_END_OF_FRAME == 0 {
            FrameStatus::LengthError
        } else {
            FrameStatus::FrameError
        };

        RxStatus {
            length: (count & RBD_COUNT_MASK) as usize,
            status,
            checksum: RxChecksum::empty(),
        }
    }
}

// ============================================================================
// Backend
// ============================================================================

/// One 8255x controller
pub struct E100<R: Registers> {
    regs: R,
    mac: MacAddress,
}

impl<R: Registers> E100<R> {
    /// `mac` is the station address from the EEPROM or platform firmware
    pub fn new(regs: R, mac: MacAddress) -> Self {
        Self { regs, mac }
    }

    fn status(&self) -> u16 {
        self.regs.read16(SCB_STATUS)
    }

    /// Wait for the SCB to accept the previous command, then issue `command`
    fn command(&self, command: u8) {
        if !self.wait_command_accepted() {
            warn!("[e100] SCB busy, issuing {:#04x} anyway", command);
        }
        self.regs.write8(SCB_COMMAND, command);
    }

    fn command_with_pointer(&self, command: u8, pointer: u32) {
        if !self.wait_command_accepted() {
            warn!("[e100] SCB busy, issuing {:#04x} anyway", command);
        }
        self.regs.write32(SCB_POINTER, pointer);
        self.regs.write8(SCB_COMMAND, command);
    }

    fn wait_command_accepted(&self) -> bool {
        for _ in 0..SCB_COMMAND_SPINS {
            if self.regs.read8(SCB_COMMAND) == 0 {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    }

    /// Run an IA Setup command from a scratch block and wait for it
    fn set_individual_address(&self, mac: MacAddress, ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        let region = ctx
            .platform
            .dma_allocate_below(16, 16, Self::DMA_LIMIT)
            .ok_or(HardwareError::NoMemory("IA setup block"))?;

        let block = region.as_ptr() as *mut Volatile<u32>;
        let mut address = [0u8; 8];
        address[..6].copy_from_slice(mac.as_bytes());

        // SAFETY: the region is 16 bytes, exclusively ours until freed
        unsafe {
            (*block).write(CB_END_OF_LIST | (CB_COMMAND_IA_SETUP << CB_COMMAND_SHIFT));
            (*block.add(1)).write(0xFFFF_FFFF);
            (*block.add(2)).write(u32::from_le_bytes([address[0], address[1], address[2], address[3]]));
            (*block.add(3)).write(u32::from_le_bytes([address[4], address[5], 0, 0]));
        }
        fence(Ordering::Release);

        self.command_with_pointer(COMMAND_UNIT_START, region.physical() as u32);
        // SAFETY: as above; the device writes the status half
        let done = poll_until(ctx.platform, ctx.reset_timeout_us, POLL_INTERVAL_US, || unsafe {
            (*block).read() & CB_STATUS_COMPLETE != 0
        });
        ctx.platform.dma_free(region);

        done.map_err(|_| HardwareError::Timeout("IA setup"))
    }
}

impl<R: Registers> Backend for E100<R> {
    type TxDescriptor = E100Command;
    type RxDescriptor = E100ReceiveFrame;

    const NAME: &'static str = "e100";
    const SUSPEND_GAP: bool = true;
    const MAX_RX_BUFFER_SIZE: usize = RBD_COUNT_MASK as usize;
    const DMA_LIMIT: PhysicalAddress = u32::MAX as PhysicalAddress;

    fn supported_capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn read_mac_address(&self) -> MacAddress {
        self.mac
    }

    fn reset(&self, ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        self.regs.write32(PORT, PORT_SOFTWARE_RESET);
        ctx.platform.delay_us(PORT_RESET_DELAY_US);

        poll_until(ctx.platform, ctx.reset_timeout_us, POLL_INTERVAL_US, || {
            self.regs.read8(SCB_COMMAND) == 0
        })
        .map_err(|_| HardwareError::Timeout("software reset"))?;

        self.regs.write8(SCB_INTERRUPT_MASK, INTERRUPT_MASK_ALL);
        debug!("[e100] reset complete");
        Ok(())
    }

    fn start(
        &self,
        rings: &RingLayout,
        settings: &StartSettings,
        ctx: &HwContext<'_>,
    ) -> Result<(), HardwareError> {
        let rx_base = bus_address32(rings.rx_base, "receive frame area")?;
        bus_address32(rings.tx_base, "command block list")?;

        self.regs.write8(SCB_INTERRUPT_MASK, INTERRUPT_MASK_ALL);

        // Ring pointers are absolute bus addresses
        self.command_with_pointer(COMMAND_UNIT_LOAD_BASE, 0);
        self.command_with_pointer(COMMAND_RECEIVE_LOAD_BASE, 0);

        self.set_individual_address(settings.mac, ctx)?;

        self.command_with_pointer(COMMAND_RECEIVE_START, rx_base);
        poll_until(ctx.platform, ctx.reset_timeout_us, POLL_INTERVAL_US, || {
            self.status() & STATUS_RECEIVE_UNIT_MASK != STATUS_RECEIVE_UNIT_IDLE
        })
        .map_err(|_| HardwareError::Timeout("receive unit start"))?;

        let receive_unit = self.status() & STATUS_RECEIVE_UNIT_MASK;
        if receive_unit != STATUS_RECEIVE_UNIT_READY {
            warn!("[e100] receive unit state {:#x} after start", receive_unit >> 2);
        }

        // Ack anything left over from the IA setup
        self.regs.write8(SCB_ACK, 0xFF);
        self.regs.write8(SCB_INTERRUPT_MASK, 0);
        Ok(())
    }

    fn halt(&self) {
        self.regs.write8(SCB_INTERRUPT_MASK, INTERRUPT_MASK_ALL);
        self.regs.write32(PORT, PORT_SELECTIVE_RESET);
    }

    fn sense_link(&self, _ctx: &HwContext<'_>) -> Result<LinkState, HardwareError> {
        let status = self.regs.read8(GENERAL_STATUS);
        if status & GENERAL_STATUS_LINK_UP == 0 {
            return Ok(LinkState::Down);
        }

        let speed = if status & GENERAL_STATUS_100_MBPS != 0 {
            LinkSpeed::Mbps100
        } else {
            LinkSpeed::Mbps10
        };
        let duplex = if status & GENERAL_STATUS_FULL_DUPLEX != 0 {
            Duplex::Full
        } else {
            Duplex::Half
        };
        Ok(LinkState::Up { speed, duplex })
    }

    fn read_cause(&self) -> u32 {
        (self.status() & STATUS_INTERRUPT_MASK) as u32
    }

    fn decode_cause(&self, cause: u32) -> Events {
        let cause = cause as u16;
        let mut events = Events::empty();

        if cause & (STATUS_FRAME_RECEIVED | STATUS_EARLY_RECEIVE) != 0 {
            events |= Events::RX_READY;
        }
        if cause & STATUS_RECEIVE_NOT_READY != 0 {
            events |= Events::RX_READY | Events::RX_STALLED;
        }
        if cause & (STATUS_COMMAND_COMPLETE | STATUS_COMMAND_NOT_ACTIVE) != 0 {
            events |= Events::TX_DONE;
        }
        if cause & (STATUS_MDI_COMPLETE | STATUS_SOFTWARE_INTERRUPT | STATUS_FLOW_CONTROL_PAUSE) != 0
        {
            trace!("[e100] ignored cause bits {:#06x}", cause);
        }
        events
    }

    fn acknowledge(&self, cause: u32) {
        // Bits set between the read and this write stay latched and
        // re-assert the level-triggered line
        self.regs.write8(SCB_ACK, (cause >> 8) as u8);
    }

    fn ring_doorbell(&self, first_posted: PhysicalAddress) {
        if self.status() & STATUS_COMMAND_UNIT_MASK == STATUS_COMMAND_UNIT_IDLE {
            self.command_with_pointer(COMMAND_UNIT_START, first_posted as u32);
        } else {
            // Resume unconditionally: some emulated parts report "active"
            // after parking on a suspended block
            self.command(COMMAND_UNIT_RESUME);
        }
    }

    fn resume_receive(&self) {
        let receive_unit = self.status() & STATUS_RECEIVE_UNIT_MASK;
        if receive_unit == STATUS_RECEIVE_UNIT_SUSPENDED {
            self.command(COMMAND_RECEIVE_RESUME);
        } else if receive_unit != STATUS_RECEIVE_UNIT_READY {
            warn!("[e100] receive unit in state {:#x}, not resuming", receive_unit >> 2);
        }
    }

    fn receive_suspended(&self) -> bool {
        self.status() & STATUS_RECEIVE_UNIT_MASK == STATUS_RECEIVE_UNIT_SUSPENDED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::net::packet::PacketFlags;
    use crate::drivers::net::ring::DescriptorRing;
    use crate::drivers::net::sim::{Access, RegisterFile, SimPlatform};
    use alloc::sync::Arc;

    const MAC: MacAddress = MacAddress([0x00, 0xAA, 0x00, 0x12, 0x34, 0x56]);

    fn ctx(platform: &SimPlatform) -> HwContext<'_> {
        HwContext {
            platform,
            reset_timeout_us: 1_000,
            mdio_timeout_us: 100,
        }
    }

    fn request(buffer: PhysicalAddress, length: usize) -> TxRequest {
        TxRequest {
            buffer,
            length,
            flags: PacketFlags::empty(),
            interrupt: false,
        }
    }

    #[test]
    fn test_command_block_layout() {
        assert_eq!(core::mem::size_of::<E100Command>(), 32);
        assert_eq!(core::mem::size_of::<E100ReceiveFrame>(), 32);
    }

    #[test]
    fn test_transmit_block_encoding() {
        let mut ring: DescriptorRing<E100Command> =
            DescriptorRing::new(Arc::new(SimPlatform::new()), 4, 16, true).unwrap();
        let base = ring.base() as u32;

        ring.post(&request(0x8000, 60)).unwrap();
        let cb = ring.descriptor(0);

        let word = cb.status_command.read();
        assert_eq!((word >> CB_COMMAND_SHIFT) & 0x7, CB_COMMAND_TRANSMIT);
        assert_ne!(word & CB_SUSPEND, 0);
        assert_ne!(word & CB_FLEXIBLE_MODE, 0);
        assert_eq!(word & CB_STATUS_COMPLETE, 0);
        assert_eq!(cb.link.read(), base + 32);
        assert_eq!(cb.tbd_array.read(), base + TBD_OFFSET);
        assert_eq!(cb.tbd_properties.read() >> TBD_COUNT_SHIFT, 1);
        assert_eq!(cb.buffer.read(), 0x8000);
        assert_eq!(cb.buffer_size.read(), 60 | TBD_END_OF_LIST);
    }

    #[test]
    fn test_posting_clears_predecessor_suspend() {
        let mut ring: DescriptorRing<E100Command> =
            DescriptorRing::new(Arc::new(SimPlatform::new()), 4, 16, true).unwrap();

        ring.post(&request(0x1000, 60)).unwrap();
        ring.post(&request(0x2000, 60)).unwrap();

        assert_eq!(ring.descriptor(0).status_command.read() & CB_SUSPEND, 0);
        assert_ne!(ring.descriptor(1).status_command.read() & CB_SUSPEND, 0);
        // Suspend gap: three of four slots
        assert!(ring.post(&request(0x3000, 60)).is_some());
        assert!(ring.post(&request(0x4000, 60)).is_none());
    }

    #[test]
    fn test_transmit_completion_decode() {
        let mut ring: DescriptorRing<E100Command> =
            DescriptorRing::new(Arc::new(SimPlatform::new()), 4, 16, true).unwrap();
        ring.post(&request(0x1000, 60)).unwrap();
        let cb = ring.descriptor_mut(0);

        assert!(!cb.released());
        cb.status_command
            .update(|w| *w |= CB_STATUS_COMPLETE | CB_STATUS_OK);
        assert!(cb.released());
        assert_eq!(cb.completion(), Ok(()));

        cb.status_command
            .update(|w| *w = (*w & !CB_STATUS_OK) | CB_STATUS_UNDERRUN);
        assert_eq!(cb.completion(), Err(TxError::Underrun));

        cb.clear();
        assert!(!cb.released());
    }

    #[test]
    fn test_receive_frame_encoding_and_decode() {
        let mut ring: DescriptorRing<E100ReceiveFrame> =
            DescriptorRing::new(Arc::new(SimPlatform::new()), 3, 16, false).unwrap();
        let base = ring.base() as u32;
        for slot in 0..3 {
            ring.fill(0x10_000 + slot as u64 * 0x800, 1536).unwrap();
        }

        // Only the newest descriptor parks the receive unit
        assert_eq!(ring.descriptor(0).status_command.read() & RFD_SUSPEND, 0);
        assert_eq!(ring.descriptor(1).status_command.read() & RFD_SUSPEND, 0);
        assert_ne!(ring.descriptor(2).status_command.read() & RFD_SUSPEND, 0);

        let rfd = ring.descriptor_mut(0);
        assert_eq!(rfd.rbd.read(), base + RBD_OFFSET);
        assert_eq!(rfd.rbd_buffer.read(), 0x10_000);
        assert_eq!(rfd.rbd_size.read(), 1536);

        rfd.rbd_count.write(RBD_END_OF_FRAME | 98);
        rfd.status_command
            .update(|w| *w |= RFD_STATUS_COMPLETE | RFD_STATUS_OK);
        assert!(rfd.released());
        assert_eq!(
            rfd.status(false),
            RxStatus {
                length: 98,
                status: FrameStatus::Ok,
                checksum: RxChecksum::empty(),
            }
        );

        rfd.status_command
            .write(RFD_STATUS_COMPLETE | RFD_STATUS_CRC_ERROR);
        assert_eq!(rfd.status(false).status, FrameStatus::CrcError);
    }

    #[test]
    fn test_reset_times_out_when_scb_stays_busy() {
        let regs = RegisterFile::with_model(|access, _| match access {
            Access::Read(SCB_COMMAND) => Some(COMMAND_UNIT_START as u32),
            _ => None,
        });
        let nic = E100::new(regs, MAC);
        let platform = SimPlatform::new();

        assert_eq!(
            nic.reset(&ctx(&platform)),
            Err(HardwareError::Timeout("software reset"))
        );
    }

    #[test]
    fn test_reset_masks_interrupts() {
        let nic = E100::new(Arc::new(RegisterFile::new()), MAC);
        let platform = SimPlatform::new();

        nic.reset(&ctx(&platform)).unwrap();

        assert_eq!(nic.regs.writes_to(PORT), vec![PORT_SOFTWARE_RESET]);
        assert_eq!(
            nic.regs.get(SCB_INTERRUPT_MASK),
            INTERRUPT_MASK_ALL as u32
        );
    }

    #[test]
    fn test_start_refuses_receive_area_above_4g() {
        let platform = SimPlatform::new();
        let nic = E100::new(Arc::new(RegisterFile::new()), MAC);
        let layout = RingLayout {
            tx_base: 0x1000,
            tx_count: 32,
            rx_base: 0x1_0000_2000,
            rx_count: 32,
            rx_buffer_size: 1536,
        };
        let settings = StartSettings {
            mac: MAC,
            rx_checksum: false,
            promiscuous: false,
        };

        assert_eq!(
            nic.start(&layout, &settings, &ctx(&platform)),
            Err(HardwareError::AddressOutOfRange("receive frame area"))
        );
        assert!(nic.regs.writes_to(SCB_COMMAND).is_empty());
        assert_eq!(platform.dma_regions(), 0);
    }

    #[test]
    fn test_start_programs_station_address() {
        let platform = Arc::new(SimPlatform::new());
        let dma = platform.clone();
        // Complete the IA setup block as soon as the CU is started on it
        let regs = RegisterFile::with_model(move |access, _| {
            match access {
                Access::Write(SCB_COMMAND, command) => {
                    if command == COMMAND_UNIT_START as u32 {
                        let block = dma.last_dma() as usize;
                        // SAFETY: SimPlatform DMA addresses are host pointers
                        unsafe {
                            let word = block as *mut u32;
                            word.write_volatile(
                                word.read_volatile() | CB_STATUS_COMPLETE | CB_STATUS_OK,
                            );
                        }
                    }
                    // Accepted at once
                    Some(0)
                }
                Access::Read(SCB_STATUS) => Some(STATUS_RECEIVE_UNIT_READY as u32),
                _ => None,
            }
        });
        let nic = E100::new(regs, MAC);
        let layout = RingLayout {
            tx_base: 0x1000,
            tx_count: 32,
            rx_base: 0x2000,
            rx_count: 32,
            rx_buffer_size: 1536,
        };
        let settings = StartSettings {
            mac: MAC,
            rx_checksum: false,
            promiscuous: false,
        };

        nic.start(&layout, &settings, &ctx(&platform)).unwrap();

        assert_eq!(platform.dma_regions(), 0);
        assert_eq!(nic.regs.get(SCB_POINTER), 0x2000);
        assert_eq!(nic.regs.get(SCB_INTERRUPT_MASK), 0);
    }

    #[test]
    fn test_cause_decode_and_acknowledge() {
        let nic = E100::new(Arc::new(RegisterFile::new()), MAC);
        nic.regs
            .set(SCB_STATUS, (STATUS_FRAME_RECEIVED | STATUS_COMMAND_NOT_ACTIVE | 0x10) as u32);

        let cause = nic.read_cause();
        assert_eq!(
            cause,
            (STATUS_FRAME_RECEIVED | STATUS_COMMAND_NOT_ACTIVE) as u32
        );
        assert_eq!(nic.decode_cause(cause), Events::RX_READY | Events::TX_DONE);
        assert_eq!(
            nic.decode_cause(STATUS_RECEIVE_NOT_READY as u32),
            Events::RX_READY | Events::RX_STALLED
        );

        nic.acknowledge(cause);
        assert_eq!(nic.regs.writes_to(SCB_ACK), vec![0x60]);
    }

    #[test]
    fn test_doorbell_starts_idle_unit_then_resumes() {
        let nic = E100::new(Arc::new(RegisterFile::new()), MAC);

        nic.ring_doorbell(0x4020);
        assert_eq!(nic.regs.get(SCB_POINTER), 0x4020);
        assert_eq!(
            nic.regs.writes_to(SCB_COMMAND),
            vec![COMMAND_UNIT_START as u32]
        );

        // Suspended
        nic.regs.set(SCB_STATUS, 1 << 6);
        nic.regs.set(SCB_COMMAND, 0);
        nic.ring_doorbell(0x4040);
        assert_eq!(
            nic.regs.writes_to(SCB_COMMAND),
            vec![COMMAND_UNIT_START as u32, COMMAND_UNIT_RESUME as u32]
        );
    }

    #[test]
    fn test_link_from_general_status() {
        let nic = E100::new(Arc::new(RegisterFile::new()), MAC);
        let platform = SimPlatform::new();

        assert_eq!(nic.sense_link(&ctx(&platform)), Ok(LinkState::Down));

        nic.regs.set(
            GENERAL_STATUS,
            (GENERAL_STATUS_LINK_UP | GENERAL_STATUS_100_MBPS | GENERAL_STATUS_FULL_DUPLEX) as u32,
        );
        assert_eq!(
            nic.sense_link(&ctx(&platform)),
            Ok(LinkState::Up {
                speed: LinkSpeed::Mbps100,
                duplex: Duplex::Full
            })
        );

        nic.regs.set(GENERAL_STATUS, GENERAL_STATUS_LINK_UP as u32);
        assert_eq!(
            nic.sense_link(&ctx(&platform)),
            Ok(LinkState::Up {
                speed: LinkSpeed::Mbps10,
                duplex: Duplex::Half
            })
        );
    }

    #[test]
    fn test_resume_only_suspended_receive_unit() {
        let nic = E100::new(Arc::new(RegisterFile::new()), MAC);

        nic.regs.set(SCB_STATUS, STATUS_RECEIVE_UNIT_READY as u32);
        assert!(!nic.receive_suspended());
        nic.resume_receive();
        assert!(nic.regs.writes_to(SCB_COMMAND).is_empty());

        nic.regs.set(SCB_STATUS, STATUS_RECEIVE_UNIT_SUSPENDED as u32);
        assert!(nic.receive_suspended());
        nic.resume_receive();
        assert_eq!(
            nic.regs.writes_to(SCB_COMMAND),
            vec![COMMAND_RECEIVE_RESUME as u32]
        );
    }
}
