//! Simulated NIC and platform
//!
//! Everything needed to run an [`Engine`](crate::Engine) without hardware:
//!
//! - [`SimPlatform`]: step clock, heap-backed "DMA" memory where the
//!   physical address is the virtual address (unless a device limit forces a
//!   remap into a low bus window), and counters for worker scheduling and
//!   the link timer
//! - [`SimNic`]: a [`Backend`] whose "hardware" side is driven by the test
//!   (or the host simulator) through `complete_tx` and `inject_rx`, walking
//!   the real descriptor rings the engine built
//! - [`HeapAllocator`], [`FailingAllocator`]: packet allocators that count
//!   outstanding buffers
//! - [`RecordingNetCore`]: keeps every delivered frame and link change
//! - [`RegisterFile`]: fake register window for backend register sequences

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;
use volatile::Volatile;

use crate::drivers::net::backend::{
    Backend, Descriptor, HwContext, RingLayout, RxDescriptor, StartSettings, TxDescriptor,
    TxRequest,
};
use crate::drivers::net::caps::Capabilities;
use crate::drivers::net::events::Events;
use crate::drivers::net::mmio::Registers;
use crate::drivers::net::netdev::{Duplex, HardwareError, LinkSpeed, LinkState, MacAddress, NetCore};
use crate::drivers::net::packet::{Packet, PacketAllocator, PacketFlags};
use crate::drivers::net::platform::{
    dma_reachable, DmaRegion, PhysicalAddress, Platform, ScheduleError,
};
use crate::drivers::net::rx::{FrameStatus, RxChecksum, RxStatus};
use crate::drivers::net::tx::TxError;
use crate::drivers::timer::{poll_until, Clock};

// ============================================================================
// Platform
// ============================================================================

/// Start of the low bus window for remapped regions
const LOW_WINDOW_BASE: PhysicalAddress = 0x1000_0000;

/// Bus address space given to each remapped region
const LOW_WINDOW_STRIDE: PhysicalAddress = 0x1_0000;

/// Host stand-in for kernel services
#[derive(Default)]
pub struct SimPlatform {
    now_us: AtomicU64,
    worker_pending: AtomicBool,
    schedules: AtomicUsize,
    fail_schedule: AtomicBool,
    timer_period_us: AtomicU64,
    fail_timer: AtomicBool,
    fail_dma: AtomicBool,
    dma_regions: AtomicUsize,
    last_dma: AtomicU64,
    last_bus: AtomicU64,
    remapped: AtomicU64,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful `schedule_worker` calls so far
    pub fn schedules(&self) -> usize {
        self.schedules.load(Ordering::Acquire)
    }

    /// Consume a pending worker request
    pub fn take_worker_request(&self) -> bool {
        self.worker_pending.swap(false, Ordering::AcqRel)
    }

    pub fn set_fail_schedule(&self, fail: bool) {
        self.fail_schedule.store(fail, Ordering::Release);
    }

    pub fn set_fail_timer(&self, fail: bool) {
        self.fail_timer.store(fail, Ordering::Release);
    }

    pub fn set_fail_dma(&self, fail: bool) {
        self.fail_dma.store(fail, Ordering::Release);
    }

    /// Armed link timer period, or zero if cancelled
    pub fn timer_period_us(&self) -> u64 {
        self.timer_period_us.load(Ordering::Acquire)
    }

    /// DMA regions currently allocated
    pub fn dma_regions(&self) -> usize {
        self.dma_regions.load(Ordering::Acquire)
    }

    /// Host address of the most recent DMA allocation
    ///
    /// Register models use this to find the block a driver pointed at, since
    /// the bus address a 32-bit chip sees may be a remapped one.
    pub fn last_dma(&self) -> PhysicalAddress {
        self.last_dma.load(Ordering::Acquire)
    }

    /// Bus address of the most recent DMA allocation
    pub fn last_bus(&self) -> PhysicalAddress {
        self.last_bus.load(Ordering::Acquire)
    }

    pub fn advance(&self, microseconds: u64) {
        self.now_us.fetch_add(microseconds, Ordering::AcqRel);
    }
}

impl Clock for SimPlatform {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::Acquire)
    }

    fn delay_us(&self, microseconds: u64) {
        self.advance(microseconds);
    }
}

impl Platform for SimPlatform {
    fn schedule_worker(&self) -> Result<(), ScheduleError> {
        if self.fail_schedule.load(Ordering::Acquire) {
            return Err(ScheduleError);
        }
        self.worker_pending.store(true, Ordering::Release);
        self.schedules.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn arm_link_timer(&self, period_us: u64) -> Result<(), ScheduleError> {
        if self.fail_timer.load(Ordering::Acquire) {
            return Err(ScheduleError);
        }
        self.timer_period_us.store(period_us, Ordering::Release);
        Ok(())
    }

    fn cancel_link_timer(&self) {
        self.timer_period_us.store(0, Ordering::Release);
    }

    fn dma_allocate(&self, size: usize, align: usize) -> Option<DmaRegion> {
        if self.fail_dma.load(Ordering::Acquire) || size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, align).ok()?;
        // SAFETY: layout has non-zero size
        let virt = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })?;
        self.dma_regions.fetch_add(1, Ordering::AcqRel);
        let physical = virt.as_ptr() as PhysicalAddress;
        self.last_dma.store(physical, Ordering::Release);
        self.last_bus.store(physical, Ordering::Release);
        // SAFETY: freshly allocated, exclusively owned; physical == virtual
        Some(unsafe { DmaRegion::new(virt, physical, size, align) })
    }

    /// Host memory out of reach is remapped into a low bus window, the way an
    /// IOMMU would present it. Only register models see those addresses;
    /// [`SimNic`] dereferences bus addresses and never asks for a limit.
    fn dma_allocate_below(
        &self,
        size: usize,
        align: usize,
        limit: PhysicalAddress,
    ) -> Option<DmaRegion> {
        let region = self.dma_allocate(size, align)?;
        if dma_reachable(region.physical(), region.len(), limit) {
            return Some(region);
        }

        let slot = self.remapped.fetch_add(1, Ordering::AcqRel);
        let bus = LOW_WINDOW_BASE + slot * LOW_WINDOW_STRIDE;
        let fits = region.len() as PhysicalAddress <= LOW_WINDOW_STRIDE
            && dma_reachable(bus, region.len(), limit);
        let Some(virt) = NonNull::new(region.as_ptr()).filter(|_| fits) else {
            self.dma_free(region);
            return None;
        };

        self.last_bus.store(bus, Ordering::Release);
        // SAFETY: same memory, now reached through a different bus address
        Some(unsafe { DmaRegion::new(virt, bus, region.len(), region.align()) })
    }

    fn dma_free(&self, region: DmaRegion) {
        if let Ok(layout) = Layout::from_size_align(region.len(), region.align()) {
            // SAFETY: region came from dma_allocate with this layout
            unsafe { alloc::alloc::dealloc(region.as_ptr(), layout) };
            self.dma_regions.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

// ============================================================================
// Packet allocators
// ============================================================================

const PACKET_ALIGN: usize = 64;

/// Heap-backed packets, physical == virtual
#[derive(Default)]
pub struct HeapAllocator {
    outstanding: AtomicUsize,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets allocated and not yet freed
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl PacketAllocator for HeapAllocator {
    fn allocate(&self, headroom: usize, size: usize, footer: usize) -> Option<Packet> {
        let capacity = (headroom + size + footer).max(1);
        let layout = Layout::from_size_align(capacity, PACKET_ALIGN).ok()?;
        // SAFETY: non-zero size
        let buffer = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })?;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        // SAFETY: buffer is valid for `capacity` bytes until `free`
        Some(unsafe {
            Packet::from_raw_parts(
                buffer,
                buffer.as_ptr() as PhysicalAddress,
                capacity,
                headroom,
                headroom + size,
            )
        })
    }

    fn free(&self, packet: Packet) {
        if let Ok(layout) = Layout::from_size_align(packet.capacity(), PACKET_ALIGN) {
            // SAFETY: allocated above with the same layout
            unsafe { alloc::alloc::dealloc(packet.buffer().as_ptr(), layout) };
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Allocator that runs dry after a fixed number of packets
pub struct FailingAllocator {
    inner: HeapAllocator,
    remaining: AtomicUsize,
}

impl FailingAllocator {
    pub fn after(count: usize) -> Self {
        Self {
            inner: HeapAllocator::new(),
            remaining: AtomicUsize::new(count),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding()
    }
}

impl PacketAllocator for FailingAllocator {
    fn allocate(&self, headroom: usize, size: usize, footer: usize) -> Option<Packet> {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()?;
        self.inner.allocate(headroom, size, footer)
    }

    fn free(&self, packet: Packet) {
        self.inner.free(packet)
    }
}

// ============================================================================
// Network core
// ============================================================================

/// Records every upcall
#[derive(Default)]
pub struct RecordingNetCore {
    frames: Mutex<Vec<Vec<u8>>>,
    checksums: Mutex<Vec<RxChecksum>>,
    links: Mutex<Vec<LinkState>>,
}

impl RecordingNetCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }

    pub fn checksums(&self) -> Vec<RxChecksum> {
        self.checksums.lock().clone()
    }

    pub fn link_changes(&self) -> Vec<LinkState> {
        self.links.lock().clone()
    }
}

impl NetCore for RecordingNetCore {
    fn deliver(&self, frame: &[u8], checksum: RxChecksum) {
        self.frames.lock().push(frame.to_vec());
        self.checksums.lock().push(checksum);
    }

    fn link_state_changed(&self, state: LinkState) {
        self.links.lock().push(state);
    }
}

// ============================================================================
// Descriptors
// ============================================================================

const DESC_OWN: u32 = 1 << 31;
const DESC_INT: u32 = 1 << 30;
const DESC_END: u32 = 1 << 29;

/// Transmit descriptor of the simulated NIC
#[repr(C)]
pub struct SimTxDescriptor {
    control: Volatile<u32>,
    status: Volatile<u32>,
    buffer: Volatile<u64>,
    length: Volatile<u32>,
    flags: Volatile<u32>,
    next: Volatile<u64>,
}

impl SimTxDescriptor {
    pub const STATUS_UNDERRUN: u32 = 1 << 0;
    pub const STATUS_CARRIER: u32 = 1 << 1;
    pub const STATUS_OTHER: u32 = 1 << 7;

    pub fn device_owned(&self) -> bool {
        self.control.read() & DESC_OWN != 0
    }

    pub fn interrupt_requested(&self) -> bool {
        self.control.read() & DESC_INT != 0
    }

    pub fn buffer(&self) -> PhysicalAddress {
        self.buffer.read()
    }

    pub fn length(&self) -> usize {
        self.length.read() as usize
    }

    pub fn flags(&self) -> PacketFlags {
        PacketFlags::from_bits_truncate(self.flags.read())
    }

    pub fn next_link(&self) -> PhysicalAddress {
        self.next.read()
    }

    pub fn is_last(&self) -> bool {
        self.control.read() & DESC_END != 0
    }

    /// Device side: write status and release ownership
    pub fn device_complete(&mut self, status: u32) {
        self.status.write(status);
        fence(Ordering::Release);
        self.control.update(|c| *c &= !DESC_OWN);
    }
}

impl Descriptor for SimTxDescriptor {
    fn link(&mut self, _own: PhysicalAddress, next: PhysicalAddress, last: bool) {
        self.next.write(next);
        self.control.write(if last { DESC_END } else { 0 });
    }

    fn released(&self) -> bool {
        !self.device_owned()
    }
}

impl TxDescriptor for SimTxDescriptor {
    fn prepare(&mut self, request: &TxRequest) {
        self.buffer.write(request.buffer);
        self.length.write(request.length as u32);
        self.flags.write(request.flags.bits());
        self.status.write(0);
        let mut control = self.control.read() & DESC_END;
        if request.interrupt {
            control |= DESC_INT;
        }
        self.control.write(control);
    }

    fn give_to_device(&mut self) {
        self.control.update(|c| *c |= DESC_OWN);
    }

    fn completion(&self) -> Result<(), TxError> {
        match self.status.read() {
            0 => Ok(()),
            s if s & Self::STATUS_UNDERRUN != 0 => Err(TxError::Underrun),
            s if s & Self::STATUS_CARRIER != 0 => Err(TxError::CarrierLost),
            _ => Err(TxError::Other),
        }
    }

    fn clear(&mut self) {
        self.control.update(|c| *c &= DESC_END);
        self.status.write(0);
        self.buffer.write(0);
        self.length.write(0);
    }
}

/// Receive descriptor of the simulated NIC
#[repr(C)]
pub struct SimRxDescriptor {
    control: Volatile<u32>,
    status: Volatile<u32>,
    buffer: Volatile<u64>,
    capacity: Volatile<u32>,
    length: Volatile<u32>,
    next: Volatile<u64>,
}

impl SimRxDescriptor {
    pub const STATUS_CRC: u32 = 1 << 0;
    pub const STATUS_LENGTH: u32 = 1 << 1;
    pub const STATUS_CSUM_OK: u32 = 1 << 2;
    pub const STATUS_CSUM_BAD: u32 = 1 << 3;

    pub fn device_owned(&self) -> bool {
        self.control.read() & DESC_OWN != 0
    }

    pub fn buffer(&self) -> PhysicalAddress {
        self.buffer.read()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.read() as usize
    }

    /// Device side: report a received frame and release ownership
    pub fn device_receive(&mut self, length: usize, status: u32) {
        self.length.write(length as u32);
        self.status.write(status);
        fence(Ordering::Release);
        self.control.update(|c| *c &= !DESC_OWN);
    }
}

impl Descriptor for SimRxDescriptor {
    fn link(&mut self, _own: PhysicalAddress, next: PhysicalAddress, last: bool) {
        self.next.write(next);
        self.control.write(if last { DESC_END } else { 0 });
    }

    fn released(&self) -> bool {
        !self.device_owned()
    }
}

impl RxDescriptor for SimRxDescriptor {
    fn prepare(&mut self, buffer: PhysicalAddress, capacity: usize) {
        self.buffer.write(buffer);
        self.capacity.write(capacity as u32);
        self.length.write(0);
        self.status.write(0);
    }

    fn give_to_device(&mut self) {
        self.control.update(|c| *c |= DESC_OWN);
    }

    fn status(&self, checksum_offload: bool) -> RxStatus {
        let bits = self.status.read();
        let status = if bits & Self::STATUS_CRC != 0 {
            FrameStatus::CrcError
        } else if bits & Self::STATUS_LENGTH != 0 {
            FrameStatus::LengthError
        } else {
            FrameStatus::Ok
        };

        let checksum = if !checksum_offload {
            RxChecksum::empty()
        } else if bits & Self::STATUS_CSUM_BAD != 0 {
            RxChecksum::IP_OK | RxChecksum::TCP_FAILED
        } else if bits & Self::STATUS_CSUM_OK != 0 {
            RxChecksum::IP_OK | RxChecksum::TCP_OK
        } else {
            RxChecksum::empty()
        };

        RxStatus {
            length: self.length.read() as usize,
            status,
            checksum,
        }
    }
}

// ============================================================================
// Simulated NIC
// ============================================================================

/// Cause register bits of the simulated NIC
pub const CAUSE_RX: u32 = 1 << 0;
pub const CAUSE_TX: u32 = 1 << 1;
pub const CAUSE_RX_STALL: u32 = 1 << 2;
pub const CAUSE_LINK: u32 = 1 << 3;
pub const CAUSE_ERROR: u32 = 1 << 4;

/// A NIC whose device side is driven by the caller
pub struct SimNic {
    mac: MacAddress,
    supported: Capabilities,
    cause: AtomicU32,
    layout: Mutex<Option<RingLayout>>,
    tx_cursor: AtomicUsize,
    rx_cursor: AtomicUsize,
    link: Mutex<LinkState>,
    running: AtomicBool,
    reset_hangs: AtomicBool,
    phy_missing: AtomicBool,
    fail_offload_writes: AtomicBool,
    rx_checksum: AtomicBool,
    promiscuous: AtomicBool,
    register_writes: AtomicUsize,
    doorbells: AtomicUsize,
    last_doorbell: AtomicU64,
    rx_suspended: AtomicBool,
    hold_sense: AtomicBool,
    sensing: AtomicBool,
    rx_resumes: AtomicUsize,
    link_modes: AtomicUsize,
}

impl SimNic {
    pub fn new(mac: MacAddress, supported: Capabilities) -> Self {
        Self {
            mac,
            supported,
            cause: AtomicU32::new(0),
            layout: Mutex::new(None),
            tx_cursor: AtomicUsize::new(0),
            rx_cursor: AtomicUsize::new(0),
            link: Mutex::new(LinkState::Down),
            running: AtomicBool::new(false),
            reset_hangs: AtomicBool::new(false),
            phy_missing: AtomicBool::new(false),
            fail_offload_writes: AtomicBool::new(false),
            rx_checksum: AtomicBool::new(false),
            promiscuous: AtomicBool::new(false),
            register_writes: AtomicUsize::new(0),
            doorbells: AtomicUsize::new(0),
            last_doorbell: AtomicU64::new(0),
            rx_suspended: AtomicBool::new(false),
            hold_sense: AtomicBool::new(false),
            sensing: AtomicBool::new(false),
            rx_resumes: AtomicUsize::new(0),
            link_modes: AtomicUsize::new(0),
        }
    }

    pub fn set_link(&self, state: LinkState) {
        *self.link.lock() = state;
    }

    pub fn set_reset_hangs(&self, hangs: bool) {
        self.reset_hangs.store(hangs, Ordering::Release);
    }

    pub fn set_phy_missing(&self, missing: bool) {
        self.phy_missing.store(missing, Ordering::Release);
    }

    /// Park `sense_link` before it reads the link until released
    pub fn set_hold_sense(&self, hold: bool) {
        self.hold_sense.store(hold, Ordering::Release);
    }

    /// A `sense_link` call is in progress
    pub fn sensing(&self) -> bool {
        self.sensing.load(Ordering::Acquire)
    }

    pub fn set_fail_offload_writes(&self, fail: bool) {
        self.fail_offload_writes.store(fail, Ordering::Release);
    }

    /// Raise cause bits as the device would
    pub fn raise(&self, cause: u32) {
        self.cause.fetch_or(cause, Ordering::AcqRel);
    }

    pub fn pending_cause(&self) -> u32 {
        self.cause.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn rx_checksum(&self) -> bool {
        self.rx_checksum.load(Ordering::Acquire)
    }

    pub fn promiscuous(&self) -> bool {
        self.promiscuous.load(Ordering::Acquire)
    }

    /// Offload and filter register writes so far
    pub fn register_writes(&self) -> usize {
        self.register_writes.load(Ordering::Acquire)
    }

    pub fn doorbells(&self) -> usize {
        self.doorbells.load(Ordering::Acquire)
    }

    pub fn last_doorbell(&self) -> PhysicalAddress {
        self.last_doorbell.load(Ordering::Acquire)
    }

    pub fn rx_resumes(&self) -> usize {
        self.rx_resumes.load(Ordering::Acquire)
    }

    pub fn link_mode_changes(&self) -> usize {
        self.link_modes.load(Ordering::Acquire)
    }

    fn tx_descriptor(&self, layout: &RingLayout, slot: usize) -> *mut SimTxDescriptor {
        (layout.tx_base as usize + slot * size_of::<SimTxDescriptor>()) as *mut SimTxDescriptor
    }

    fn rx_descriptor(&self, layout: &RingLayout, slot: usize) -> *mut SimRxDescriptor {
        (layout.rx_base as usize + slot * size_of::<SimRxDescriptor>()) as *mut SimRxDescriptor
    }

    /// Complete up to `count` transmit descriptors in ring order
    ///
    /// Returns the number completed and raises the transmit cause if any.
    pub fn complete_tx(&self, count: usize, status: u32) -> usize {
        self.complete_tx_with(count, status, |_| {})
    }

    /// Complete up to `count` frames successfully, returning each frame's
    /// bytes and the offload flags it was posted with
    pub fn transmit(&self, count: usize) -> Vec<(Vec<u8>, PacketFlags)> {
        let mut frames = Vec::new();
        self.complete_tx_with(count, 0, |descriptor| {
            // SAFETY: the buffer is device-owned and holds `length` bytes
            let bytes = unsafe {
                core::slice::from_raw_parts(
                    descriptor.buffer() as *const u8,
                    descriptor.length(),
                )
            };
            frames.push((bytes.to_vec(), descriptor.flags()));
        });
        frames
    }

    fn complete_tx_with(
        &self,
        count: usize,
        status: u32,
        mut observe: impl FnMut(&SimTxDescriptor),
    ) -> usize {
        let Some(layout) = *self.layout.lock() else {
            return 0;
        };

        let mut completed = 0;
        while completed < count {
            let slot = self.tx_cursor.load(Ordering::Acquire);
            // SAFETY: the engine keeps the ring alive while the NIC runs;
            // under SimPlatform physical addresses are virtual addresses
            let descriptor = unsafe { &mut *self.tx_descriptor(&layout, slot) };
            if !descriptor.device_owned() {
                break;
            }
            observe(descriptor);
            descriptor.device_complete(status);
            self.tx_cursor
                .store((slot + 1) % layout.tx_count, Ordering::Release);
            completed += 1;
        }

        if completed > 0 {
            self.raise(CAUSE_TX);
        }
        completed
    }

    /// Receive one frame into the next device-owned descriptor
    ///
    /// Returns `false` and raises the stall cause if no descriptor is free.
    pub fn inject_rx(&self, frame: &[u8], status: u32) -> bool {
        let Some(layout) = *self.layout.lock() else {
            return false;
        };

        let slot = self.rx_cursor.load(Ordering::Acquire);
        // SAFETY: as in complete_tx
        let descriptor = unsafe { &mut *self.rx_descriptor(&layout, slot) };
        if !descriptor.device_owned() {
            self.rx_suspended.store(true, Ordering::Release);
            self.raise(CAUSE_RX_STALL);
            return false;
        }

        let length = frame.len().min(descriptor.capacity());
        // SAFETY: the buffer holds `capacity` bytes and is device-owned
        unsafe {
            core::ptr::copy_nonoverlapping(frame.as_ptr(), descriptor.buffer() as *mut u8, length);
        }
        let mut status = status;
        if self.rx_checksum() && status == 0 {
            status = SimRxDescriptor::STATUS_CSUM_OK;
        }
        descriptor.device_receive(frame.len(), status);
        self.rx_cursor
            .store((slot + 1) % layout.rx_count, Ordering::Release);
        self.raise(CAUSE_RX);
        true
    }

    fn offload_write(&self, flag: &AtomicBool, enable: bool) -> Result<(), HardwareError> {
        if self.fail_offload_writes.load(Ordering::Acquire) {
            return Err(HardwareError::Timeout("offload register"));
        }
        flag.store(enable, Ordering::Release);
        self.register_writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl Backend for SimNic {
    type TxDescriptor = SimTxDescriptor;
    type RxDescriptor = SimRxDescriptor;

    const NAME: &'static str = "sim";

    fn supported_capabilities(&self) -> Capabilities {
        self.supported
    }

    fn read_mac_address(&self) -> MacAddress {
        self.mac
    }

    fn reset(&self, ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        self.running.store(false, Ordering::Release);
        let hangs = self.reset_hangs.load(Ordering::Acquire);
        poll_until(ctx.platform, ctx.reset_timeout_us, 10, || !hangs)
            .map_err(|_| HardwareError::Timeout("software reset"))
    }

    fn start(
        &self,
        rings: &RingLayout,
        settings: &StartSettings,
        _ctx: &HwContext<'_>,
    ) -> Result<(), HardwareError> {
        *self.layout.lock() = Some(*rings);
        self.tx_cursor.store(0, Ordering::Release);
        self.rx_cursor.store(0, Ordering::Release);
        self.cause.store(0, Ordering::Release);
        self.rx_suspended.store(false, Ordering::Release);
        self.rx_checksum
            .store(settings.rx_checksum, Ordering::Release);
        self.promiscuous
            .store(settings.promiscuous, Ordering::Release);
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn halt(&self) {
        self.running.store(false, Ordering::Release);
        *self.layout.lock() = None;
    }

    fn probe_phy(&self, _ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        if self.phy_missing.load(Ordering::Acquire) {
            Err(HardwareError::PhyNotFound)
        } else {
            Ok(())
        }
    }

    fn sense_link(&self, _ctx: &HwContext<'_>) -> Result<LinkState, HardwareError> {
        self.sensing.store(true, Ordering::Release);
        while self.hold_sense.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        let state = *self.link.lock();
        self.sensing.store(false, Ordering::Release);
        Ok(state)
    }

    fn set_link_mode(&self, _speed: LinkSpeed, _duplex: Duplex) {
        self.link_modes.fetch_add(1, Ordering::AcqRel);
    }

    fn read_cause(&self) -> u32 {
        self.cause.load(Ordering::Acquire)
    }

    fn decode_cause(&self, cause: u32) -> Events {
        let mut events = Events::empty();
        if cause & CAUSE_RX != 0 {
            events |= Events::RX_READY;
        }
        if cause & CAUSE_RX_STALL != 0 {
            events |= Events::RX_STALLED | Events::RX_READY;
        }
        if cause & CAUSE_TX != 0 {
            events |= Events::TX_DONE;
        }
        if cause & CAUSE_LINK != 0 {
            events |= Events::LINK_CHECK;
        }
        if cause & CAUSE_ERROR != 0 {
            events |= Events::ERROR;
        }
        events
    }

    fn acknowledge(&self, cause: u32) {
        self.cause.fetch_and(!cause, Ordering::AcqRel);
    }

    fn ring_doorbell(&self, first_posted: PhysicalAddress) {
        self.last_doorbell.store(first_posted, Ordering::Release);
        self.doorbells.fetch_add(1, Ordering::AcqRel);
    }

    fn resume_receive(&self) {
        self.rx_suspended.store(false, Ordering::Release);
        self.rx_resumes.fetch_add(1, Ordering::AcqRel);
    }

    fn receive_suspended(&self) -> bool {
        self.rx_suspended.load(Ordering::Acquire)
    }

    fn set_rx_checksum(&self, enable: bool, _ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        self.offload_write(&self.rx_checksum, enable)
    }

    fn set_promiscuous(&self, enable: bool, _ctx: &HwContext<'_>) -> Result<(), HardwareError> {
        self.offload_write(&self.promiscuous, enable)
    }
}

// ============================================================================
// Register file
// ============================================================================

/// One register access, as seen by a [`RegisterFile`] model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read(usize),
    Write(usize, u32),
}

type Model = Box<dyn FnMut(Access, &mut BTreeMap<usize, u32>) -> Option<u32> + Send>;

/// Fake register window
///
/// Registers are plain storage keyed by offset. An optional model sees every
/// access first: for a read, returning `Some` overrides the stored value; for
/// a write, returning `Some` means the model handled it and nothing is
/// stored. Every write is logged.
pub struct RegisterFile {
    registers: Mutex<BTreeMap<usize, u32>>,
    writes: Mutex<Vec<(usize, u32)>>,
    model: Mutex<Option<Model>>,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            registers: Mutex::new(BTreeMap::new()),
            writes: Mutex::new(Vec::new()),
            model: Mutex::new(None),
        }
    }

    pub fn with_model(
        model: impl FnMut(Access, &mut BTreeMap<usize, u32>) -> Option<u32> + Send + 'static,
    ) -> Self {
        let file = Self::new();
        *file.model.lock() = Some(Box::new(model));
        file
    }

    pub fn get(&self, offset: usize) -> u32 {
        self.registers.lock().get(&offset).copied().unwrap_or(0)
    }

    pub fn set(&self, offset: usize, value: u32) {
        self.registers.lock().insert(offset, value);
    }

    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.writes.lock().clone()
    }

    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.writes
            .lock()
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    fn access_read(&self, offset: usize) -> u32 {
        let mut registers = self.registers.lock();
        if let Some(model) = self.model.lock().as_mut() {
            if let Some(value) = model(Access::Read(offset), &mut registers) {
                return value;
            }
        }
        registers.get(&offset).copied().unwrap_or(0)
    }

    fn access_write(&self, offset: usize, value: u32) {
        self.writes.lock().push((offset, value));
        let mut registers = self.registers.lock();
        if let Some(model) = self.model.lock().as_mut() {
            if model(Access::Write(offset, value), &mut registers).is_some() {
                return;
            }
        }
        registers.insert(offset, value);
    }
}

impl Registers for RegisterFile {
    fn read8(&self, offset: usize) -> u8 {
        self.access_read(offset) as u8
    }

    fn read16(&self, offset: usize) -> u16 {
        self.access_read(offset) as u16
    }

    fn read32(&self, offset: usize) -> u32 {
        self.access_read(offset)
    }

    fn write8(&self, offset: usize, value: u8) {
        self.access_write(offset, value as u32)
    }

    fn write16(&self, offset: usize, value: u16) {
        self.access_write(offset, value as u32)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.access_write(offset, value)
    }
}
