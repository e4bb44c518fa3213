//! Ring engine
//!
//! [`Engine`] is the per-device context: one backend, three locks, one
//! pending-event word and the counters.
//!
//! ## Locks
//!
//! | Lock       | Guards                                  |
//! |------------|-----------------------------------------|
//! | `tx`       | transmit ring, packet slots, pending queue |
//! | `rx`       | receive ring and its buffers            |
//! | `settings` | link monitor, capability set, MAC       |
//!
//! Transmit and receive never contend. When nested, `tx`/`rx` come before
//! `settings`; the hot paths avoid nesting altogether by reading atomic
//! mirrors (`link_up`, `rx_checksum`) of configuration state.
//!
//! ## Contexts
//!
//! [`Engine::handle_interrupt`] and [`Engine::link_timer_tick`] only touch
//! atomics and the backend's cause register, so they are safe in interrupt
//! context. Everything else may spin on a lock and belongs in the worker or
//! the caller's thread.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};
use spin::Mutex;

use crate::config::{ConfigError, EngineConfig};
use crate::drivers::net::backend::{Backend, HwContext, RingLayout, StartSettings};
use crate::drivers::net::caps::{self, Capabilities, CapabilitySet};
use crate::drivers::net::events::{EventMask, Events, Raise};
use crate::drivers::net::link::LinkMonitor;
use crate::drivers::net::netdev::{
    InfoError, InformationKind, InterruptStatus, LinkState, MacAddress, NetCore, NetworkDevice,
    ResetError, SendError,
};
use crate::drivers::net::packet::{Packet, PacketAllocator};
use crate::drivers::net::platform::{dma_reachable, Platform};
use crate::drivers::net::ring::{DescriptorRing, SlotState};
use crate::drivers::net::rx::RxPipeline;
use crate::drivers::net::stats::{DropReporter, EngineStats, StatsSnapshot};
use crate::drivers::net::tx::TxPipeline;


/// Collaborators supplied by the embedding kernel
#[derive(Clone)]
pub struct Services {
    pub platform: Arc<dyn Platform>,
    pub allocator: Arc<dyn PacketAllocator>,
    pub net: Arc<dyn NetCore>,
}

/// State guarded by the configuration lock
struct DeviceSettings {
    link: LinkMonitor,
    caps: CapabilitySet,
    mac: MacAddress,
}

/// One network device
pub struct Engine<B: Backend> {
    backend: B,
    config: EngineConfig,
    services: Services,

    tx: Mutex<Option<TxPipeline<B::TxDescriptor>>>,
    rx: Mutex<Option<RxPipeline<B::RxDescriptor>>>,
    settings: Mutex<DeviceSettings>,

    events: EventMask,
    link_up: AtomicBool,
    rx_checksum: AtomicBool,

    stats: EngineStats,
    tx_drop_log: DropReporter,
    tx_error_log: DropReporter,
    rx_error_log: DropReporter,
    device_error_log: DropReporter,
}

impl<B: Backend> Engine<B> {
    /// Build a stopped engine; call [`reset`](Self::reset) to start it
    pub fn new(backend: B, config: EngineConfig, services: Services) -> Result<Self, ConfigError> {
        config.validate()?;

        if B::POWER_OF_TWO_RINGS {
            for (ring, size) in [("tx", config.tx_ring_size), ("rx", config.rx_ring_size)] {
                if !size.is_power_of_two() {
                    return Err(ConfigError::RingNotPowerOfTwo { ring, size });
                }
            }
        }

        if config.rx_buffer_size > B::MAX_RX_BUFFER_SIZE {
            return Err(ConfigError::RxBufferTooLarge {
                size: config.rx_buffer_size,
                max: B::MAX_RX_BUFFER_SIZE,
            });
        }

        let settings = DeviceSettings {
            link: LinkMonitor::new(),
            caps: CapabilitySet::new(backend.supported_capabilities()),
            mac: backend.read_mac_address(),
        };
        let interval = config.drop_log_interval_us;

        Ok(Self {
            backend,
            config,
            services,
            tx: Mutex::new(None),
            rx: Mutex::new(None),
            settings: Mutex::new(settings),
            events: EventMask::new(),
            link_up: AtomicBool::new(false),
            rx_checksum: AtomicBool::new(false),
            stats: EngineStats::new(),
            tx_drop_log: DropReporter::new(interval),
            tx_error_log: DropReporter::new(interval),
            rx_error_log: DropReporter::new(interval),
            device_error_log: DropReporter::new(interval),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Rings are allocated and the device is started
    pub fn is_running(&self) -> bool {
        self.tx.lock().is_some()
    }

    /// Queued plus in-flight transmit packets
    pub fn tx_backlog(&self) -> usize {
        self.tx.lock().as_ref().map_or(0, TxPipeline::backlog)
    }

    /// Ownership tag of every receive slot
    pub fn rx_slot_states(&self) -> Vec<SlotState> {
        self.rx.lock().as_ref().map_or_else(Vec::new, |rx| {
            let ring = rx.ring();
            (0..ring.capacity()).map(|slot| ring.state(slot)).collect()
        })
    }

    fn ctx(&self) -> HwContext<'_> {
        HwContext {
            platform: &*self.services.platform,
            reset_timeout_us: self.config.reset_timeout_us,
            mdio_timeout_us: self.config.mdio_timeout_us,
        }
    }

    fn now_us(&self) -> u64 {
        self.services.platform.now_us()
    }

    fn discard(&self, batch: Vec<Packet>) {
        for packet in batch {
            self.services.allocator.free(packet);
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Reset the hardware and bring the device up
    ///
    /// Any running state is torn down first, so on failure the device is
    /// left halted with no rings, no link and no link timer.
    pub fn reset(&self) -> Result<(), ResetError> {
        info!("[{}] reset", B::NAME);
        self.teardown();

        let ctx = self.ctx();
        self.backend.reset(&ctx).inspect_err(|e| {
            error!("[{}] reset failed: {}", B::NAME, e);
        })?;

        let platform = &self.services.platform;
        let allocator = &self.services.allocator;

        let tx_ring = DescriptorRing::new(
            platform.clone(),
            self.config.tx_ring_size,
            B::RING_ALIGN,
            B::SUSPEND_GAP,
        )
        .ok()
        .filter(|ring| dma_reachable(ring.base(), ring.bytes(), B::DMA_LIMIT))
        .ok_or(ResetError::NotReady("transmit descriptor ring"))?;
        let rx_ring = DescriptorRing::new(
            platform.clone(),
            self.config.rx_ring_size,
            B::RING_ALIGN,
            false,
        )
        .ok()
        .filter(|ring| dma_reachable(ring.base(), ring.bytes(), B::DMA_LIMIT))
        .ok_or(ResetError::NotReady("receive descriptor ring"))?;

        let layout = RingLayout {
            tx_base: tx_ring.base(),
            tx_count: tx_ring.capacity(),
            rx_base: rx_ring.base(),
            rx_count: rx_ring.capacity(),
            rx_buffer_size: self.config.rx_buffer_size,
        };

        let rx = RxPipeline::new(
            rx_ring,
            self.config.rx_buffer_size,
            B::DMA_LIMIT,
            allocator.clone(),
            platform.clone(),
        )
        .map_err(|_| ResetError::NotReady("receive buffers"))?;
        let tx = TxPipeline::new(
            tx_ring,
            self.config.tx_queue_cap(),
            self.config.drop_when_full,
            allocator.clone(),
            platform.clone(),
        )
        .with_interrupt_threshold(self.config.tx_interrupt_threshold());

        // MAC configuration writes from start, link mode changes and offload
        // toggles all happen under the settings lock
        let start = {
            let settings = self.settings.lock();
            let start = StartSettings {
                mac: settings.mac,
                rx_checksum: settings.caps.rx_checksum_enabled(),
                promiscuous: settings.caps.promiscuous(),
            };

            // The rings are dropped on the error paths below, so DMA has to
            // be stopped first
            if let Err(e) = self
                .backend
                .start(&layout, &start, &ctx)
                .and_then(|()| self.backend.probe_phy(&ctx))
            {
                self.backend.halt();
                error!("[{}] start failed: {}", B::NAME, e);
                return Err(e.into());
            }
            start
        };

        *self.rx.lock() = Some(rx);
        *self.tx.lock() = Some(tx);
        self.events.take();

        {
            let mut settings = self.settings.lock();
            settings.link.invalidate();
            self.link_up.store(false, Ordering::Release);
            self.rx_checksum
                .store(start.rx_checksum, Ordering::Release);
        }

        self.check_link();

        if self
            .services
            .platform
            .arm_link_timer(self.config.link_check_interval_us)
            .is_err()
        {
            self.teardown();
            return Err(ResetError::NotReady("link timer"));
        }

        info!(
            "[{}] up, MAC {}, {} tx / {} rx descriptors",
            B::NAME,
            start.mac,
            layout.tx_count,
            layout.rx_count
        );
        Ok(())
    }

    /// Halt DMA, cancel the link timer and release rings and buffers
    ///
    /// A link that was reported up is reported down.
    pub fn teardown(&self) {
        self.services.platform.cancel_link_timer();
        self.stop();
        self.events.take();

        let was_up = {
            let mut settings = self.settings.lock();
            let was_up = settings.link.state().is_up();
            settings.link.invalidate();
            self.link_up.store(false, Ordering::Release);
            was_up
        };
        if was_up {
            info!("[{}] link {}", B::NAME, LinkState::Down);
            self.services.net.link_state_changed(LinkState::Down);
        }
        debug!("[{}] torn down", B::NAME);
    }

    fn stop(&self) {
        {
            let _settings = self.settings.lock();
            self.backend.halt();
        }
        let tx = self.tx.lock().take();
        let rx = self.rx.lock().take();
        drop(tx);
        drop(rx);
    }

    // ========================================================================
    // Transmit
    // ========================================================================

    /// Queue a batch for transmission
    ///
    /// The batch is consumed whatever the outcome; packets that are not
    /// queued go straight back to the allocator.
    pub fn send(&self, batch: Vec<Packet>) -> Result<(), SendError> {
        let mut guard = self.tx.lock();

        if !self.link_up.load(Ordering::Acquire) {
            drop(guard);
            self.discard(batch);
            return Err(SendError::NoLink);
        }

        let Some(tx) = guard.as_mut() else {
            drop(guard);
            self.discard(batch);
            return Err(SendError::HardFailure);
        };

        if let Some(oversized) = batch.iter().find(|p| p.len() > B::MAX_FRAME_SIZE) {
            warn!(
                "[{}] frame of {} bytes exceeds {}",
                B::NAME,
                oversized.len(),
                B::MAX_FRAME_SIZE
            );
            drop(guard);
            self.discard(batch);
            return Err(SendError::HardFailure);
        }

        if let Some(unreachable) = batch
            .iter()
            .find(|p| !dma_reachable(p.data_physical(), p.len(), B::DMA_LIMIT))
        {
            warn!(
                "[{}] frame at {:#x} is beyond DMA limit {:#x}",
                B::NAME,
                unreachable.data_physical(),
                B::DMA_LIMIT
            );
            drop(guard);
            self.discard(batch);
            return Err(SendError::HardFailure);
        }

        if let Err(dropped) = tx.submit(batch) {
            drop(guard);
            self.stats.tx_dropped.fetch_add(dropped, Ordering::Relaxed);
            if let Some(total) = self.tx_drop_log.record(dropped, self.now_us()) {
                warn!("[{}] transmit backlog full, dropped {} packets", B::NAME, total);
            }
            return Err(SendError::Busy { dropped });
        }

        self.kick(tx);
        Ok(())
    }

    /// Drain the pending queue and ring the doorbell once
    fn kick(&self, tx: &mut TxPipeline<B::TxDescriptor>) {
        let drained = tx.drain();
        if let Some(first) = drained.first {
            self.backend.ring_doorbell(first);
            self.stats
                .tx_packets
                .fetch_add(drained.posted, Ordering::Relaxed);
            self.stats.tx_bytes.fetch_add(drained.bytes, Ordering::Relaxed);
        }
    }

    fn service_tx(&self) {
        let mut guard = self.tx.lock();
        let Some(tx) = guard.as_mut() else {
            return;
        };

        let reaped = tx.reap();
        if reaped.errors > 0 {
            self.stats
                .tx_errors
                .fetch_add(reaped.errors, Ordering::Relaxed);
            if let (Some(total), Some(last)) = (
                self.tx_error_log.record(reaped.errors, self.now_us()),
                reaped.last_error,
            ) {
                warn!("[{}] {} transmit errors (last: {})", B::NAME, total, last);
            }
        }

        self.kick(tx);
    }

    // ========================================================================
    // Receive
    // ========================================================================

    fn service_rx(&self, stalled: bool) {
        let checksum = self.rx_checksum.load(Ordering::Acquire);
        let mut guard = self.rx.lock();
        let Some(rx) = guard.as_mut() else {
            return;
        };

        let reaped = rx.reap(&*self.services.net, checksum);
        self.stats
            .rx_packets
            .fetch_add(reaped.delivered, Ordering::Relaxed);
        self.stats.rx_bytes.fetch_add(reaped.bytes, Ordering::Relaxed);

        if reaped.errors > 0 {
            self.stats
                .rx_errors
                .fetch_add(reaped.errors, Ordering::Relaxed);
            if let (Some(total), Some(last)) = (
                self.rx_error_log.record(reaped.errors, self.now_us()),
                reaped.last_error,
            ) {
                warn!("[{}] dropped {} received frames (last: {})", B::NAME, total, last);
            }
        }

        if stalled {
            self.stats.rx_stalls.fetch_add(1, Ordering::Relaxed);
        }
        if stalled || self.backend.receive_suspended() {
            self.backend.resume_receive();
        }
    }

    // ========================================================================
    // Interrupt and deferred work
    // ========================================================================

    /// Interrupt service routine
    pub fn handle_interrupt(&self) -> InterruptStatus {
        let cause = self.backend.read_cause();
        if cause == 0 {
            self.stats
                .spurious_interrupts
                .fetch_add(1, Ordering::Relaxed);
            return InterruptStatus::NotClaimed;
        }

        self.stats.interrupts.fetch_add(1, Ordering::Relaxed);
        let events = self.backend.decode_cause(cause);
        self.raise(events);
        self.backend.acknowledge(cause);
        InterruptStatus::Claimed
    }

    /// Link timer expiry
    pub fn link_timer_tick(&self) {
        self.raise(Events::LINK_CHECK);
    }

    fn raise(&self, events: Events) -> Raise {
        let result = self
            .events
            .raise(events, || self.services.platform.schedule_worker());
        if result == Raise::Failed {
            warn!("[{}] could not schedule worker for {:?}", B::NAME, events);
        }
        result
    }

    /// Deferred worker; returns the events it handled
    pub fn handle_deferred_work(&self) -> Events {
        let events = self.events.take();
        if events.is_empty() {
            return events;
        }
        self.stats.worker_runs.fetch_add(1, Ordering::Relaxed);

        if events.intersects(Events::RX_READY | Events::RX_STALLED) {
            self.service_rx(events.contains(Events::RX_STALLED));
        }

        if events.contains(Events::TX_DONE) {
            self.service_tx();
        }

        if events.contains(Events::LINK_CHECK) {
            self.check_link();
        }

        if events.contains(Events::ERROR) {
            if let Some(count) = self.device_error_log.record(1, self.now_us()) {
                error!("[{}] device reported {} error interrupts", B::NAME, count);
            }
        }

        events
    }

    // ========================================================================
    // Link
    // ========================================================================

    /// Sample the link now and publish any change
    ///
    /// Sensing and recording happen under one hold of the settings lock, so
    /// concurrent checks cannot publish samples out of order.
    pub fn check_link(&self) {
        if !self.is_running() {
            return;
        }

        let changed = {
            let mut settings = self.settings.lock();
            let sensed = match self.backend.sense_link(&self.ctx()) {
                Ok(state) => state,
                Err(e) => {
                    warn!("[{}] link check failed: {}", B::NAME, e);
                    return;
                }
            };
            let changed = settings.link.update(sensed);
            if let Some(state) = changed {
                if let LinkState::Up { speed, duplex } = state {
                    self.backend.set_link_mode(speed, duplex);
                }
                self.link_up.store(state.is_up(), Ordering::Release);
            }
            changed
        };

        if let Some(state) = changed {
            info!("[{}] link {}", B::NAME, state);
            self.services.net.link_state_changed(state);
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.settings.lock().link.state()
    }

    pub fn mac_address(&self) -> MacAddress {
        self.settings.lock().mac
    }

    // ========================================================================
    // Capabilities
    // ========================================================================

    pub fn supported_capabilities(&self) -> Capabilities {
        self.settings.lock().caps.supported()
    }

    pub fn enabled_capabilities(&self) -> Capabilities {
        self.settings.lock().caps.enabled()
    }

    /// Enabled checksum offloads
    pub fn checksum_offload(&self) -> Capabilities {
        self.settings.lock().caps.checksum()
    }

    /// Replace the enabled checksum offloads with `request`
    pub fn set_checksum_offload(&self, request: Capabilities) -> Result<(), InfoError> {
        let mut settings = self.settings.lock();
        let change = settings.caps.plan_checksum(request)?;

        if let Some(enable) = change.rx_switch {
            self.backend
                .set_rx_checksum(enable, &self.ctx())
                .map_err(InfoError::Device)?;
            debug!("[{}] receive checksum offload {}", B::NAME, enable);
        }

        settings.caps.commit_checksum(&change);
        self.rx_checksum
            .store(settings.caps.rx_checksum_enabled(), Ordering::Release);
        Ok(())
    }

    pub fn promiscuous(&self) -> bool {
        self.settings.lock().caps.promiscuous()
    }

    pub fn set_promiscuous(&self, enable: bool) -> Result<(), InfoError> {
        let mut settings = self.settings.lock();
        if let Some(enable) = settings.caps.plan_promiscuous(enable)? {
            self.backend
                .set_promiscuous(enable, &self.ctx())
                .map_err(InfoError::Device)?;
            settings.caps.commit_promiscuous(enable);
            info!("[{}] promiscuous mode {}", B::NAME, enable);
        }
        Ok(())
    }

    /// Byte-buffer access to device settings
    pub fn get_set_information(
        &self,
        kind: InformationKind,
        buffer: &mut [u8],
        is_set: bool,
    ) -> Result<usize, InfoError> {
        match (kind, is_set) {
            (InformationKind::ChecksumOffload, false) => {
                caps::write_word(buffer, self.checksum_offload().bits())
            }
            (InformationKind::ChecksumOffload, true) => {
                let word = caps::read_word(buffer)?;
                let request = Capabilities::from_bits(word).ok_or(InfoError::NotSupported)?;
                self.set_checksum_offload(request)?;
                Ok(caps::INFORMATION_SIZE)
            }
            (InformationKind::PromiscuousMode, false) => {
                caps::write_word(buffer, self.promiscuous() as u32)
            }
            (InformationKind::PromiscuousMode, true) => {
                let enable = caps::read_word(buffer)? != 0;
                self.set_promiscuous(enable)?;
                Ok(caps::INFORMATION_SIZE)
            }
        }
    }
}

impl<B: Backend> Drop for Engine<B> {
    fn drop(&mut self) {
        // Rings must not be freed under a running DMA engine
        self.services.platform.cancel_link_timer();
        self.backend.halt();
    }
}

impl<B: Backend> NetworkDevice for Engine<B> {
    fn send(&self, batch: Vec<Packet>) -> Result<(), SendError> {
        Engine::send(self, batch)
    }

    fn get_set_information(
        &self,
        kind: InformationKind,
        buffer: &mut [u8],
        is_set: bool,
    ) -> Result<usize, InfoError> {
        Engine::get_set_information(self, kind, buffer, is_set)
    }

    fn handle_interrupt(&self) -> InterruptStatus {
        Engine::handle_interrupt(self)
    }

    fn handle_deferred_work(&self) -> Events {
        Engine::handle_deferred_work(self)
    }

    fn reset(&self) -> Result<(), ResetError> {
        Engine::reset(self)
    }

    fn mac_address(&self) -> MacAddress {
        Engine::mac_address(self)
    }

    fn link_state(&self) -> LinkState {
        Engine::link_state(self)
    }

    fn max_frame_size(&self) -> usize {
        B::MAX_FRAME_SIZE
    }

    fn enabled_capabilities(&self) -> Capabilities {
        Engine::enabled_capabilities(self)
    }

    fn allocate_packet(&self, len: usize) -> Option<Packet> {
        self.services
            .allocator
            .allocate_below(0, len, 0, B::DMA_LIMIT)
    }
}
