//! smoltcp adapter
//!
//! [`EngineDevice`] exposes an [`Engine`] to smoltcp as a `phy::Device`.
//! Received frames arrive through a [`FrameQueue`] the engine was built
//! with as its [`NetCore`](crate::NetCore); transmitted frames are written
//! straight into an allocator packet and posted as a batch of one.
//!
//! Checksum offload shows up in two places. On receive, frames the
//! hardware marked as failing a checksum are dropped before smoltcp sees
//! them. On transmit, the enabled transmit offloads are reported to smoltcp
//! as "do not compute" and every outgoing IPv4 frame is tagged with the
//! matching [`PacketFlags`].

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, trace};
use smoltcp::phy::{self, Checksum, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use smoltcp::wire::{EthernetFrame, EthernetProtocol, IpProtocol, Ipv4Packet};

use crate::drivers::net::backend::Backend;
use crate::drivers::net::caps::Capabilities;
use crate::drivers::net::engine::Engine;
use crate::drivers::net::netdev::NetworkDevice;
use crate::drivers::net::packet::PacketFlags;
use crate::drivers::net::rx::RxChecksum;
use crate::net::queue::{FrameQueue, RxFrame};

const CHECKSUM_FAILED: RxChecksum = RxChecksum::IP_FAILED
    .union(RxChecksum::TCP_FAILED)
    .union(RxChecksum::UDP_FAILED);

/// smoltcp view of an engine
pub struct EngineDevice<B: Backend> {
    engine: Arc<Engine<B>>,
    queue: Arc<FrameQueue>,
    checksum_drops: u64,
}

impl<B: Backend> EngineDevice<B> {
    /// `queue` must be the `NetCore` the engine delivers into
    pub fn new(engine: Arc<Engine<B>>, queue: Arc<FrameQueue>) -> Self {
        Self {
            engine,
            queue,
            checksum_drops: 0,
        }
    }

    pub fn engine(&self) -> &Arc<Engine<B>> {
        &self.engine
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    /// Frames dropped because the hardware reported a bad checksum
    pub fn checksum_drops(&self) -> u64 {
        self.checksum_drops
    }

    fn next_frame(&mut self) -> Option<RxFrame> {
        while let Some(frame) = self.queue.dequeue() {
            if frame.checksum.intersects(CHECKSUM_FAILED) {
                self.checksum_drops += 1;
                trace!(
                    "[{}] dropping frame with bad checksum ({:?})",
                    B::NAME,
                    frame.checksum
                );
                continue;
            }
            return Some(frame);
        }
        None
    }
}

impl<B: Backend> phy::Device for EngineDevice<B> {
    type RxToken<'a>
        = EngineRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = EngineTxToken<'a, B>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.next_frame()?;
        Some((
            EngineRxToken { data: frame.data },
            EngineTxToken {
                engine: &self.engine,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        if !self.engine.link_state().is_up() {
            return None;
        }
        Some(EngineTxToken {
            engine: &self.engine,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let offload = TxOffload::new(self.engine.enabled_capabilities());

        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = B::MAX_FRAME_SIZE;
        caps.max_burst_size = Some(self.engine.config().tx_ring_size);
        caps.checksum.ipv4 = checksum_mode(offload.ip);
        caps.checksum.tcp = checksum_mode(offload.tcp);
        caps.checksum.udp = checksum_mode(offload.udp);
        caps
    }
}

fn checksum_mode(offloaded: bool) -> Checksum {
    if offloaded { Checksum::Rx } else { Checksum::Both }
}

/// Transmit insertions the device will do, given the enabled set
///
/// Protocol checksums are only offered together with the IP header
/// checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TxOffload {
    ip: bool,
    tcp: bool,
    udp: bool,
}

impl TxOffload {
    fn new(enabled: Capabilities) -> Self {
        let ip = enabled.contains(Capabilities::TX_IP_CHECKSUM);
        Self {
            ip,
            tcp: ip && enabled.contains(Capabilities::TX_TCP_CHECKSUM),
            udp: ip && enabled.contains(Capabilities::TX_UDP_CHECKSUM),
        }
    }

    /// Per-packet flags for an outgoing Ethernet frame
    fn flags_for(&self, frame: &[u8]) -> PacketFlags {
        if !self.ip {
            return PacketFlags::empty();
        }
        let Ok(ethernet) = EthernetFrame::new_checked(frame) else {
            return PacketFlags::empty();
        };
        if ethernet.ethertype() != EthernetProtocol::Ipv4 {
            return PacketFlags::empty();
        }
        let Ok(ipv4) = Ipv4Packet::new_checked(ethernet.payload()) else {
            return PacketFlags::empty();
        };

        let mut flags = PacketFlags::IP_CHECKSUM_OFFLOAD;
        match ipv4.next_header() {
            IpProtocol::Tcp if self.tcp => flags |= PacketFlags::TCP_CHECKSUM_OFFLOAD,
            IpProtocol::Udp if self.udp => flags |= PacketFlags::UDP_CHECKSUM_OFFLOAD,
            _ => {}
        }
        flags
    }
}

pub struct EngineRxToken {
    data: Vec<u8>,
}

impl phy::RxToken for EngineRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.data)
    }
}

pub struct EngineTxToken<'a, B: Backend> {
    engine: &'a Engine<B>,
}

impl<B: Backend> phy::TxToken for EngineTxToken<'_, B> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let Some(mut packet) = self.engine.allocate_packet(len) else {
            // smoltcp still expects the frame to be built
            debug!("[{}] no packet for {}-byte frame, dropping", B::NAME, len);
            let mut scratch = vec![0u8; len];
            return f(&mut scratch);
        };

        let result = f(packet.data_mut());

        let offload = TxOffload::new(self.engine.enabled_capabilities());
        packet.set_flags(offload.flags_for(packet.data()));

        if let Err(e) = self.engine.send(vec![packet]) {
            trace!("[{}] transmit failed: {}", B::NAME, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::drivers::net::engine::Services;
    use crate::drivers::net::netdev::{Duplex, LinkSpeed, LinkState, MacAddress};
    use crate::drivers::net::sim::{HeapAllocator, SimNic, SimPlatform, SimRxDescriptor};
    use smoltcp::iface::{Config, Interface, SocketSet};
    use smoltcp::phy::{Device, RxToken, TxToken};
    use smoltcp::wire::{
        ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetRepr, HardwareAddress,
        IpAddress, IpCidr, Ipv4Address,
    };

    const MAC: MacAddress = MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    const PEER: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x99]);

    const UP: LinkState = LinkState::Up {
        speed: LinkSpeed::Mbps100,
        duplex: Duplex::Full,
    };

    struct Harness {
        device: EngineDevice<SimNic>,
        allocator: Arc<HeapAllocator>,
    }

    impl Harness {
        fn new() -> Self {
            let platform = Arc::new(SimPlatform::new());
            let allocator = Arc::new(HeapAllocator::new());
            let queue = Arc::new(FrameQueue::default());
            let services = Services {
                platform,
                allocator: allocator.clone(),
                net: queue.clone(),
            };
            let engine = Engine::new(
                SimNic::new(MAC, Capabilities::all()),
                EngineConfig::default(),
                services,
            )
            .unwrap();
            engine.backend().set_link(UP);
            engine.reset().unwrap();

            Self {
                device: EngineDevice::new(Arc::new(engine), queue),
                allocator,
            }
        }

        fn nic(&self) -> &SimNic {
            self.device.engine().backend()
        }

        fn service(&self) {
            let engine = self.device.engine();
            engine.handle_interrupt();
            engine.handle_deferred_work();
        }

        fn inject(&self, frame: &[u8], status: u32) {
            assert!(self.nic().inject_rx(frame, status));
            self.service();
        }
    }

    /// Ethernet + IPv4 header carrying `protocol`, no payload
    fn ipv4_frame(protocol: u8) -> Vec<u8> {
        let mut frame = vec![0u8; 14 + 20];
        frame[0..6].copy_from_slice(PEER.as_bytes());
        frame[6..12].copy_from_slice(MAC.as_bytes());
        frame[12..14].copy_from_slice(&[0x08, 0x00]);
        frame[14] = 0x45;
        frame[16..18].copy_from_slice(&20u16.to_be_bytes());
        frame[22] = 64;
        frame[23] = protocol;
        frame
    }

    fn arp_request(target: Ipv4Address) -> Vec<u8> {
        let arp = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: PEER,
            source_protocol_addr: Ipv4Address::new(10, 0, 0, 1),
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: target,
        };
        let ethernet = EthernetRepr {
            src_addr: PEER,
            dst_addr: EthernetAddress::BROADCAST,
            ethertype: EthernetProtocol::Arp,
        };

        let mut buffer = vec![0u8; ethernet.buffer_len() + arp.buffer_len()];
        let mut frame = EthernetFrame::new_unchecked(&mut buffer[..]);
        ethernet.emit(&mut frame);
        arp.emit(&mut ArpPacket::new_unchecked(frame.payload_mut()));
        buffer
    }

    fn send_through(device: &mut EngineDevice<SimNic>, frame: &[u8]) {
        let token = device.transmit(Instant::ZERO).unwrap();
        token.consume(frame.len(), |buffer| buffer.copy_from_slice(frame));
    }

    #[test]
    fn test_receive_yields_delivered_frame() {
        let mut h = Harness::new();
        assert!(h.device.receive(Instant::ZERO).is_none());

        let frame = ipv4_frame(6);
        h.inject(&frame, 0);

        let (rx, _tx) = h.device.receive(Instant::ZERO).unwrap();
        rx.consume(|data| assert_eq!(data, &frame[..]));
        assert!(h.device.receive(Instant::ZERO).is_none());
    }

    #[test]
    fn test_bad_checksum_frames_are_dropped() {
        let mut h = Harness::new();
        h.device
            .engine()
            .set_checksum_offload(Capabilities::RX_CHECKSUM)
            .unwrap();

        h.inject(&ipv4_frame(6), SimRxDescriptor::STATUS_CSUM_BAD);
        let good = ipv4_frame(17);
        h.inject(&good, 0);

        let (rx, _tx) = h.device.receive(Instant::ZERO).unwrap();
        rx.consume(|data| assert_eq!(data, &good[..]));
        assert_eq!(h.device.checksum_drops(), 1);
    }

    #[test]
    fn test_transmit_without_offload_sets_no_flags() {
        let mut h = Harness::new();
        let frame = ipv4_frame(6);

        send_through(&mut h.device, &frame);

        let sent = h.nic().transmit(4);
        assert_eq!(sent, vec![(frame, PacketFlags::empty())]);
    }

    #[test]
    fn test_transmit_tags_ipv4_frames_with_offload_flags() {
        let mut h = Harness::new();
        h.device
            .engine()
            .set_checksum_offload(Capabilities::TX_IP_CHECKSUM | Capabilities::TX_TCP_CHECKSUM)
            .unwrap();

        send_through(&mut h.device, &ipv4_frame(6));
        send_through(&mut h.device, &ipv4_frame(17));
        send_through(&mut h.device, &arp_request(Ipv4Address::new(10, 0, 0, 2)));

        let flags: Vec<_> = h.nic().transmit(4).into_iter().map(|(_, f)| f).collect();
        assert_eq!(
            flags,
            vec![
                PacketFlags::IP_CHECKSUM_OFFLOAD | PacketFlags::TCP_CHECKSUM_OFFLOAD,
                PacketFlags::IP_CHECKSUM_OFFLOAD,
                PacketFlags::empty(),
            ]
        );
    }

    #[test]
    fn test_protocol_offload_needs_ip_offload() {
        let offload = TxOffload::new(Capabilities::TX_TCP_CHECKSUM | Capabilities::TX_UDP_CHECKSUM);
        assert!(!offload.tcp && !offload.udp);
        assert_eq!(offload.flags_for(&ipv4_frame(6)), PacketFlags::empty());
    }

    #[test]
    fn test_transmit_needs_link() {
        let mut h = Harness::new();
        h.nic().set_link(LinkState::Down);
        h.device.engine().check_link();

        assert!(h.device.transmit(Instant::ZERO).is_none());
    }

    #[test]
    fn test_capabilities_follow_enabled_offloads() {
        let h = Harness::new();
        let caps = h.device.capabilities();
        assert_eq!(caps.medium, Medium::Ethernet);
        assert_eq!(caps.max_transmission_unit, 1514);
        assert_eq!(caps.max_burst_size, Some(32));
        assert!(matches!(caps.checksum.ipv4, Checksum::Both));
        assert!(matches!(caps.checksum.tcp, Checksum::Both));

        h.device
            .engine()
            .set_checksum_offload(Capabilities::TX_CHECKSUM)
            .unwrap();
        let caps = h.device.capabilities();
        assert!(matches!(caps.checksum.ipv4, Checksum::Rx));
        assert!(matches!(caps.checksum.tcp, Checksum::Rx));
        assert!(matches!(caps.checksum.udp, Checksum::Rx));
    }

    #[test]
    fn test_interface_answers_arp_request() {
        let mut h = Harness::new();
        let ip = Ipv4Address::new(10, 0, 0, 2);

        let config = Config::new(HardwareAddress::Ethernet(MAC));
        let mut iface = Interface::new(config, &mut h.device, Instant::ZERO);
        iface.update_ip_addrs(|addrs| {
            addrs.push(IpCidr::new(IpAddress::Ipv4(ip), 24)).unwrap();
        });
        let mut sockets = SocketSet::new(vec![]);

        h.inject(&arp_request(ip), 0);
        iface.poll(Instant::ZERO, &mut h.device, &mut sockets);

        let sent = h.nic().transmit(4);
        assert_eq!(sent.len(), 1);
        let frame = EthernetFrame::new_checked(&sent[0].0[..]).unwrap();
        assert_eq!(frame.dst_addr(), PEER);
        assert_eq!(frame.ethertype(), EthernetProtocol::Arp);
        let reply = ArpRepr::parse(&ArpPacket::new_checked(frame.payload()).unwrap()).unwrap();
        match reply {
            ArpRepr::EthernetIpv4 {
                operation,
                source_hardware_addr,
                source_protocol_addr,
                ..
            } => {
                assert_eq!(operation, ArpOperation::Reply);
                assert_eq!(source_hardware_addr, MAC);
                assert_eq!(source_protocol_addr, ip);
            }
            _ => panic!("not an Ethernet/IPv4 ARP reply"),
        }

        h.service();
        h.device.engine().teardown();
        assert_eq!(h.allocator.outstanding(), 0);
    }
}
