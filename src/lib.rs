//! ethring: descriptor-ring engine for Ethernet NIC drivers
//!
//! Every driver in this family follows the same shape: a fixed-size circular
//! ring of hardware descriptors per direction, an interrupt handler that only
//! records what happened, a deferred worker that reaps the rings, and a link
//! monitor polled from a timer. This crate implements that shape once, as
//! [`Engine`], generic over a small [`Backend`] trait that knows one chip's
//! registers and descriptor layout.
//!
//! ## Layout
//!
//! - `drivers::net::ring` - descriptor ring and ownership protocol
//! - `drivers::net::tx` / `rx` - transmit and receive pipelines
//! - `drivers::net::events` - interrupt to worker hand-off
//! - `drivers::net::link` / `mii` - link monitor and PHY decode
//! - `drivers::net::caps` - checksum offload and promiscuous mode
//! - `drivers::net::ethernet` - backends (e100, pcnet32, dwmac)
//! - `net` - smoltcp adapter, packet pool, frame queue
//!
//! The crate is `no_std` + `alloc`. OS services (clock, deferred work,
//! timers, DMA memory) come in through [`Platform`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod drivers;
pub mod net;
pub mod sync;

pub use config::{ConfigError, EngineConfig};
pub use drivers::net::backend::Backend;
pub use drivers::net::engine::{Engine, Services};
pub use drivers::net::netdev::{
    Duplex, InfoError, InformationKind, InterruptStatus, LinkSpeed, LinkState, MacAddress, NetCore,
    NetworkDevice, ResetError, SendError,
};
pub use drivers::net::packet::{Packet, PacketAllocator, PacketFlags};
pub use drivers::net::platform::Platform;
