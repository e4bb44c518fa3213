//! Network device drivers and abstractions
//!
//! The generic half ([`engine`], [`ring`], [`tx`], [`rx`], [`events`],
//! [`link`], [`caps`]) is shared by every NIC; [`ethernet`] holds the
//! per-chip backends.

pub mod backend;
pub mod caps;
pub mod engine;
pub mod ethernet;
pub mod events;
pub mod link;
pub mod mii;
pub mod mmio;
pub mod netdev;
pub mod packet;
pub mod platform;
pub mod ring;
pub mod rx;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod stats;
pub mod tx;

pub use netdev::*;
