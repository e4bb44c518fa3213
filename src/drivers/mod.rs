//! Device drivers
//!
//! - `net`: the ring engine and its NIC backends
//! - `timer`: clock contract and bounded register polling

pub mod net;
pub mod timer;
