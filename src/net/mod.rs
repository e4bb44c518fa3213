//! Network stack glue
//!
//! Pieces that sit between an [`Engine`](crate::Engine) and a TCP/IP stack:
//! a DMA-backed packet pool for ring buffers, a queue that collects received
//! frames, and the smoltcp device adapter that drains it.

pub mod device;
pub mod packet_pool;
pub mod queue;

pub use device::EngineDevice;
pub use packet_pool::{PacketPool, PacketPoolStats, PoolError};
pub use queue::{FrameQueue, RxFrame};
