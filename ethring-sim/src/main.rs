//! Host simulator for the ethring engine
//!
//! Drives an `Engine<SimNic>` the way a kernel would: one thread stands in
//! for the interrupt line, another for the deferred-work queue, and the main
//! thread plays both the wire (injecting and completing frames) and the
//! stack (draining the frame queue). Engine logging goes through `log` and
//! is printed by `tracing-subscriber`; set `RUST_LOG=debug` to see it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ethring::drivers::net::caps::Capabilities;
use ethring::drivers::net::rx::RxChecksum;
use ethring::drivers::net::sim::{SimNic, SimPlatform, SimRxDescriptor};
use ethring::net::{FrameQueue, PacketPool};
use ethring::{
    Duplex, Engine, EngineConfig, LinkSpeed, LinkState, MacAddress, PacketAllocator, Services,
};

const CHECKSUM_FAILED: RxChecksum = RxChecksum::IP_FAILED
    .union(RxChecksum::TCP_FAILED)
    .union(RxChecksum::UDP_FAILED);

/// Rounds of draining before giving up on in-flight frames
const DRAIN_ROUNDS: usize = 1_000;

const MAC: MacAddress = MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

#[derive(Parser, Debug)]
#[command(about = "Run the descriptor-ring engine over a simulated NIC")]
struct Args {
    /// Frames to send and receive
    #[arg(long, default_value_t = 10_000)]
    frames: usize,

    /// Frame length in bytes
    #[arg(long, default_value_t = 512)]
    frame_size: usize,

    /// Transmit descriptors
    #[arg(long, default_value_t = 32)]
    tx_ring: usize,

    /// Receive descriptors
    #[arg(long, default_value_t = 32)]
    rx_ring: usize,

    /// Frames the wire completes per step
    #[arg(long, default_value_t = 8)]
    burst: usize,

    /// Every Nth received frame carries a bad checksum (0 = never)
    #[arg(long, default_value_t = 0)]
    bad_checksum_every: usize,

    /// Take the link down and back up halfway through
    #[arg(long)]
    flap_link: bool,

    /// Packet pool buffers
    #[arg(long, default_value_t = 256)]
    pool_buffers: usize,
}

/// Threads standing in for interrupt and deferred-work context
struct Contexts {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Contexts {
    fn spawn(engine: &Arc<Engine<SimNic>>, platform: &Arc<SimPlatform>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));

        let poller = {
            let engine = engine.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    if engine.backend().pending_cause() != 0 {
                        engine.handle_interrupt();
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };

        let worker = {
            let engine = engine.clone();
            let platform = platform.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    if platform.take_worker_request() {
                        engine.handle_deferred_work();
                    } else {
                        thread::sleep(Duration::from_micros(50));
                    }
                }
            })
        };

        Self {
            stop,
            handles: vec![poller, worker],
        }
    }

    fn join(self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        for handle in self.handles {
            handle
                .join()
                .map_err(|_| anyhow!("simulation thread panicked"))?;
        }
        Ok(())
    }
}

fn test_frame(sequence: usize, len: usize) -> Vec<u8> {
    let mut frame = vec![0u8; len];
    frame[0..6].copy_from_slice(&[0xFF; 6]);
    frame[6..12].copy_from_slice(MAC.as_bytes());
    frame[12..14].copy_from_slice(&0x88B5u16.to_be_bytes());
    for (i, byte) in frame[14..].iter_mut().enumerate() {
        *byte = (sequence + i) as u8;
    }
    frame
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if args.frame_size < 60 || args.frame_size > 1514 {
        bail!("frame size must be within 60..=1514, got {}", args.frame_size);
    }

    let config = EngineConfig::default()
        .with_tx_ring_size(args.tx_ring)
        .with_rx_ring_size(args.rx_ring);
    config
        .validate()
        .map_err(|e| anyhow!("invalid ring configuration: {e}"))?;

    let platform = Arc::new(SimPlatform::new());
    let pool = Arc::new(
        PacketPool::new(platform.clone(), args.pool_buffers, config.rx_buffer_size)
            .map_err(|e| anyhow!("packet pool: {e}"))?,
    );
    let queue = Arc::new(FrameQueue::new(args.rx_ring * 2));

    let services = Services {
        platform: platform.clone(),
        allocator: pool.clone(),
        net: queue.clone(),
    };
    let engine = Arc::new(
        Engine::new(SimNic::new(MAC, Capabilities::all()), config, services)
            .map_err(|e| anyhow!("engine: {e}"))?,
    );

    let up = LinkState::Up {
        speed: LinkSpeed::Mbps1000,
        duplex: Duplex::Full,
    };
    engine.backend().set_link(up);
    engine.reset().map_err(|e| anyhow!("reset: {e}"))?;
    engine
        .set_checksum_offload(Capabilities::RX_CHECKSUM)
        .map_err(|e| anyhow!("checksum offload: {e}"))?;

    let contexts = Contexts::spawn(&engine, &platform);

    let mut received = 0usize;
    let mut bad_checksums = 0usize;
    let mut wire_sent = 0usize;
    let mut rx_overruns = 0usize;

    for sequence in 0..args.frames {
        if args.flap_link && sequence == args.frames / 2 {
            engine.backend().set_link(LinkState::Down);
            engine.link_timer_tick();
            engine.backend().set_link(up);
            engine.link_timer_tick();
        }

        // Wire to host
        let frame = test_frame(sequence, args.frame_size);
        let status = match args.bad_checksum_every {
            n if n > 0 && sequence % n == 0 => SimRxDescriptor::STATUS_CSUM_BAD,
            _ => 0,
        };
        if !engine.backend().inject_rx(&frame, status) {
            rx_overruns += 1;
        }

        // Host to wire
        if let Some(mut packet) = pool.allocate(0, args.frame_size, 0) {
            packet.data_mut().copy_from_slice(&frame);
            // Drops are counted by the engine
            let _ = engine.send(vec![packet]);
        }
        if sequence % args.burst.max(1) == 0 {
            wire_sent += engine.backend().transmit(args.burst).len();
        }

        for delivered in queue.drain() {
            if delivered.checksum.intersects(CHECKSUM_FAILED) {
                bad_checksums += 1;
            } else {
                received += 1;
            }
        }

        platform.advance(100);
    }

    // Let the wire finish what is in flight
    for _ in 0..DRAIN_ROUNDS {
        if engine.tx_backlog() == 0 {
            break;
        }
        let completed = engine.backend().transmit(args.tx_ring).len();
        if completed == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        wire_sent += completed;
    }
    thread::sleep(Duration::from_millis(10));
    received += queue.drain().count();

    contexts.join()?;
    engine.teardown();

    let stats = engine.stats();
    let pool_stats = pool.stats();
    println!("{} over {:?}", engine.mac_address(), engine.link_state());
    println!(
        "tx: {} packets, {} bytes, {} dropped, {} errors, {} on the wire",
        stats.tx_packets, stats.tx_bytes, stats.tx_dropped, stats.tx_errors, wire_sent
    );
    println!(
        "rx: {} packets, {} bytes, {} errors, {} stalls, {} overruns",
        stats.rx_packets, stats.rx_bytes, stats.rx_errors, stats.rx_stalls, rx_overruns
    );
    println!(
        "stack: {} frames, {} bad checksums, {} queue drops",
        received,
        bad_checksums,
        queue.dropped()
    );
    println!(
        "interrupts: {} ({} spurious), worker runs: {}",
        stats.interrupts, stats.spurious_interrupts, stats.worker_runs
    );
    println!(
        "pool: {} allocations, {} failures, {} in use",
        pool_stats.alloc_count, pool_stats.alloc_failures, pool_stats.in_use
    );
    Ok(())
}
