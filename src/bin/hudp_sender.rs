//! Demo driver: floods a receiver with synthetic game-state payloads, split between the
//!  reliable and unreliable channels, and prints the endpoint's stats at the end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing::debug;

use hudp::config::HudpConfig;
use hudp::end_point::EndPoint;
use hudp::event_log::{CsvEventSink, EventSink, NoopEventSink};
use hudp::message_dispatcher::MessageDispatcher;
use hudp::seq::SeqNo;

#[derive(Parser)]
#[command(name = "hudp-sender", about = "H-UDP demo sender")]
struct Args {
    /// receiver host
    #[arg(long)]
    host: String,

    /// receiver port
    #[arg(long)]
    port: u16,

    /// seconds to run
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// packets per second total
    #[arg(long, default_value_t = 40)]
    pps: u32,

    /// fraction of packets sent on the reliable channel
    #[arg(long, default_value_t = 0.5)]
    reliable_ratio: f64,

    /// CSV transport event log path (omit to disable logging)
    #[arg(long)]
    log: Option<std::path::PathBuf>,
}

struct SenderDispatcher;

#[async_trait]
impl MessageDispatcher for SenderDispatcher {
    async fn on_reliable_message(&self, payload: &[u8]) {
        debug!("unexpected reliable payload of {} bytes on the sender side", payload.len());
    }

    async fn on_unreliable_message(&self, payload: &[u8]) {
        debug!("unexpected unreliable payload of {} bytes on the sender side", payload.len());
    }

    async fn on_ack(&self, seq: SeqNo, rtt_ms: u64) {
        debug!("ack for #{} (rtt {}ms)", seq, rtt_ms);
    }
}

const MOVEMENT_STATES: [&str; 4] = ["CROUCHING", "PRONING", "WALKING", "RUNNING"];

/// Very simple mock player: random-walk position, velocity is the last delta, movement
///  state flips occasionally.
struct MockPlayer {
    pos: [i32; 3],
    vel: [i32; 3],
    state: &'static str,
}

impl MockPlayer {
    fn new() -> MockPlayer {
        MockPlayer {
            pos: [0, 0, 0],
            vel: [0, 0, 0],
            state: "WALKING",
        }
    }

    fn tick(&mut self) {
        fn step() -> i32 {
            (rand::random::<u32>() % 7) as i32 - 3
        }

        self.vel = [step(), step(), step()];
        for (pos, delta) in self.pos.iter_mut().zip(self.vel) {
            *pos += delta;
        }

        if rand::random::<f64>() < 0.05 {
            let next = MOVEMENT_STATES[rand::random::<u32>() as usize % MOVEMENT_STATES.len()];
            if next != self.state {
                self.state = next;
            }
        }
    }

    fn as_payload(&self, i: u64, ts_ms: u64) -> Vec<u8> {
        format!(
            "{{\"i\":{},\"ts\":{},\"pos\":[{},{},{}],\"vel\":[{},{},{}],\"state\":\"{}\"}}",
            i, ts_ms,
            self.pos[0], self.pos[1], self.pos[2],
            self.vel[0], self.vel[1], self.vel[2],
            self.state,
        ).into_bytes()
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let peer = tokio::net::lookup_host((args.host.as_str(), args.port)).await?
        .next()
        .context("could not resolve receiver host")?;

    let event_sink: Arc<dyn EventSink> = match &args.log {
        Some(path) => Arc::new(CsvEventSink::create(path)?),
        None => Arc::new(NoopEventSink),
    };

    let config = Arc::new(HudpConfig::new(SocketAddr::from(([0, 0, 0, 0], 0))));
    let api = EndPoint::new(Arc::new(SenderDispatcher), event_sink, config).await?;
    api.set_peer(peer).await;
    api.start();
    println!("Sending to {:?} for {}s at {} packets/s", peer, args.duration, args.pps);

    let total = args.duration * u64::from(args.pps);
    let mut tick = tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(args.pps.max(1))));
    let mut player = MockPlayer::new();

    for i in 0..total {
        tick.tick().await;
        player.tick();

        let reliable = rand::random::<f64>() < args.reliable_ratio;
        // mark a fifth of the reliable packets as slightly urgent
        let urgency_ms = if reliable && rand::random::<f64>() < 0.2 { 40 } else { 0 };

        let now_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis() as u64;
        api.send(&player.as_payload(i, now_ms), reliable, urgency_ms).await?;
    }

    // give in-flight packets a moment to be acknowledged or expire before shutting down
    tokio::time::sleep(Duration::from_millis(500)).await;

    let stats = api.stats().await;
    api.stop().await;
    println!("{:#?}", stats);
    Ok(())
}
