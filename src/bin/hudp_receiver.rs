//! Demo driver: listens for H-UDP traffic, prints delivered payloads and the endpoint's
//!  stats at the end. The sender is normally learned from the first inbound datagram; it
//!  can also be configured explicitly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use tracing::debug;

use hudp::config::{GapTimingMode, HudpConfig};
use hudp::end_point::EndPoint;
use hudp::event_log::{CsvEventSink, EventSink, NoopEventSink};
use hudp::message_dispatcher::MessageDispatcher;
use hudp::seq::SeqNo;

#[derive(Copy, Clone, Eq, PartialEq, Debug, ValueEnum)]
enum TimerMode {
    Static,
    Dynamic,
}

#[derive(Parser)]
#[command(name = "hudp-receiver", about = "H-UDP demo receiver")]
struct Args {
    /// address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// port to listen on
    #[arg(long)]
    port: u16,

    /// seconds to run; 0 runs until interrupted
    #[arg(long, default_value_t = 0)]
    duration: u64,

    /// CSV transport event log path (omit to disable logging)
    #[arg(long)]
    log: Option<std::path::PathBuf>,

    /// gap timer mode for skip-after-t deadlines
    #[arg(long, value_enum, default_value = "dynamic")]
    t_mode: TimerMode,

    /// fixed gap budget (ms), used only with --t-mode=static
    #[arg(long, default_value_t = 200)]
    t_static_ms: u64,

    /// explicit peer host (otherwise learned from the first datagram)
    #[arg(long)]
    peer_host: Option<String>,

    /// explicit peer port
    #[arg(long)]
    peer_port: Option<u16>,
}

#[derive(Default)]
struct PrintingDispatcher {
    reliable_count: AtomicU64,
    unreliable_count: AtomicU64,
}

#[async_trait]
impl MessageDispatcher for PrintingDispatcher {
    async fn on_reliable_message(&self, payload: &[u8]) {
        let n = self.reliable_count.fetch_add(1, Ordering::Relaxed) + 1;
        println!("[REL #{n}] {}", String::from_utf8_lossy(payload));
    }

    async fn on_unreliable_message(&self, payload: &[u8]) {
        let n = self.unreliable_count.fetch_add(1, Ordering::Relaxed) + 1;
        println!("[UNR #{n}] {}", String::from_utf8_lossy(payload));
    }

    async fn on_ack(&self, seq: SeqNo, rtt_ms: u64) {
        debug!("ack for #{} (rtt {}ms)", seq, rtt_ms);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let self_addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let mut config = HudpConfig::new(self_addr);
    config.gap_timing = match args.t_mode {
        TimerMode::Dynamic => GapTimingMode::Dynamic,
        TimerMode::Static => GapTimingMode::Static { t_static_ms: args.t_static_ms },
    };

    let event_sink: Arc<dyn EventSink> = match &args.log {
        Some(path) => Arc::new(CsvEventSink::create(path)?),
        None => Arc::new(NoopEventSink),
    };

    let api = EndPoint::new(Arc::new(PrintingDispatcher::default()), event_sink, Arc::new(config)).await?;

    if let (Some(host), Some(port)) = (&args.peer_host, args.peer_port) {
        if let Some(peer) = tokio::net::lookup_host((host.as_str(), port)).await?.next() {
            api.set_peer(peer).await;
        }
    }

    api.start();
    println!("Receiver listening on {}", api.local_addr());

    if args.duration > 0 {
        tokio::time::sleep(Duration::from_secs(args.duration)).await;
    }
    else {
        tokio::signal::ctrl_c().await?;
    }

    let stats = api.stats().await;
    api.stop().await;
    println!("{:#?}", stats);
    Ok(())
}
