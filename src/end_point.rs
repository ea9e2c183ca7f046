use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::{BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, span, warn, Instrument, Level};
use uuid::Uuid;

use crate::clock::WallClock;
use crate::config::HudpConfig;
use crate::event_log::{Direction, EventSink, TransportEvent, TransportEventKind};
use crate::message_dispatcher::MessageDispatcher;
use crate::packet_header::{AckPayload, ChannelType, PacketHeader};
use crate::receive_channel::ReliableReceiveChannel;
use crate::rtt::RttEstimator;
use crate::send_channel::ReliableSendChannel;
use crate::send_pipeline::SendPipeline;
use crate::seq::SeqNo;

#[derive(Default)]
struct ChannelCounters {
    tx_rel: AtomicU64,
    tx_unrel: AtomicU64,
    rx_rel: AtomicU64,
    rx_unrel: AtomicU64,
    rx_ack: AtomicU64,
}

/// Read-only snapshot of an endpoint's counters and timing state.
#[derive(Clone, Debug, PartialEq)]
pub struct HudpStats {
    pub tx_rel: u64,
    pub tx_unrel: u64,
    pub rx_rel: u64,
    pub rx_unrel: u64,
    pub rx_ack: u64,
    pub srtt_ms: f64,
    pub rttvar_ms: f64,
    pub t_min_ms: u64,
    pub t_max_ms: u64,
    pub k_rttvar: f64,
}

/// EndPoint is the place where all other parts of the protocol come together: It owns the
///  UDP socket, dispatches incoming datagrams by channel tag to the reliable receiver, the
///  reliable sender (ACKs) or the application's unreliable callback, computes the
///  per-packet adaptive expiry for reliable sends, and has the send/lifecycle API for
///  application code.
///
/// One endpoint talks to exactly one peer. The peer is set explicitly via
///  [`set_peer`](EndPoint::set_peer) or learned lazily from the first inbound datagram.
pub struct EndPoint {
    config: Arc<HudpConfig>,
    clock: Arc<WallClock>,
    rtt: Arc<RwLock<RttEstimator>>,
    receive_socket: Arc<UdpSocket>,
    pipeline: Arc<SendPipeline>,
    send_channel: Arc<ReliableSendChannel>,
    receive_channel: Arc<ReliableReceiveChannel>,
    dispatcher: Arc<dyn MessageDispatcher>,
    event_sink: Arc<dyn EventSink>,
    counters: Arc<ChannelCounters>,
    running: Arc<AtomicBool>,
    rx_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl EndPoint {
    pub async fn new(
        dispatcher: Arc<dyn MessageDispatcher>,
        event_sink: Arc<dyn EventSink>,
        config: Arc<HudpConfig>,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound H-UDP socket to {:?}", receive_socket.local_addr()?);

        let clock = Arc::new(WallClock::new()?);
        let rtt = Arc::new(RwLock::new(RttEstimator::new()));
        let pipeline = Arc::new(SendPipeline::new(Arc::new(receive_socket.clone()), None));

        let send_channel = Arc::new(ReliableSendChannel::new(
            config.clone(),
            clock.clone(),
            rtt.clone(),
            pipeline.clone(),
            event_sink.clone(),
        ));
        let receive_channel = Arc::new(ReliableReceiveChannel::new(
            config.clone(),
            clock.clone(),
            rtt.clone(),
            pipeline.clone(),
            dispatcher.clone(),
            event_sink.clone(),
        ));

        Ok(EndPoint {
            config,
            clock,
            rtt,
            receive_socket,
            pipeline,
            send_channel,
            receive_channel,
            dispatcher,
            event_sink,
            counters: Arc::new(ChannelCounters::default()),
            running: Arc::new(AtomicBool::new(false)),
            rx_handle: StdMutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.receive_socket.local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }

    pub async fn peer_addr(&self) -> Option<SocketAddr> {
        self.pipeline.peer_addr().await
    }

    pub async fn set_peer(&self, peer: SocketAddr) {
        debug!("setting peer to {:?}", peer);
        self.pipeline.set_peer(peer).await;
    }

    /// Start the receive loop, the retransmission sweep and the gap re-check.
    pub fn start(&self) {
        let mut guard = self.rx_handle.lock().expect("rx handle mutex poisoned");
        if guard.is_some() {
            warn!("endpoint already started");
            return;
        }

        self.running.store(true, Ordering::Relaxed);
        self.send_channel.spawn_retransmit_loop();
        self.receive_channel.spawn_gap_loop();

        let recv_loop = RecvLoop {
            config: self.config.clone(),
            clock: self.clock.clone(),
            receive_socket: self.receive_socket.clone(),
            pipeline: self.pipeline.clone(),
            send_channel: self.send_channel.clone(),
            receive_channel: self.receive_channel.clone(),
            dispatcher: self.dispatcher.clone(),
            event_sink: self.event_sink.clone(),
            counters: self.counters.clone(),
            running: self.running.clone(),
        };
        *guard = Some(tokio::spawn(recv_loop.run()));
    }

    /// Scoped shutdown: stops the receive loop and both timer loops and closes the event
    ///  sink before returning. Idempotent, and safe to call without a prior
    ///  [`start`](EndPoint::start).
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::Relaxed) {
            debug!("stopping endpoint");
        }

        let handle = self.rx_handle.lock().expect("rx handle mutex poisoned").take();
        if let Some(handle) = handle {
            handle.abort();
            handle.await.ok();
        }

        self.send_channel.stop().await;
        self.receive_channel.stop().await;
        self.event_sink.close();
    }

    /// Send a payload on the chosen channel. The peer must be set first.
    ///
    /// For reliable sends, the per-packet expiry deadline is computed from the current
    ///  adaptive-t - past it the packet is abandoned rather than retransmitted further.
    ///  `urgency_ms` is a small non-negative hint that shortens retransmission pacing and
    ///  widens the deadline.
    pub async fn send(&self, payload: &[u8], reliable: bool, urgency_ms: u64) -> anyhow::Result<()> {
        if reliable {
            let deadline_ms = self.rtt.read().await.adaptive_t_ms(urgency_ms, &self.config.timing);
            let seq = self.send_channel.send(payload, urgency_ms, Some(deadline_ms)).await?;

            self.counters.tx_rel.fetch_add(1, Ordering::Relaxed);
            self.event_sink.record(TransportEvent {
                ts_ms: self.clock.now_ms(),
                direction: Direction::Tx,
                channel: ChannelType::Reliable,
                seq: Some(seq),
                send_ts_ms: Some(self.clock.wire_timestamp()),
                rtt_ms: None,
                retries: None,
                kind: TransportEventKind::Send,
                deadline_ms: Some(deadline_ms),
                payload_len: payload.len(),
            });
        }
        else {
            let mut packet = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + payload.len());
            PacketHeader::new(ChannelType::Unreliable, SeqNo::ZERO, self.clock.wire_timestamp()).ser(&mut packet);
            packet.put_slice(payload);
            self.pipeline.send_to_peer(&packet).await?;

            self.counters.tx_unrel.fetch_add(1, Ordering::Relaxed);
            self.event_sink.record(TransportEvent {
                ts_ms: self.clock.now_ms(),
                direction: Direction::Tx,
                channel: ChannelType::Unreliable,
                seq: None,
                send_ts_ms: Some(self.clock.wire_timestamp()),
                rtt_ms: None,
                retries: None,
                kind: TransportEventKind::Send,
                deadline_ms: None,
                payload_len: payload.len(),
            });
        }
        Ok(())
    }

    pub async fn stats(&self) -> HudpStats {
        let rtt = self.rtt.read().await;
        HudpStats {
            tx_rel: self.counters.tx_rel.load(Ordering::Relaxed),
            tx_unrel: self.counters.tx_unrel.load(Ordering::Relaxed),
            rx_rel: self.counters.rx_rel.load(Ordering::Relaxed),
            rx_unrel: self.counters.rx_unrel.load(Ordering::Relaxed),
            rx_ack: self.counters.rx_ack.load(Ordering::Relaxed),
            srtt_ms: rtt.srtt_ms().unwrap_or(0.0),
            rttvar_ms: rtt.rttvar_ms().unwrap_or(0.0),
            t_min_ms: self.config.timing.t_min_ms,
            t_max_ms: self.config.timing.t_max_ms,
            k_rttvar: self.config.timing.k_rttvar,
        }
    }
}

/// The state the spawned receive loop runs on, cloned out of the endpoint so the loop
///  owns what it needs.
struct RecvLoop {
    config: Arc<HudpConfig>,
    clock: Arc<WallClock>,
    receive_socket: Arc<UdpSocket>,
    pipeline: Arc<SendPipeline>,
    send_channel: Arc<ReliableSendChannel>,
    receive_channel: Arc<ReliableReceiveChannel>,
    dispatcher: Arc<dyn MessageDispatcher>,
    event_sink: Arc<dyn EventSink>,
    counters: Arc<ChannelCounters>,
    running: Arc<AtomicBool>,
}

impl RecvLoop {
    async fn run(self) {
        info!("starting receive loop");

        let mut buf = vec![0u8; self.config.max_recv_size];
        while self.running.load(Ordering::Relaxed) {
            // bounded poll, so a stop request is observed promptly even when the peer is
            //  silent
            let (num_read, from) = match timeout(self.config.receive_poll_timeout, self.receive_socket.recv_from(&mut buf)).await {
                Err(_elapsed) => continue,
                Ok(Ok(x)) => x,
                Ok(Err(e)) => {
                    if self.running.load(Ordering::Relaxed) {
                        error!("socket error: {} - terminating receive loop", e);
                    }
                    break;
                }
            };

            let correlation_id = Uuid::new_v4();
            self.on_datagram(&buf[..num_read], from)
                .instrument(span!(Level::TRACE, "datagram_received", ?correlation_id))
                .await;
        }

        info!("receive loop terminated");
    }

    async fn on_datagram(&self, datagram: &[u8], from: SocketAddr) {
        if self.pipeline.peer_addr().await.is_none() {
            // receiver-side endpoints learn the peer lazily so ACKs can flow without
            //  explicit configuration
            debug!("learning peer address {:?} from first inbound datagram", from);
            self.pipeline.set_peer(from).await;
        }

        let mut parse_buf = datagram;
        let header = match PacketHeader::deser(&mut parse_buf) {
            Ok(header) => header,
            Err(_) => {
                debug!("datagram from {:?} shorter than the header - dropping", from);
                return;
            }
        };

        let now = self.clock.now_ms();

        match header.channel_type() {
            Some(ChannelType::Reliable) => {
                self.counters.rx_rel.fetch_add(1, Ordering::Relaxed);
                self.event_sink.record(TransportEvent {
                    ts_ms: now,
                    direction: Direction::Rx,
                    channel: ChannelType::Reliable,
                    seq: Some(header.seq),
                    send_ts_ms: Some(header.send_ts_ms),
                    rtt_ms: None,
                    retries: None,
                    kind: TransportEventKind::Recv,
                    deadline_ms: None,
                    payload_len: parse_buf.len(),
                });
                self.receive_channel.on_packet(header.seq, header.send_ts_ms, parse_buf).await;
            }
            Some(ChannelType::Unreliable) => {
                self.counters.rx_unrel.fetch_add(1, Ordering::Relaxed);
                self.event_sink.record(TransportEvent {
                    ts_ms: now,
                    direction: Direction::Rx,
                    channel: ChannelType::Unreliable,
                    seq: None,
                    send_ts_ms: Some(header.send_ts_ms),
                    rtt_ms: None,
                    retries: None,
                    kind: TransportEventKind::Recv,
                    deadline_ms: None,
                    payload_len: parse_buf.len(),
                });
                self.dispatcher.on_unreliable_message(parse_buf).await;
            }
            Some(ChannelType::Ack) => {
                self.counters.rx_ack.fetch_add(1, Ordering::Relaxed);
                let ack = match AckPayload::deser(&mut parse_buf) {
                    Ok(ack) => ack,
                    Err(_) => {
                        debug!("ACK for #{} from {:?} with malformed payload - dropping", header.seq, from);
                        return;
                    }
                };

                let rtt_ms = self.send_channel.on_ack(header.seq, ack.echo_send_ts_ms).await;
                self.event_sink.record(TransportEvent {
                    ts_ms: now,
                    direction: Direction::Rx,
                    channel: ChannelType::Ack,
                    seq: Some(header.seq),
                    send_ts_ms: Some(ack.echo_send_ts_ms),
                    rtt_ms: Some(rtt_ms),
                    retries: None,
                    kind: TransportEventKind::Ack,
                    deadline_ms: None,
                    payload_len: AckPayload::SERIALIZED_LEN,
                });
                self.dispatcher.on_ack(header.seq, rtt_ms).await;
            }
            None => {
                debug!("unknown channel tag {} from {:?} - dropping", header.channel, from);
            }
        }
    }
}
