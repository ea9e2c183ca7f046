use std::cmp::max;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, trace, warn};

use crate::clock::WallClock;
use crate::config::HudpConfig;
use crate::event_log::{Direction, EventSink, TransportEvent, TransportEventKind};
use crate::packet_header::{ChannelType, PacketHeader};
use crate::rtt::{RttEstimator, MAX_SAMPLE_MS};
use crate::send_pipeline::SendPipeline;
use crate::seq::SeqNo;

/// Floor for the retransmission pacing interval: even a very urgent packet is not resent
///  more often than this
const MIN_RETRANSMIT_DELAY_MS: u64 = 80;

struct InFlight {
    payload: Bytes,
    first_tx_ms: u64,
    last_tx_ms: u64,
    retries: u32,
    urgency_ms: u64,
    /// the adaptive budget this packet was sent with, kept for observability
    deadline_ms: Option<u64>,
    /// absolute point past which the packet is abandoned instead of retransmitted
    expiry_ms: Option<u64>,
}

struct SendChannelInner {
    next_seq: SeqNo,
    in_flight: FxHashMap<SeqNo, InFlight>,
}

/// The sending half of the reliable channel: allocates sequence numbers, tracks in-flight
///  packets, retransmits on RTO and abandons packets past their expiry deadline.
///
/// Retransmitted copies keep their sequence number but get a fresh header timestamp, so
///  the ACK's echoed timestamp always measures the round trip of the specific copy the
///  receiver saw.
pub struct ReliableSendChannel {
    config: Arc<HudpConfig>,
    clock: Arc<WallClock>,
    rtt: Arc<RwLock<RttEstimator>>,
    pipeline: Arc<SendPipeline>,
    event_sink: Arc<dyn EventSink>,
    inner: Arc<RwLock<SendChannelInner>>,
    running: Arc<AtomicBool>,
    sweep_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for ReliableSendChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep_handle.lock().expect("sweep handle mutex poisoned").take() {
            handle.abort();
        }
    }
}

impl ReliableSendChannel {
    pub fn new(
        config: Arc<HudpConfig>,
        clock: Arc<WallClock>,
        rtt: Arc<RwLock<RttEstimator>>,
        pipeline: Arc<SendPipeline>,
        event_sink: Arc<dyn EventSink>,
    ) -> ReliableSendChannel {
        ReliableSendChannel {
            config,
            clock,
            rtt,
            pipeline,
            event_sink,
            inner: Arc::new(RwLock::new(SendChannelInner {
                next_seq: SeqNo::ZERO,
                in_flight: FxHashMap::default(),
            })),
            running: Arc::new(AtomicBool::new(false)),
            sweep_handle: StdMutex::new(None),
        }
    }

    /// Allocate the next sequence number, transmit immediately and start tracking the
    ///  packet. `deadline_ms` (normally the dispatcher's adaptive-t for this packet) fixes
    ///  the expiry point; without it the packet is retransmitted until acknowledged.
    pub async fn send(&self, payload: &[u8], urgency_ms: u64, deadline_ms: Option<u64>) -> anyhow::Result<SeqNo> {
        let mut inner = self.inner.write().await;

        let seq = inner.next_seq;
        let now = self.clock.now_ms();
        let send_ts = (now & 0xffff_ffff) as u32;

        let mut packet = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + payload.len());
        PacketHeader::new(ChannelType::Reliable, seq, send_ts).ser(&mut packet);
        packet.put_slice(payload);
        self.pipeline.send_to_peer(&packet).await?;

        trace!("sent reliable packet #{} with deadline {:?}ms", seq, deadline_ms);

        inner.next_seq = seq.next();
        inner.in_flight.insert(seq, InFlight {
            payload: Bytes::copy_from_slice(payload),
            first_tx_ms: now,
            last_tx_ms: now,
            retries: 0,
            urgency_ms,
            deadline_ms,
            expiry_ms: deadline_ms.map(|deadline| now + deadline),
        });
        Ok(seq)
    }

    /// Consume an ACK: take an RTT sample from the echoed timestamp and clear the matching
    ///  in-flight record. ACKs for unknown (already acknowledged or expired) sequence
    ///  numbers are no-ops and do not touch the RTT estimate. Returns the sample.
    pub async fn on_ack(&self, seq: SeqNo, echo_send_ts_ms: u32) -> u64 {
        let sample_ms = self.clock.rtt_sample_ms(echo_send_ts_ms);

        match self.inner.write().await.in_flight.remove(&seq) {
            Some(record) => {
                if sample_ms <= MAX_SAMPLE_MS {
                    self.rtt.write().await.update(sample_ms);
                }
                trace!("ack for packet #{} after {} retries, rtt sample {}ms", seq, record.retries, sample_ms);
            }
            None => {
                trace!("ack for unknown packet #{} (already acknowledged or expired) - ignoring", seq);
            }
        }
        sample_ms
    }

    pub async fn in_flight_count(&self) -> usize {
        self.inner.read().await.in_flight.len()
    }

    pub fn spawn_retransmit_loop(&self) {
        let mut guard = self.sweep_handle.lock().expect("sweep handle mutex poisoned");
        if guard.is_some() {
            warn!("retransmission loop already spawned");
            return;
        }

        self.running.store(true, Ordering::Relaxed);
        *guard = Some(tokio::spawn(Self::do_loop(
            self.config.clone(),
            self.clock.clone(),
            self.rtt.clone(),
            self.pipeline.clone(),
            self.event_sink.clone(),
            self.inner.clone(),
            self.running.clone(),
        )));
    }

    /// Idempotent, safe to call without a prior [`spawn_retransmit_loop`](Self::spawn_retransmit_loop).
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        let handle = self.sweep_handle.lock().expect("sweep handle mutex poisoned").take();
        if let Some(handle) = handle {
            handle.abort();
            handle.await.ok();
        }
    }

    async fn do_loop(
        config: Arc<HudpConfig>,
        clock: Arc<WallClock>,
        rtt: Arc<RwLock<RttEstimator>>,
        pipeline: Arc<SendPipeline>,
        event_sink: Arc<dyn EventSink>,
        inner: Arc<RwLock<SendChannelInner>>,
        running: Arc<AtomicBool>,
    ) {
        let mut tick = interval(config.retransmit_tick);
        loop {
            tick.tick().await;
            if !running.load(Ordering::Relaxed) {
                break;
            }
            Self::sweep_in_flight(&clock, &rtt, &pipeline, &event_sink, &inner).await;
        }
    }

    async fn sweep_in_flight(
        clock: &WallClock,
        rtt: &RwLock<RttEstimator>,
        pipeline: &SendPipeline,
        event_sink: &Arc<dyn EventSink>,
        inner: &RwLock<SendChannelInner>,
    ) {
        let now = clock.now_ms();
        let rto = rtt.read().await.rto_ms();

        let mut inner = inner.write().await;

        let mut to_expire = Vec::new();
        let mut to_retransmit = Vec::new();
        for (&seq, record) in &inner.in_flight {
            // expiry takes precedence over retransmission for the same record in the same
            //  tick: once past the deadline the packet is abandoned, never resent
            if let Some(expiry_ms) = record.expiry_ms {
                if now >= expiry_ms {
                    to_expire.push(seq);
                    continue;
                }
            }

            let resend_at = record.last_tx_ms
                + max(MIN_RETRANSMIT_DELAY_MS, rto.saturating_sub(record.urgency_ms));
            if now >= resend_at {
                to_retransmit.push(seq);
            }
        }

        for seq in to_expire {
            if let Some(record) = inner.in_flight.remove(&seq) {
                debug!("reliable packet #{} expired {}ms after first transmission ({} retries) - abandoning",
                    seq, now - record.first_tx_ms, record.retries);
                event_sink.record(TransportEvent {
                    ts_ms: now,
                    direction: Direction::Tx,
                    channel: ChannelType::Reliable,
                    seq: Some(seq),
                    send_ts_ms: None,
                    rtt_ms: None,
                    retries: Some(record.retries),
                    kind: TransportEventKind::Expire,
                    deadline_ms: record.deadline_ms,
                    payload_len: record.payload.len(),
                });
            }
        }

        for seq in to_retransmit {
            let send_ts = clock.wire_timestamp();
            let record = match inner.in_flight.get_mut(&seq) {
                Some(record) => record,
                None => continue,
            };

            let mut packet = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + record.payload.len());
            PacketHeader::new(ChannelType::Reliable, seq, send_ts).ser(&mut packet);
            packet.put_slice(&record.payload);

            if pipeline.send_to_peer(&packet).await.is_err() {
                // no peer configured (yet) - the record stays in flight for the next tick
                continue;
            }

            record.last_tx_ms = now;
            record.retries += 1;
            trace!("retransmitted packet #{} (retry {})", seq, record.retries);
            event_sink.record(TransportEvent {
                ts_ms: now,
                direction: Direction::Tx,
                channel: ChannelType::Reliable,
                seq: Some(seq),
                send_ts_ms: Some(send_ts),
                rtt_ms: None,
                retries: Some(record.retries),
                kind: TransportEventKind::Retransmit,
                deadline_ms: record.deadline_ms,
                payload_len: record.payload.len(),
            });
        }
    }
}
