use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, trace, warn};

use crate::clock::WallClock;
use crate::config::{GapTimingMode, HudpConfig};
use crate::event_log::{Direction, EventSink, TransportEvent, TransportEventKind};
use crate::message_dispatcher::MessageDispatcher;
use crate::packet_header::{AckPayload, ChannelType, PacketHeader};
use crate::rtt::RttEstimator;
use crate::send_pipeline::SendPipeline;
use crate::seq::SeqNo;

struct BufferedPacket {
    payload: Bytes,
    send_ts_ms: u32,
    #[allow(dead_code)] // kept for debugging / future latency analysis of buffered packets
    arrival_ms: u64,
}

struct ReceiveChannelInner {
    config: Arc<HudpConfig>,
    dispatcher: Arc<dyn MessageDispatcher>,
    event_sink: Arc<dyn EventSink>,

    /// next sequence number due for delivery; `None` until the first packet arrives and is
    ///  adopted as the starting point. Advances by one (mod 2^16) on every delivery or
    ///  skip and never regresses.
    expected_seq: Option<SeqNo>,

    /// packets that arrived ahead of `expected_seq`, waiting for the gap to fill or be
    ///  skipped
    buffer: FxHashMap<SeqNo, BufferedPacket>,

    /// active only while at least one buffered packet sits strictly ahead of
    ///  `expected_seq` within the window
    gap_start_ms: Option<u64>,
    gap_deadline_ms: Option<u64>,
}

impl ReceiveChannelInner {
    fn have_buffered_ahead(&self) -> bool {
        match self.expected_seq {
            Some(expected) => self.buffer.keys()
                .any(|&seq| expected.in_window(seq, self.config.reorder_window_size)),
            None => false,
        }
    }

    /// after any advance of `expected_seq`: clear the gap timer if no buffered packet is
    ///  ahead any more, else restart it with a fresh deadline
    fn refresh_gap_timer(&mut self, now: u64, t_budget_ms: u64) {
        if self.have_buffered_ahead() {
            self.gap_start_ms = Some(now);
            self.gap_deadline_ms = Some(now + t_budget_ms);
        }
        else {
            self.gap_start_ms = None;
            self.gap_deadline_ms = None;
        }
    }

    async fn deliver(&mut self, seq: SeqNo, send_ts_ms: u32, payload: &[u8], now: u64) {
        trace!("delivering packet #{}", seq);
        self.event_sink.record(TransportEvent {
            ts_ms: now,
            direction: Direction::Rx,
            channel: ChannelType::Reliable,
            seq: Some(seq),
            send_ts_ms: Some(send_ts_ms),
            rtt_ms: None,
            retries: None,
            kind: TransportEventKind::Deliver,
            deadline_ms: None,
            payload_len: payload.len(),
        });
        self.dispatcher.on_reliable_message(payload).await;
        self.expected_seq = Some(seq.next());
    }

    /// deliver buffered packets that have become contiguous with `expected_seq`
    async fn drain_in_order(&mut self, now: u64) {
        while let Some(expected) = self.expected_seq {
            match self.buffer.remove(&expected) {
                Some(buffered) => {
                    self.deliver(expected, buffered.send_ts_ms, &buffered.payload, now).await;
                }
                None => break,
            }
        }
    }

    /// the skip-after-t rule: once the gap deadline has passed and a buffered packet still
    ///  sits ahead, give up on the missing sequence number and move on
    async fn skip_if_overdue(&mut self, now: u64, t_budget_ms: u64) {
        let deadline = match self.gap_deadline_ms {
            Some(deadline) => deadline,
            None => return,
        };
        let expected = match self.expected_seq {
            Some(expected) => expected,
            None => return,
        };

        if now >= deadline && self.have_buffered_ahead() {
            let waited_ms = self.gap_start_ms.map(|start| now - start).unwrap_or(0);
            debug!("gap at #{} outlived its budget after {}ms - skipping", expected, waited_ms);
            self.event_sink.record(TransportEvent {
                ts_ms: now,
                direction: Direction::Rx,
                channel: ChannelType::Reliable,
                seq: Some(expected),
                send_ts_ms: None,
                rtt_ms: None,
                retries: None,
                kind: TransportEventKind::Skip,
                deadline_ms: Some(t_budget_ms),
                payload_len: 0,
            });

            self.expected_seq = Some(expected.next());
            self.drain_in_order(now).await;
            self.refresh_gap_timer(now, t_budget_ms);
        }
    }

    fn record_observation(&self, kind: TransportEventKind, seq: SeqNo, send_ts_ms: u32, payload_len: usize, now: u64) {
        self.event_sink.record(TransportEvent {
            ts_ms: now,
            direction: Direction::Rx,
            channel: ChannelType::Reliable,
            seq: Some(seq),
            send_ts_ms: Some(send_ts_ms),
            rtt_ms: None,
            retries: None,
            kind,
            deadline_ms: None,
            payload_len,
        });
    }
}

/// The receiving half of the reliable channel: acknowledges every arrival, reorders via a
///  bounded buffer, delivers in sequence and skips a missing sequence number once a gap
///  has persisted past its budget.
///
/// All mutation of the cursor and the buffer happens under a single critical section per
///  event, so the drain/skip logic is atomic with respect to concurrent arrivals; delivery
///  callbacks run inside that section.
pub struct ReliableReceiveChannel {
    config: Arc<HudpConfig>,
    clock: Arc<WallClock>,
    rtt: Arc<RwLock<RttEstimator>>,
    pipeline: Arc<SendPipeline>,
    inner: Arc<RwLock<ReceiveChannelInner>>,
    running: Arc<AtomicBool>,
    gap_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for ReliableReceiveChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.gap_handle.lock().expect("gap handle mutex poisoned").take() {
            handle.abort();
        }
    }
}

impl ReliableReceiveChannel {
    pub fn new(
        config: Arc<HudpConfig>,
        clock: Arc<WallClock>,
        rtt: Arc<RwLock<RttEstimator>>,
        pipeline: Arc<SendPipeline>,
        dispatcher: Arc<dyn MessageDispatcher>,
        event_sink: Arc<dyn EventSink>,
    ) -> ReliableReceiveChannel {
        let inner = ReceiveChannelInner {
            config: config.clone(),
            dispatcher,
            event_sink,
            expected_seq: None,
            buffer: FxHashMap::default(),
            gap_start_ms: None,
            gap_deadline_ms: None,
        };

        ReliableReceiveChannel {
            config,
            clock,
            rtt,
            pipeline,
            inner: Arc::new(RwLock::new(inner)),
            running: Arc::new(AtomicBool::new(false)),
            gap_handle: StdMutex::new(None),
        }
    }

    /// the budget a gap is given before the missing packet is skipped
    async fn gap_budget_ms(
        config: &HudpConfig,
        rtt: &RwLock<RttEstimator>,
    ) -> u64 {
        match config.gap_timing {
            GapTimingMode::Static { t_static_ms } => t_static_ms,
            GapTimingMode::Dynamic => rtt.read().await.adaptive_t_ms(0, &config.timing),
        }
    }

    async fn send_ack(&self, seq: SeqNo, echo_send_ts_ms: u32) {
        let mut packet = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + AckPayload::SERIALIZED_LEN);
        PacketHeader::new(ChannelType::Ack, seq, self.clock.wire_timestamp()).ser(&mut packet);
        AckPayload { echo_send_ts_ms }.ser(&mut packet);

        if let Err(e) = self.pipeline.send_to_peer(&packet).await {
            debug!("cannot acknowledge packet #{}: {}", seq, e);
        }
    }

    pub async fn on_packet(&self, seq: SeqNo, send_ts_ms: u32, payload: &[u8]) {
        // ACK immediately and unconditionally - out-of-order and duplicate arrivals must
        //  keep the sender's RTT/RTO pipeline live too
        self.send_ack(seq, send_ts_ms).await;

        let t_budget = Self::gap_budget_ms(&self.config, &self.rtt).await;
        let now = self.clock.now_ms();
        let mut inner = self.inner.write().await;

        // a pending skip may have come due before this arrival is considered
        inner.skip_if_overdue(now, t_budget).await;

        let expected = match inner.expected_seq {
            None => {
                // first packet ever: adopt its sequence number as the starting point
                debug!("adopting #{} as the initial expected sequence number", seq);
                inner.deliver(seq, send_ts_ms, payload, now).await;
                inner.drain_in_order(now).await;
                inner.refresh_gap_timer(now, t_budget);
                return;
            }
            Some(expected) => expected,
        };

        if seq == expected {
            inner.deliver(seq, send_ts_ms, payload, now).await;
            inner.drain_in_order(now).await;
            inner.refresh_gap_timer(now, t_budget);
        }
        else if expected.precedes(seq) {
            if !inner.buffer.contains_key(&seq)
                && expected.in_window(seq, self.config.reorder_window_size)
            {
                trace!("buffering out-of-order packet #{} while waiting for #{}", seq, expected);
                inner.record_observation(TransportEventKind::Buffer, seq, send_ts_ms, payload.len(), now);
                inner.buffer.insert(seq, BufferedPacket {
                    payload: Bytes::copy_from_slice(payload),
                    send_ts_ms,
                    arrival_ms: now,
                });
                if inner.gap_deadline_ms.is_none() {
                    inner.gap_start_ms = Some(now);
                    inner.gap_deadline_ms = Some(now + t_budget);
                }
            }
            else {
                // already buffered, or too far ahead for the reorder window
                trace!("dropping packet #{}: duplicate or outside the reorder window", seq);
                inner.record_observation(TransportEventKind::Dup, seq, send_ts_ms, payload.len(), now);
            }
        }
        else {
            // at or behind the cursor: already delivered (possibly a retransmitted copy
            //  arriving after the original was processed)
            trace!("dropping packet #{}: behind the delivery cursor at #{}", seq, expected);
            inner.record_observation(TransportEventKind::Dup, seq, send_ts_ms, payload.len(), now);
        }
    }

    /// Periodic re-check of the skip rule, bounding worst-case skip latency when traffic
    ///  is sparse (arrivals trigger the same check).
    pub fn spawn_gap_loop(&self) {
        let mut guard = self.gap_handle.lock().expect("gap handle mutex poisoned");
        if guard.is_some() {
            warn!("gap loop already spawned");
            return;
        }

        self.running.store(true, Ordering::Relaxed);

        let config = self.config.clone();
        let clock = self.clock.clone();
        let rtt = self.rtt.clone();
        let inner = self.inner.clone();
        let running = self.running.clone();

        *guard = Some(tokio::spawn(async move {
            let mut tick = interval(config.gap_tick);
            loop {
                tick.tick().await;
                if !running.load(Ordering::Relaxed) {
                    break;
                }

                let t_budget = Self::gap_budget_ms(&config, &rtt).await;
                let now = clock.now_ms();
                inner.write().await.skip_if_overdue(now, t_budget).await;
            }
        }));
    }

    /// Idempotent, safe to call without a prior [`spawn_gap_loop`](Self::spawn_gap_loop).
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        let handle = self.gap_handle.lock().expect("gap handle mutex poisoned").take();
        if let Some(handle) = handle {
            handle.abort();
            handle.await.ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::test_support::RecordingEventSink;
    use crate::message_dispatcher::MockMessageDispatcher;
    use crate::send_pipeline::MockSendSocket;
    use mockall::Sequence;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time;

    fn paused_rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap()
    }

    struct Fixture {
        channel: ReliableReceiveChannel,
        event_sink: Arc<RecordingEventSink>,
    }

    /// receiver with a static 200ms gap budget, an ACK-swallowing socket and scripted
    ///  delivery expectations
    fn fixture(dispatcher: MockMessageDispatcher) -> Fixture {
        let mut config = HudpConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        config.gap_timing = GapTimingMode::Static { t_static_ms: 200 };
        let config = Arc::new(config);

        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet().return_const(());

        let clock = Arc::new(WallClock::fixed_epoch(0));
        let rtt = Arc::new(RwLock::new(RttEstimator::new()));
        let pipeline = Arc::new(SendPipeline::new(Arc::new(send_socket), Some(SocketAddr::from(([127, 0, 0, 1], 9)))));
        let event_sink = Arc::new(RecordingEventSink::new());

        let channel = ReliableReceiveChannel::new(
            config,
            clock,
            rtt,
            pipeline,
            Arc::new(dispatcher),
            event_sink.clone(),
        );
        Fixture { channel, event_sink }
    }

    fn expect_deliveries(dispatcher: &mut MockMessageDispatcher, payloads: Vec<Vec<u8>>) {
        let mut delivery_order = Sequence::new();
        for payload in payloads {
            dispatcher.expect_on_reliable_message()
                .withf(move |p| p == payload.as_slice())
                .once()
                .in_sequence(&mut delivery_order)
                .return_const(());
        }
    }

    async fn expected_seq(fixture: &Fixture) -> Option<SeqNo> {
        fixture.channel.inner.read().await.expected_seq
    }

    #[test]
    fn test_in_order_stream_delivers_without_buffering() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut dispatcher = MockMessageDispatcher::new();
            expect_deliveries(&mut dispatcher, vec![b"p0".to_vec(), b"p1".to_vec(), b"p2".to_vec()]);

            let fixture = fixture(dispatcher);
            for (seq, payload) in [(0u16, b"p0"), (1, b"p1"), (2, b"p2")] {
                fixture.channel.on_packet(SeqNo::from_raw(seq), 0, payload).await;
            }

            assert_eq!(expected_seq(&fixture).await, Some(SeqNo::from_raw(3)));
            assert_eq!(fixture.event_sink.kinds(), vec![
                TransportEventKind::Deliver,
                TransportEventKind::Deliver,
                TransportEventKind::Deliver,
            ]);
        });
    }

    #[test]
    fn test_first_packet_adopted_as_cursor() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut dispatcher = MockMessageDispatcher::new();
            expect_deliveries(&mut dispatcher, vec![b"hello".to_vec()]);

            let fixture = fixture(dispatcher);
            fixture.channel.on_packet(SeqNo::from_raw(4711), 0, b"hello").await;

            assert_eq!(expected_seq(&fixture).await, Some(SeqNo::from_raw(4712)));
        });
    }

    #[test]
    fn test_every_arrival_is_acked_including_duplicates() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut config = HudpConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
            config.gap_timing = GapTimingMode::Static { t_static_ms: 200 };

            let mut send_socket = MockSendSocket::new();
            // three arrivals (one a duplicate) -> three ACKs echoing the copy's timestamp
            for (seq, echo_ts) in [(0u16, 77u32), (1, 78), (0, 99)] {
                send_socket.expect_do_send_packet()
                    .withf(move |_to, buf| {
                        let mut b: &[u8] = buf;
                        let header = PacketHeader::deser(&mut b).unwrap();
                        let ack = AckPayload::deser(&mut b).unwrap();
                        header.channel_type() == Some(ChannelType::Ack)
                            && header.seq == SeqNo::from_raw(seq)
                            && ack.echo_send_ts_ms == echo_ts
                    })
                    .once()
                    .return_const(());
            }

            let mut dispatcher = MockMessageDispatcher::new();
            dispatcher.expect_on_reliable_message().times(2).return_const(());

            let channel = ReliableReceiveChannel::new(
                Arc::new(config),
                Arc::new(WallClock::fixed_epoch(0)),
                Arc::new(RwLock::new(RttEstimator::new())),
                Arc::new(SendPipeline::new(Arc::new(send_socket), Some(SocketAddr::from(([127, 0, 0, 1], 9))))),
                Arc::new(dispatcher),
                Arc::new(RecordingEventSink::new()),
            );

            channel.on_packet(SeqNo::from_raw(0), 77, b"a").await;
            channel.on_packet(SeqNo::from_raw(1), 78, b"b").await;
            channel.on_packet(SeqNo::from_raw(0), 99, b"a").await; // retransmitted copy
        });
    }

    #[test]
    fn test_reorder_and_drain() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut dispatcher = MockMessageDispatcher::new();
            expect_deliveries(&mut dispatcher, vec![
                b"p0".to_vec(), b"p1".to_vec(), b"p2".to_vec(), b"p3".to_vec(),
            ]);

            let fixture = fixture(dispatcher);
            for (seq, payload) in [(0u16, b"p0"), (2, b"p2"), (1, b"p1"), (3, b"p3")] {
                fixture.channel.on_packet(SeqNo::from_raw(seq), 0, payload).await;
            }

            assert_eq!(expected_seq(&fixture).await, Some(SeqNo::from_raw(4)));
            assert_eq!(fixture.event_sink.kinds(), vec![
                TransportEventKind::Deliver, // 0
                TransportEventKind::Buffer,  // 2
                TransportEventKind::Deliver, // 1
                TransportEventKind::Deliver, // 2 drained
                TransportEventKind::Deliver, // 3
            ]);

            // buffer fully drained, gap timer cleared
            let inner = fixture.channel.inner.read().await;
            assert!(inner.buffer.is_empty());
            assert_eq!(inner.gap_deadline_ms, None);
        });
    }

    #[test]
    fn test_duplicate_behind_cursor_dropped() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut dispatcher = MockMessageDispatcher::new();
            expect_deliveries(&mut dispatcher, vec![b"p0".to_vec(), b"p1".to_vec(), b"p2".to_vec()]);

            let fixture = fixture(dispatcher);
            fixture.channel.on_packet(SeqNo::from_raw(0), 0, b"p0").await;
            fixture.channel.on_packet(SeqNo::from_raw(1), 0, b"p1").await;
            // retransmitted copy of 1 arriving after the original was processed
            fixture.channel.on_packet(SeqNo::from_raw(1), 5, b"p1").await;
            fixture.channel.on_packet(SeqNo::from_raw(2), 0, b"p2").await;

            assert_eq!(expected_seq(&fixture).await, Some(SeqNo::from_raw(3)));
            assert_eq!(fixture.event_sink.kinds(), vec![
                TransportEventKind::Deliver,
                TransportEventKind::Deliver,
                TransportEventKind::Dup,
                TransportEventKind::Deliver,
            ]);
        });
    }

    #[test]
    fn test_duplicate_of_buffered_packet_dropped() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut dispatcher = MockMessageDispatcher::new();
            expect_deliveries(&mut dispatcher, vec![b"p0".to_vec()]);

            let fixture = fixture(dispatcher);
            fixture.channel.on_packet(SeqNo::from_raw(0), 0, b"p0").await;
            fixture.channel.on_packet(SeqNo::from_raw(2), 0, b"p2").await;
            fixture.channel.on_packet(SeqNo::from_raw(2), 9, b"p2").await; // retransmitted copy

            assert_eq!(fixture.event_sink.kinds(), vec![
                TransportEventKind::Deliver,
                TransportEventKind::Buffer,
                TransportEventKind::Dup,
            ]);
            assert_eq!(fixture.channel.inner.read().await.buffer.len(), 1);
        });
    }

    #[test]
    fn test_arrival_outside_window_dropped() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut dispatcher = MockMessageDispatcher::new();
            expect_deliveries(&mut dispatcher, vec![b"p0".to_vec()]);

            let fixture = fixture(dispatcher);
            fixture.channel.on_packet(SeqNo::from_raw(0), 0, b"p0").await;
            // expected is 1; 1 + 1024 is the window edge, 1026 is past it
            fixture.channel.on_packet(SeqNo::from_raw(1026), 0, b"far").await;

            assert_eq!(fixture.event_sink.kinds(), vec![
                TransportEventKind::Deliver,
                TransportEventKind::Dup,
            ]);
            assert!(fixture.channel.inner.read().await.buffer.is_empty());
        });
    }

    #[test]
    fn test_skip_after_t_on_gap_tick() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut dispatcher = MockMessageDispatcher::new();
            expect_deliveries(&mut dispatcher, vec![b"p5".to_vec(), b"p7".to_vec()]);

            let fixture = fixture(dispatcher);
            fixture.channel.spawn_gap_loop();

            fixture.channel.on_packet(SeqNo::from_raw(5), 0, b"p5").await;
            fixture.channel.on_packet(SeqNo::from_raw(7), 0, b"p7").await; // gap at 6

            assert_eq!(expected_seq(&fixture).await, Some(SeqNo::from_raw(6)));

            // 6 never arrives; after the 200ms static budget the tick loop skips it
            time::sleep(Duration::from_millis(220)).await;

            assert_eq!(expected_seq(&fixture).await, Some(SeqNo::from_raw(8)));
            assert_eq!(fixture.event_sink.kinds(), vec![
                TransportEventKind::Deliver, // 5
                TransportEventKind::Buffer,  // 7
                TransportEventKind::Skip,    // 6
                TransportEventKind::Deliver, // 7
            ]);

            let inner = fixture.channel.inner.read().await;
            assert!(inner.buffer.is_empty());
            assert_eq!(inner.gap_deadline_ms, None);

            drop(inner);
            fixture.channel.stop().await;
        });
    }

    #[test]
    fn test_skip_triggered_by_arrival_without_gap_loop() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut dispatcher = MockMessageDispatcher::new();
            expect_deliveries(&mut dispatcher, vec![b"p0".to_vec(), b"p2".to_vec(), b"p3".to_vec()]);

            let fixture = fixture(dispatcher);

            fixture.channel.on_packet(SeqNo::from_raw(0), 0, b"p0").await;
            fixture.channel.on_packet(SeqNo::from_raw(2), 0, b"p2").await; // gap at 1

            time::advance(Duration::from_millis(250)).await;

            // the next arrival finds the gap overdue: 1 is skipped before 3 is considered,
            //  draining 2, then 3 is delivered in order
            fixture.channel.on_packet(SeqNo::from_raw(3), 0, b"p3").await;

            assert_eq!(expected_seq(&fixture).await, Some(SeqNo::from_raw(4)));
            assert_eq!(fixture.event_sink.kinds(), vec![
                TransportEventKind::Deliver, // 0
                TransportEventKind::Buffer,  // 2
                TransportEventKind::Skip,    // 1
                TransportEventKind::Deliver, // 2
                TransportEventKind::Deliver, // 3
            ]);
        });
    }

    #[test]
    fn test_multi_packet_gap_skips_one_budget_at_a_time() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut dispatcher = MockMessageDispatcher::new();
            expect_deliveries(&mut dispatcher, vec![b"p0".to_vec(), b"p3".to_vec()]);

            let fixture = fixture(dispatcher);
            fixture.channel.spawn_gap_loop();

            fixture.channel.on_packet(SeqNo::from_raw(0), 0, b"p0").await;
            fixture.channel.on_packet(SeqNo::from_raw(3), 0, b"p3").await; // gaps at 1 and 2

            // first budget expires: skip 1, gap at 2 remains, timer restarts
            time::sleep(Duration::from_millis(220)).await;
            assert_eq!(expected_seq(&fixture).await, Some(SeqNo::from_raw(2)));
            assert!(fixture.channel.inner.read().await.gap_deadline_ms.is_some());

            // second budget expires: skip 2, drain 3
            time::sleep(Duration::from_millis(220)).await;
            assert_eq!(expected_seq(&fixture).await, Some(SeqNo::from_raw(4)));
            assert_eq!(fixture.channel.inner.read().await.gap_deadline_ms, None);

            fixture.channel.stop().await;
        });
    }

    #[test]
    fn test_gap_timer_not_restarted_by_further_buffering() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut dispatcher = MockMessageDispatcher::new();
            expect_deliveries(&mut dispatcher, vec![b"p0".to_vec()]);

            let fixture = fixture(dispatcher);

            fixture.channel.on_packet(SeqNo::from_raw(0), 0, b"p0").await;
            fixture.channel.on_packet(SeqNo::from_raw(2), 0, b"p2").await;
            let deadline_after_first = fixture.channel.inner.read().await.gap_deadline_ms;

            time::advance(Duration::from_millis(50)).await;
            fixture.channel.on_packet(SeqNo::from_raw(3), 0, b"p3").await;

            // the gap is still the same gap; buffering more packets must not push the
            //  deadline out
            assert_eq!(fixture.channel.inner.read().await.gap_deadline_ms, deadline_after_first);
        });
    }

    #[test]
    fn test_wraparound_reorder() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut dispatcher = MockMessageDispatcher::new();
            expect_deliveries(&mut dispatcher, vec![
                b"p65535".to_vec(), b"p0".to_vec(), b"p1".to_vec(),
            ]);

            let fixture = fixture(dispatcher);
            fixture.channel.on_packet(SeqNo::from_raw(65535), 0, b"p65535").await;
            fixture.channel.on_packet(SeqNo::from_raw(1), 0, b"p1").await; // ahead across the wrap
            fixture.channel.on_packet(SeqNo::from_raw(0), 0, b"p0").await;

            assert_eq!(expected_seq(&fixture).await, Some(SeqNo::from_raw(2)));
        });
    }

    #[test]
    fn test_stop_is_idempotent_and_safe_without_start() {
        let rt = paused_rt();
        rt.block_on(async {
            let fixture = fixture(MockMessageDispatcher::new());
            fixture.channel.stop().await;

            fixture.channel.spawn_gap_loop();
            fixture.channel.stop().await;
            fixture.channel.stop().await;
        });
    }
}
