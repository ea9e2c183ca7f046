use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use tracing::warn;

use crate::packet_header::ChannelType;
use crate::seq::SeqNo;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Direction {
    Tx,
    Rx,
}

impl Direction {
    pub fn label(&self) -> &'static str {
        match self {
            Direction::Tx => "TX",
            Direction::Rx => "RX",
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TransportEventKind {
    Send,
    Recv,
    Ack,
    Retransmit,
    Expire,
    Deliver,
    Buffer,
    Skip,
    Dup,
}

impl TransportEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            TransportEventKind::Send => "send",
            TransportEventKind::Recv => "recv",
            TransportEventKind::Ack => "ack",
            TransportEventKind::Retransmit => "retransmit",
            TransportEventKind::Expire => "expire",
            TransportEventKind::Deliver => "deliver",
            TransportEventKind::Buffer => "buffer",
            TransportEventKind::Skip => "skip",
            TransportEventKind::Dup => "dup",
        }
    }
}

/// One observable transport event. Fields that do not apply to a given event kind are
///  `None` and serialize as empty CSV cells.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportEvent {
    pub ts_ms: u64,
    pub direction: Direction,
    pub channel: ChannelType,
    pub seq: Option<SeqNo>,
    pub send_ts_ms: Option<u32>,
    pub rtt_ms: Option<u64>,
    pub retries: Option<u32>,
    pub kind: TransportEventKind,
    pub deadline_ms: Option<u64>,
    pub payload_len: usize,
}

/// Sink for transport events. The core only ever calls this - it is the observability
///  seam for log files, demo instrumentation and offline analysis tooling.
pub trait EventSink: Send + Sync + 'static {
    fn record(&self, event: TransportEvent);

    fn close(&self) {}
}

/// Sink for embedders that do not record transport events.
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn record(&self, _event: TransportEvent) {}
}

const CSV_HEADER: &str = "ts_recv_ms,dir,channel,seq,send_ts_ms,rtt_ms,retries,event,deadline_t_ms,len_bytes";

/// CSV file sink, one row per event, flushed per row so a crashed process still leaves a
///  usable log behind.
pub struct CsvEventSink {
    writer: Mutex<Option<BufWriter<File>>>,
}

impl CsvEventSink {
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<CsvEventSink> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent)
                    .with_context(|| format!("creating log directory for {:?}", path))?;
            }
        }

        let mut writer = BufWriter::new(
            File::create(path).with_context(|| format!("creating log file {:?}", path))?,
        );
        writeln!(writer, "{}", CSV_HEADER)?;
        writer.flush()?;

        Ok(CsvEventSink {
            writer: Mutex::new(Some(writer)),
        })
    }

    fn write_row(&self, event: &TransportEvent) -> std::io::Result<()> {
        fn cell<T: ToString>(value: &Option<T>) -> String {
            value.as_ref().map(T::to_string).unwrap_or_default()
        }

        let mut guard = self.writer.lock().expect("event log mutex poisoned");
        if let Some(writer) = guard.as_mut() {
            writeln!(
                writer,
                "{},{},{},{},{},{},{},{},{},{}",
                event.ts_ms,
                event.direction.label(),
                event.channel.label(),
                cell(&event.seq),
                cell(&event.send_ts_ms),
                cell(&event.rtt_ms),
                cell(&event.retries),
                event.kind.label(),
                cell(&event.deadline_ms),
                event.payload_len,
            )?;
            writer.flush()?;
        }
        Ok(())
    }
}

impl EventSink for CsvEventSink {
    fn record(&self, event: TransportEvent) {
        if let Err(e) = self.write_row(&event) {
            warn!("failed to write transport event log row: {}", e);
        }
    }

    fn close(&self) {
        let mut guard = self.writer.lock().expect("event log mutex poisoned");
        if let Some(mut writer) = guard.take() {
            if let Err(e) = writer.flush() {
                warn!("failed to flush transport event log on close: {}", e);
            }
        }
    }
}
