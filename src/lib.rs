//! H-UDP is a hybrid transport protocol layered over a single UDP socket. It provides two
//!  logical delivery channels - a selective-repeat *reliable* channel with adaptive
//!  retransmission and expiry, and a best-effort *unreliable* channel - multiplexed by a
//!  one-byte channel tag in a fixed binary header.
//!
//! ## Design goals
//!
//! * Partial reliability for latency-sensitive applications (e.g. real-time state sync):
//!   some messages must arrive and be ordered, others are fine to drop
//!   * reliable messages are retransmitted, but never past a deadline that tracks current
//!     network conditions - stale data is worse than missing data for this kind of
//!     application
//!   * the unreliable channel is plain fire-and-forget with the same header framing
//! * One UDP socket, one active peer per endpoint instance
//!   * the channel tag multiplexes the two application channels plus the internal ACK
//!     channel over that socket
//! * Delivery on the reliable channel is in-order with a bounded reordering buffer
//!   * the receiver ACKs every reliable arrival immediately, so the sender's RTT pipeline
//!     keeps working even for out-of-order or duplicate arrivals
//!   * a missing sequence number is skipped once a buffered successor has waited longer
//!     than the adaptive budget ("skip-after-t") - there is no TCP-style unbounded wait
//! * Two independently tuned deadlines derived from live RTT statistics:
//!   * **RTO** paces retransmission of a still-useful packet
//!   * **adaptive-t** bounds how long a packet is worth retrying at all, and how long the
//!     receiver waits on a gap before skipping
//!
//! ## Header
//!
//! Packet header (inside a UDP datagram) - all numbers in network byte order (BE):
//! ```ascii
//! 0:  channel tag (u8):
//!     * 0  reliable
//!     * 1  unreliable
//!     * 2  ACK (internal control traffic for the reliable channel)
//! 1:  sequence number (u16): wrap-around, so 0 follows after FFFF.
//!      Allocated per reliable send; 0 and meaningless on the unreliable channel; carries
//!      the acknowledged sequence number on the ACK channel.
//! 3:  send timestamp (u32): milliseconds, wrap-around modulo 2^32
//! ```
//!
//! The header has a fixed size of 7 bytes; any datagram shorter than that is malformed and
//!  dropped. Payload bytes follow the header and are opaque to the transport.
//!
//! ## ACK packets
//!
//! An ACK's payload is exactly 4 bytes: the echoed send timestamp (u32 BE) of the packet
//!  copy being acknowledged. Retransmitted copies keep their sequence number but are
//!  re-stamped, so the echoed timestamp identifies the specific copy that triggered the
//!  ACK - an RTT sample taken after a retransmission is not ambiguous in the classic
//!  Karn's-algorithm sense.
//!
//! ## Related:
//! * TCP
//!   * full reliability and strict in-order delivery at the cost of head-of-line blocking
//!   * this protocol intentionally gives up on packets that have outlived their usefulness
//! * QUIC
//!   * connection based - initial handshake, enforced encryption
//!   * far richer streams; H-UDP is a single-peer datagram protocol with two channels
//! * RUDP-style datacenter transports
//!   * NAK-based acknowledgement and message chunking; H-UDP ACKs positively per packet
//!     and never fragments - one application payload is one datagram

pub mod clock;
pub mod config;
pub mod end_point;
pub mod event_log;
pub mod message_dispatcher;
pub mod packet_header;
pub mod receive_channel;
pub mod rtt;
pub mod send_channel;
pub mod send_pipeline;
pub mod seq;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
