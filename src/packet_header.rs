use anyhow::anyhow;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::seq::SeqNo;

/// The logical channel a packet belongs to, encoded as the first header byte.
#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ChannelType {
    Reliable = 0,
    Unreliable = 1,
    Ack = 2,
}

impl ChannelType {
    pub fn label(&self) -> &'static str {
        match self {
            ChannelType::Reliable => "REL",
            ChannelType::Unreliable => "UNREL",
            ChannelType::Ack => "ACK",
        }
    }
}

/// The fixed 7-byte header prefixed to every datagram.
///
/// The channel tag is stored as a raw byte: packets are *created* from a [`ChannelType`]
///  (so an invalid tag cannot be sent), but deserialization surfaces whatever byte was on
///  the wire - filtering unknown tags is the dispatcher's job, not the codec's.
///
/// Sequence number and timestamp wrap around silently (mod 2^16 and mod 2^32); that is
///  part of the protocol, not an error condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub channel: u8,
    pub seq: SeqNo,
    pub send_ts_ms: u32,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u8>() + size_of::<u16>() + size_of::<u32>();

    pub fn new(channel: ChannelType, seq: SeqNo, send_ts_ms: u32) -> PacketHeader {
        PacketHeader {
            channel: channel.into(),
            seq,
            send_ts_ms,
        }
    }

    pub fn channel_type(&self) -> Option<ChannelType> {
        ChannelType::try_from(self.channel).ok()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.channel);
        buf.put_u16(self.seq.to_raw());
        buf.put_u32(self.send_ts_ms);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(anyhow!("datagram too short for H-UDP header"));
        }
        let channel = buf.try_get_u8()?;
        let seq = SeqNo::from_raw(buf.try_get_u16()?);
        let send_ts_ms = buf.try_get_u32()?;
        Ok(PacketHeader {
            channel,
            seq,
            send_ts_ms,
        })
    }
}

/// The payload of an ACK packet: the echoed send timestamp of the packet copy being
///  acknowledged. The acknowledged sequence number travels in the ACK's header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckPayload {
    pub echo_send_ts_ms: u32,
}

impl AckPayload {
    pub const SERIALIZED_LEN: usize = size_of::<u32>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.echo_send_ts_ms);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckPayload> {
        let echo_send_ts_ms = buf.try_get_u32()?;
        Ok(AckPayload { echo_send_ts_ms })
    }
}
