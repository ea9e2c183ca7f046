use std::fmt::{Display, Formatter};

/// A sequence number in the 16-bit wrap-around space of the reliable channel.
///
/// All ordering decisions on sequence numbers must go through [`SeqNo::precedes`] and
///  [`SeqNo::in_window`] - plain integer comparison is wrong as soon as the sequence space
///  wraps, which it does every 65536 packets.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SeqNo(u16);

impl Display for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SeqNo {
        SeqNo(self.0.wrapping_add(1))
    }

    /// True iff `self` comes before `other` in modulo-2^16 order, i.e. the forward distance
    ///  from `self` to `other` is less than half the sequence space. A sequence number does
    ///  not precede itself.
    pub fn precedes(&self, other: SeqNo) -> bool {
        *self != other && other.0.wrapping_sub(self.0) < 0x8000
    }

    /// Forward (wrap-around) distance from `self` to `to`.
    pub fn forward_distance(&self, to: SeqNo) -> u16 {
        to.0.wrapping_sub(self.0)
    }

    /// Is `candidate` within `(self, self + window]` ahead of `self` (mod 2^16)?
    pub fn in_window(&self, candidate: SeqNo, window: u16) -> bool {
        let d = self.forward_distance(candidate);
        0 < d && d <= window
    }
}
