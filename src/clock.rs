use std::time::SystemTime;

use tokio::time::Instant;

/// Per-endpoint millisecond wall clock.
///
/// The epoch offset is sampled once at construction and all subsequent readings are driven
///  by the tokio time source, which keeps every timestamp in one endpoint on a single
///  monotonic timeline (and makes timing fully controllable in paused-time tests).
///
/// Wire timestamps are the low 32 bits of this clock; RTT samples are taken with
///  wrap-around-safe subtraction over that 32-bit space. Only differences of one
///  endpoint's own timestamps are ever computed, so clock skew between peers is
///  irrelevant.
pub struct WallClock {
    epoch_base_ms: u64,
    origin: Instant,
}

impl WallClock {
    pub fn new() -> anyhow::Result<WallClock> {
        let epoch_base_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis() as u64;

        Ok(WallClock {
            epoch_base_ms,
            origin: Instant::now(),
        })
    }

    /// A clock with a fixed, well-known epoch base so tests can predict wire timestamps.
    #[cfg(test)]
    pub fn fixed_epoch(epoch_base_ms: u64) -> WallClock {
        WallClock {
            epoch_base_ms,
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch_base_ms + self.origin.elapsed().as_millis() as u64
    }

    /// The current time truncated to the 32-bit wire timestamp space.
    pub fn wire_timestamp(&self) -> u32 {
        (self.now_ms() & 0xffff_ffff) as u32
    }

    /// RTT sample for an echoed send timestamp: `(now - echo) mod 2^32`. Correct across
    ///  wrap of the 32-bit timestamp space; the caller is responsible for rejecting
    ///  samples outside the sanity bound.
    pub fn rtt_sample_ms(&self, echo_send_ts_ms: u32) -> u64 {
        self.wire_timestamp().wrapping_sub(echo_send_ts_ms) as u64
    }
}
