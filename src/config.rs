use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

/// Parameters of the adaptive-t formula: `t = clamp(srtt + k*rttvar + urgency, [t_min, t_max])`.
#[derive(Clone, Debug, PartialEq)]
pub struct AdaptiveTimingConfig {
    /// weight of RTTVAR in the formula
    pub k_rttvar: f64,
    /// lower clamp for the derived budget
    pub t_min_ms: u64,
    /// upper clamp for the derived budget
    pub t_max_ms: u64,
    /// cap applied to the caller-supplied urgency hint before it enters the formula
    pub max_urgency_ms: u64,
    /// SRTT stand-in before the first valid sample
    pub cold_start_srtt_ms: f64,
    /// RTTVAR stand-in before the first valid sample
    pub cold_start_rttvar_ms: f64,
}

impl Default for AdaptiveTimingConfig {
    fn default() -> AdaptiveTimingConfig {
        AdaptiveTimingConfig {
            k_rttvar: 3.0,
            t_min_ms: 120,
            t_max_ms: 300,
            max_urgency_ms: 50,
            cold_start_srtt_ms: 200.0,
            cold_start_rttvar_ms: 100.0,
        }
    }
}

/// How the receiver's gap timer deadline is derived.
///
/// Both variants are deliberate: `Dynamic` shares the adaptive-t formula with the sender so
///  the skip budget tracks network conditions; `Static` pins it to a fixed constant for
///  deployments that want predictable skip latency regardless of RTT.
#[derive(Clone, Debug, PartialEq)]
pub enum GapTimingMode {
    /// gap deadline = now + adaptive-t (live RTT statistics)
    Dynamic,
    /// gap deadline = now + the fixed budget
    Static { t_static_ms: u64 },
}

impl GapTimingMode {
    pub const DEFAULT_T_STATIC_MS: u64 = 200;
}

pub struct HudpConfig {
    /// local address to bind the UDP socket to
    pub self_addr: SocketAddr,

    /// maximum datagram size accepted by the receive loop; larger datagrams are truncated
    ///  by the OS, so this should comfortably exceed the largest expected payload plus
    ///  header
    pub max_recv_size: usize,

    /// number of entries the reorder buffer may hold ahead of the next expected sequence
    ///  number; arrivals further ahead than this are dropped
    pub reorder_window_size: u16,

    /// interval of the sender's retransmission/expiry sweep
    pub retransmit_tick: Duration,

    /// interval of the receiver's gap re-check; bounds worst-case skip latency when
    ///  traffic is sparse (arrivals also trigger the check)
    pub gap_tick: Duration,

    /// upper bound on one blocking socket read, so the receive loop observes a stop
    ///  request promptly
    pub receive_poll_timeout: Duration,

    pub timing: AdaptiveTimingConfig,
    pub gap_timing: GapTimingMode,
}

impl HudpConfig {
    pub fn new(self_addr: SocketAddr) -> HudpConfig {
        HudpConfig {
            self_addr,
            max_recv_size: 4096,
            reorder_window_size: 1024,
            retransmit_tick: Duration::from_millis(10),
            gap_tick: Duration::from_millis(10),
            receive_poll_timeout: Duration::from_millis(200),
            timing: AdaptiveTimingConfig::default(),
            gap_timing: GapTimingMode::Dynamic,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_recv_size < crate::packet_header::PacketHeader::SERIALIZED_LEN {
            bail!("receive buffer is smaller than the wire header");
        }
        if self.reorder_window_size == 0 {
            bail!("reorder window must hold at least one packet");
        }
        if self.timing.t_min_ms > self.timing.t_max_ms {
            bail!("adaptive-t clamp range is empty: t_min {} > t_max {}", self.timing.t_min_ms, self.timing.t_max_ms);
        }
        if self.retransmit_tick.is_zero() || self.gap_tick.is_zero() {
            bail!("timer tick intervals must be non-zero");
        }
        if self.receive_poll_timeout.is_zero() {
            bail!("receive poll timeout must be non-zero");
        }
        if let GapTimingMode::Static { t_static_ms: 0 } = self.gap_timing {
            bail!("static gap budget must be non-zero");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn base_config() -> HudpConfig {
        HudpConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[rstest]
    #[case::tiny_recv_buffer(|c: &mut HudpConfig| c.max_recv_size = 6)]
    #[case::zero_window(|c: &mut HudpConfig| c.reorder_window_size = 0)]
    #[case::empty_t_range(|c: &mut HudpConfig| { c.timing.t_min_ms = 400; c.timing.t_max_ms = 300; })]
    #[case::zero_retransmit_tick(|c: &mut HudpConfig| c.retransmit_tick = Duration::ZERO)]
    #[case::zero_gap_tick(|c: &mut HudpConfig| c.gap_tick = Duration::ZERO)]
    #[case::zero_poll_timeout(|c: &mut HudpConfig| c.receive_poll_timeout = Duration::ZERO)]
    #[case::zero_static_budget(|c: &mut HudpConfig| c.gap_timing = GapTimingMode::Static { t_static_ms: 0 })]
    fn test_validate_rejects(#[case] break_config: fn(&mut HudpConfig)) {
        let mut config = base_config();
        break_config(&mut config);
        assert!(config.validate().is_err());
    }
}
