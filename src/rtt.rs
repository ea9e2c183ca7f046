use tracing::trace;

use crate::config::AdaptiveTimingConfig;

pub const RTO_MIN_MS: u64 = 120;
pub const RTO_MAX_MS: u64 = 600;
/// RTO used before the first valid sample arrives
pub const RTO_DEFAULT_MS: u64 = 200;

/// Samples above this are considered clock anomalies or stale echoes and are discarded
///  rather than allowed to corrupt the estimate.
pub const MAX_SAMPLE_MS: u64 = 10_000;

const SRTT_GAIN: f64 = 0.125;
const RTTVAR_GAIN: f64 = 0.25;

#[derive(Copy, Clone, Debug, PartialEq)]
struct RttEstimate {
    srtt: f64,
    rttvar: f64,
}

/// Smoothed round-trip-time estimator with two derived timers.
///
/// This is per-peer state: it is owned by one endpoint's sender/dispatcher pairing and
///  updated only from ACK processing - never shared across peer sessions.
///
/// The two derived windows are intentionally independent:
/// * [`rto_ms`](RttEstimator::rto_ms) paces retransmission of a packet that is still worth
///   delivering
/// * [`adaptive_t_ms`](RttEstimator::adaptive_t_ms) is the outer bound past which resending
///   is pointless because the data is stale for the application; the same budget drives the
///   receiver's decision to stop waiting on a sequence gap
#[derive(Default)]
pub struct RttEstimator {
    estimate: Option<RttEstimate>,
}

impl RttEstimator {
    pub fn new() -> RttEstimator {
        RttEstimator { estimate: None }
    }

    pub fn srtt_ms(&self) -> Option<f64> {
        self.estimate.map(|e| e.srtt)
    }

    pub fn rttvar_ms(&self) -> Option<f64> {
        self.estimate.map(|e| e.rttvar)
    }

    /// Feed one RTT sample. The first valid sample initializes the estimate; subsequent
    ///  samples are smoothed in exponentially. Samples outside the sanity bound are
    ///  ignored.
    pub fn update(&mut self, sample_ms: u64) {
        if sample_ms > MAX_SAMPLE_MS {
            trace!("discarding implausible RTT sample of {}ms", sample_ms);
            return;
        }
        let sample = sample_ms as f64;

        match &mut self.estimate {
            None => {
                self.estimate = Some(RttEstimate {
                    srtt: sample,
                    rttvar: sample / 2.0,
                });
            }
            Some(estimate) => {
                estimate.srtt += SRTT_GAIN * (sample - estimate.srtt);
                estimate.rttvar = (1.0 - RTTVAR_GAIN) * estimate.rttvar
                    + RTTVAR_GAIN * (sample - estimate.srtt).abs();
            }
        }
    }

    /// Retransmission timeout: `srtt + 4*rttvar`, clamped to `[120, 600]` ms.
    pub fn rto_ms(&self) -> u64 {
        match self.estimate {
            None => RTO_DEFAULT_MS,
            Some(estimate) => {
                (estimate.srtt + 4.0 * estimate.rttvar)
                    .clamp(RTO_MIN_MS as f64, RTO_MAX_MS as f64) as u64
            }
        }
    }

    /// Adaptive expiry / gap budget: `srtt + k*rttvar + urgency`, clamped to
    ///  `[t_min, t_max]`. The urgency hint is capped before it enters the formula. Before
    ///  the first sample, conservative cold-start values stand in for the estimate.
    pub fn adaptive_t_ms(&self, urgency_ms: u64, config: &AdaptiveTimingConfig) -> u64 {
        let (srtt, rttvar) = match self.estimate {
            Some(estimate) => (estimate.srtt, estimate.rttvar),
            None => (config.cold_start_srtt_ms, config.cold_start_rttvar_ms),
        };
        let urgency = urgency_ms.min(config.max_urgency_ms) as f64;

        (srtt + config.k_rttvar * rttvar + urgency)
            .clamp(config.t_min_ms as f64, config.t_max_ms as f64) as u64
    }
}
