use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::seq::SeqNo;

/// Application-side delivery sink, one callback per logical channel.
///
/// Callbacks are invoked synchronously from the endpoint's receive context and must not
///  block or do unbounded work: the same context carries ACK processing for the peer, and
///  stalling it delays RTT feedback.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    /// an in-sequence payload delivered by the reliable channel
    async fn on_reliable_message(&self, payload: &[u8]);

    /// a fire-and-forget payload from the unreliable channel
    async fn on_unreliable_message(&self, payload: &[u8]);

    /// an ACK arrived for the given sequence number, with the RTT sample it yielded
    async fn on_ack(&self, seq: SeqNo, rtt_ms: u64);
}
