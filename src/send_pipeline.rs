use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{error, trace};

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet to {:?}", to);

        //NB: send errors are swallowed on purpose - a reliable packet stays in flight and
        //     is picked up again by the next retransmission sweep
        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// The outbound half of an endpoint: one socket, one (optional) peer address.
///
/// All outbound traffic of an endpoint - application payloads, retransmissions and ACKs -
///  goes to the single configured peer. Sending without a peer is a caller error and fails
///  fast; the peer may also be learned lazily by the receive loop from the first inbound
///  datagram.
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    peer: RwLock<Option<SocketAddr>>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, peer: Option<SocketAddr>) -> SendPipeline {
        SendPipeline {
            socket,
            peer: RwLock::new(peer),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub async fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.read().await
    }

    pub async fn set_peer(&self, peer: SocketAddr) {
        *self.peer.write().await = Some(peer);
    }

    pub async fn send_to_peer(&self, packet_buf: &[u8]) -> anyhow::Result<()> {
        let peer = match self.peer_addr().await {
            Some(peer) => peer,
            None => bail!("peer not set - call set_peer() before sending"),
        };

        self.socket.do_send_packet(peer, packet_buf).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn test_send_without_peer_fails_fast() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet().never();

        let pipeline = SendPipeline::new(Arc::new(send_socket), None);
        assert!(pipeline.send_to_peer(&[1, 2, 3]).await.is_err());
    }

    #[tokio::test]
    async fn test_send_to_configured_peer() {
        let peer = SocketAddr::from(([127, 0, 0, 1], 9));

        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet()
            .once()
            .with(eq(peer), eq(vec![1u8, 2, 3]))
            .return_const(());

        let pipeline = SendPipeline::new(Arc::new(send_socket), Some(peer));
        pipeline.send_to_peer(&[1, 2, 3]).await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_learned_after_construction() {
        let peer = SocketAddr::from(([127, 0, 0, 1], 9));

        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet()
            .once()
            .with(eq(peer), eq(vec![7u8]))
            .return_const(());

        let pipeline = SendPipeline::new(Arc::new(send_socket), None);
        assert_eq!(pipeline.peer_addr().await, None);

        pipeline.set_peer(peer).await;
        assert_eq!(pipeline.peer_addr().await, Some(peer));
        pipeline.send_to_peer(&[7]).await.unwrap();
    }
}
