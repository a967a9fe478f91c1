use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace};

/// This is the abstraction for handing a finished packet to the underlying transport. The
///  protocol does not care how datagrams get to the peer, only that they arrive intact or not
///  at all, so this can be a connected UDP socket, a relay, or an in-memory link for testing.
///
/// Sending is best effort: implementations log failures rather than reporting them, and the
///  protocol's retransmission takes care of recovery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSender: Send + Sync + 'static {
    async fn send_datagram(&self, datagram: &[u8]);
}

#[async_trait]
impl DatagramSender for Arc<UdpSocket> {
    async fn send_datagram(&self, datagram: &[u8]) {
        trace!("UDP socket: sending {} bytes", datagram.len());

        if let Err(e) = self.send(datagram).await {
            error!("error sending UDP datagram: {}", e);
        }
    }
}

/// Binds a UDP socket and connects it to a single remote peer, which is what a
///  [crate::PeerConnection] talks to.
pub async fn connect_udp(local_addr: SocketAddr, peer_addr: SocketAddr) -> anyhow::Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(local_addr).await?;
    socket.connect(peer_addr).await?;
    debug!("bound UDP socket to {:?}, connected to {:?}", socket.local_addr()?, peer_addr);
    Ok(Arc::new(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[tokio::test]
    async fn test_udp_send() {
        let localhost = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let receiver = UdpSocket::bind(localhost).await.unwrap();
        let sender = connect_udp(localhost, receiver.local_addr().unwrap()).await.unwrap();

        sender.send_datagram(b"hello").await;

        let mut buf = [0u8; 16];
        let (len, from) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, sender.local_addr().unwrap());
    }
}
