use std::sync::Arc;
use anyhow::bail;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use crate::config::RmpConfig;
use crate::datagram::DatagramSender;
use crate::delivery::DeliveryHandler;
use crate::error::SubmitError;
use crate::message_id::MessageId;
use crate::packet::{decode, Packet, PacketError, MAX_PACKET_LEN};
use crate::peer_id::PeerId;
use crate::registry::{TransferRegistry, TransferStatus};

/// Reliable message delivery between this peer and a single remote peer, on top of an
///  unreliable datagram channel.
///
/// Outgoing packets go to the [DatagramSender] passed in on construction. Incoming datagrams are
///  passed to [PeerConnection::on_datagram_received], either by the application's own receive
///  code or by [PeerConnection::recv_loop] for a connected UDP socket.
pub struct PeerConnection {
    self_id: PeerId,
    peer_id: PeerId,
    registry: Arc<TransferRegistry>,
}

impl PeerConnection {
    pub fn new(
        self_id: PeerId,
        peer_id: PeerId,
        config: RmpConfig,
        datagram_sender: Arc<dyn DatagramSender>,
        delivery_handler: Arc<dyn DeliveryHandler>,
    ) -> anyhow::Result<PeerConnection> {
        config.validate()?;
        if self_id == peer_id {
            bail!("a connection requires two different peers, got {:?} twice", self_id);
        }

        let registry = TransferRegistry::new(self_id, peer_id, Arc::new(config), datagram_sender, delivery_handler);
        Ok(PeerConnection {
            self_id,
            peer_id,
            registry: Arc::new(registry),
        })
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Starts transferring a message to the peer. This returns after all chunks were sent once;
    ///  the outcome is reported to the [DeliveryHandler] later.
    pub async fn submit(&self, payload: impl Into<Bytes>) -> Result<MessageId, SubmitError> {
        self.registry.submit(payload.into()).await
    }

    /// Abandons an outbound message. Returns false if there is no such message in flight.
    pub async fn cancel(&self, message_id: MessageId) -> bool {
        self.registry.cancel(message_id).await
    }

    /// NB: This function does not return a Result because invalid datagrams are expected on an
    ///      unreliable channel. They are logged and dropped.
    pub async fn on_datagram_received(&self, datagram: &[u8]) {
        let packet = match decode(datagram) {
            Ok(packet) => packet,
            Err(PacketError::ChecksumMismatch(data)) => {
                debug!("checksum mismatch for chunk #{} of message {:?} from {:?} - dropping", data.chunk_index, data.header.message_id, data.header.sender);
                return;
            }
            Err(e) => {
                debug!("dropping datagram of {} bytes: {}", datagram.len(), e);
                return;
            }
        };

        let header = packet.header();
        if header.sender != self.peer_id || header.receiver != self.self_id {
            debug!("received {:?} packet from {:?} to {:?} on connection {:?} -> {:?} - dropping", packet.kind(), header.sender, header.receiver, self.peer_id, self.self_id);
            return;
        }

        match packet {
            Packet::Data(data) => self.registry.on_data(data).await,
            Packet::Ack(ack) => self.registry.on_ack(ack).await,
            Packet::Nack(nack) => self.registry.on_nack(nack).await,
            Packet::Fin(fin) => self.registry.on_fin(fin).await,
        }
    }

    /// Receives from a UDP socket connected to the peer until the task is aborted
    pub async fn recv_loop(&self, socket: Arc<UdpSocket>) {
        info!("starting receive loop for {:?} -> {:?}", self.peer_id, self.self_id);

        // one spare byte, so that oversized datagrams are detected rather than truncated
        let mut buf = vec![0u8; MAX_PACKET_LEN + 1];
        loop {
            let num_read = match socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let span = span!(Level::TRACE, "datagram_received", peer = %self.peer_id, len = num_read);
            async {
                trace!("received datagram: {:?}", &buf[..num_read]);
                self.on_datagram_received(&buf[..num_read]).await;
            }.instrument(span).await;
        }
    }

    pub async fn outbound_in_flight(&self) -> Vec<TransferStatus> {
        self.registry.outbound_in_flight().await
    }

    pub async fn inbound_in_flight(&self) -> Vec<TransferStatus> {
        self.registry.inbound_in_flight().await
    }

    /// Cancels all timers and forgets all transfers. Outbound messages still in flight are
    ///  reported as cancelled.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
