use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;
use crate::connection::PeerConnection;
use crate::datagram::DatagramSender;
use crate::packet::{decode, Packet};

/// What a [LossyLink] does with a single datagram
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fault {
    Deliver,
    Drop,
    Duplicate,
    /// DATA packets get a bit flipped in the payload, so they fail the checksum. Other packets
    ///  carry no checksum, so they are truncated instead, which makes them malformed.
    Corrupt,
    /// deliver after a delay, i.e. reordered with respect to subsequent datagrams
    Delay(Duration),
}

pub type FaultInjector = Box<dyn Fn(&Packet) -> Fault + Send + Sync>;

/// An in-memory, one-directional datagram channel with deterministic fault injection. The
///  datagrams it accepts are recorded for later inspection, regardless of what happens to them
///  afterwards.
///
/// Delivery to the receiving connection happens on a separate task (see [LossyLink::pump]),
///  never inline: a connection sends while holding a transfer's lock, and delivering inline
///  could make the peer's reply re-enter the sending connection.
pub struct LossyLink {
    tx: mpsc::UnboundedSender<Bytes>,
    fault_injector: FaultInjector,
    sent: Mutex<Vec<Packet>>,
}

impl LossyLink {
    pub fn new(fault_injector: FaultInjector) -> (Arc<LossyLink>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = LossyLink {
            tx,
            fault_injector,
            sent: Default::default(),
        };
        (Arc::new(link), rx)
    }

    pub fn reliable() -> (Arc<LossyLink>, mpsc::UnboundedReceiver<Bytes>) {
        Self::new(Box::new(|_| Fault::Deliver))
    }

    /// Feeds everything arriving on a link's receiving end into a connection
    pub fn pump(mut rx: mpsc::UnboundedReceiver<Bytes>, receiver: Arc<PeerConnection>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(datagram) = rx.recv().await {
                receiver.on_datagram_received(&datagram).await;
            }
        })
    }

    /// all packets passed to this link so far, including those that were dropped or corrupted
    pub fn sent_packets(&self) -> Vec<Packet> {
        self.sent.lock().unwrap().clone()
    }

    /// the chunk indices of all DATA packets passed to this link so far, in the order they were
    ///  sent
    pub fn sent_chunk_indices(&self) -> Vec<u32> {
        self.sent.lock().unwrap()
            .iter()
            .filter_map(|p| match p {
                Packet::Data(data) => Some(data.chunk_index),
                _ => None,
            })
            .collect()
    }

    fn forward(&self, datagram: Bytes) {
        // the receiving end was dropped if the test does not care about this direction
        let _ = self.tx.send(datagram);
    }
}

#[async_trait]
impl DatagramSender for LossyLink {
    async fn send_datagram(&self, datagram: &[u8]) {
        let packet = decode(datagram)
            .expect("connections should only send valid packets");
        let fault = (self.fault_injector)(&packet);
        trace!("link: {:?} for {:?}", fault, packet);
        self.sent.lock().unwrap().push(packet.clone());

        let datagram = Bytes::copy_from_slice(datagram);
        match fault {
            Fault::Deliver => self.forward(datagram),
            Fault::Drop => {}
            Fault::Duplicate => {
                self.forward(datagram.clone());
                self.forward(datagram);
            }
            Fault::Corrupt => {
                let mut corrupted = BytesMut::from(datagram.as_ref());
                if matches!(packet, Packet::Data(_)) {
                    let last = corrupted.len() - 1;
                    corrupted[last] ^= 0x01;
                }
                else {
                    corrupted.truncate(corrupted.len() - 1);
                }
                self.forward(corrupted.freeze());
            }
            Fault::Delay(delay) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(datagram);
                });
            }
        }
    }
}
