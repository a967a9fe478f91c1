use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use crate::error::DeliveryError;
use crate::message_id::MessageId;
use crate::peer_id::PeerId;

/// The application's side of a connection. Callbacks are invoked from the protocol's tasks, so
///  implementations should return quickly, e.g. by forwarding to a channel.
#[cfg_attr(test, automock)]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// A complete inbound message. Called exactly once per message, even if chunks are
    ///  retransmitted after delivery.
    fn on_delivered(&self, sender: &PeerId, payload: Bytes);

    /// The peer acknowledged every chunk of an outbound message
    fn on_delivery_confirmed(&self, message_id: MessageId);

    fn on_delivery_failed(&self, message_id: MessageId, error: DeliveryError);
}
