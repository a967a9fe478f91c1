use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::mpsc;
use crate::delivery::DeliveryHandler;
use crate::error::DeliveryError;
use crate::message_id::MessageId;
use crate::peer_id::PeerId;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeliveryEvent {
    Delivered { sender: PeerId, payload: Bytes },
    Confirmed(MessageId),
    Failed(MessageId, DeliveryError),
}

/// A [DeliveryHandler] that forwards all callbacks to a channel, in the order they happen
pub struct CollectingHandler {
    tx: mpsc::UnboundedSender<DeliveryEvent>,
}

impl CollectingHandler {
    pub fn new() -> (Arc<CollectingHandler>, DeliveryEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(CollectingHandler { tx }), DeliveryEvents { rx })
    }
}

impl DeliveryHandler for CollectingHandler {
    fn on_delivered(&self, sender: &PeerId, payload: Bytes) {
        let _ = self.tx.send(DeliveryEvent::Delivered { sender: *sender, payload });
    }

    fn on_delivery_confirmed(&self, message_id: MessageId) {
        let _ = self.tx.send(DeliveryEvent::Confirmed(message_id));
    }

    fn on_delivery_failed(&self, message_id: MessageId, error: DeliveryError) {
        let _ = self.tx.send(DeliveryEvent::Failed(message_id, error));
    }
}

pub struct DeliveryEvents {
    rx: mpsc::UnboundedReceiver<DeliveryEvent>,
}
impl DeliveryEvents {
    /// Waits for the next event, panicking if there is none within the timeout. With paused
    ///  time, the timeout elapses only after all timers that are due before it fired.
    pub async fn next(&mut self, timeout: Duration) -> DeliveryEvent {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => panic!("delivery handler was dropped"),
            Err(_) => panic!("no delivery event within {:?}", timeout),
        }
    }

    pub fn assert_no_event(&mut self) {
        if let Ok(event) = self.rx.try_recv() {
            panic!("unexpected delivery event {:?}", event);
        }
    }
}
