use std::collections::hash_map::Entry;
use std::sync::{Arc, Weak};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};
use crate::config::RmpConfig;
use crate::datagram::DatagramSender;
use crate::delivery::DeliveryHandler;
use crate::error::{DeliveryError, SubmitError};
use crate::inbound::{InboundState, InboundTimerOutcome, InboundTransfer};
use crate::message_id::MessageId;
use crate::outbound::{AckOutcome, OutboundState, OutboundTransfer, TimerOutcome};
use crate::packet::{encode_ack, AckPacket, DataPacket, FinPacket, NackPacket, PacketHeader};
use crate::peer_id::PeerId;
use crate::safe_converter::PrecheckedCast;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferState {
    Outbound(OutboundState),
    Inbound(InboundState),
}

/// A snapshot of a transfer's progress. `completed_chunks` counts acknowledged chunks for
///  outbound transfers and received chunks for inbound transfers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferStatus {
    pub message_id: MessageId,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub state: TransferState,
}


/// Keeps track of all active transfers of a connection, by message id, and owns their
///  lifecycle: transfers are created on submission or on the first chunk of an unknown message,
///  and removed when they complete, are abandoned or cancelled.
///
/// Each transfer has its own timer task. Timer tasks hold only a weak reference to the registry,
///  and they are aborted when their transfer is removed.
///
/// NB: Code in this module never acquires a map lock while holding a transfer's lock
pub struct TransferRegistry {
    self_id: PeerId,
    peer_id: PeerId,
    config: Arc<RmpConfig>,
    datagram_sender: Arc<dyn DatagramSender>,
    delivery_handler: Arc<dyn DeliveryHandler>,

    outbound: RwLock<FxHashMap<MessageId, Arc<OutboundTransfer>>>,
    inbound: RwLock<FxHashMap<MessageId, Arc<InboundTransfer>>>,
    /// ids of delivered inbound messages, with the time of delivery
    tombstones: RwLock<FxHashMap<MessageId, Instant>>,
}

impl TransferRegistry {
    pub fn new(
        self_id: PeerId,
        peer_id: PeerId,
        config: Arc<RmpConfig>,
        datagram_sender: Arc<dyn DatagramSender>,
        delivery_handler: Arc<dyn DeliveryHandler>,
    ) -> TransferRegistry {
        TransferRegistry {
            self_id,
            peer_id,
            config,
            datagram_sender,
            delivery_handler,
            outbound: Default::default(),
            inbound: Default::default(),
            tombstones: Default::default(),
        }
    }

    pub async fn submit(self: &Arc<Self>, payload: Bytes) -> Result<MessageId, SubmitError> {
        if payload.is_empty() {
            return Err(SubmitError::EmptyMessage);
        }
        if payload.len() > self.config.max_message_size {
            return Err(SubmitError::PayloadTooLarge { len: payload.len(), max: self.config.max_message_size });
        }

        let transfer = {
            let mut outbound = self.outbound.write().await;
            let message_id = loop {
                let candidate = MessageId::random();
                if !outbound.contains_key(&candidate) {
                    break candidate;
                }
            };

            let header = PacketHeader::new(self.self_id, self.peer_id, message_id);
            let transfer = Arc::new(OutboundTransfer::new(self.config.clone(), header, payload, self.datagram_sender.clone()));
            outbound.insert(message_id, transfer.clone());
            transfer
        };

        transfer.start().await;
        self.spawn_retransmit_timer(&transfer).await;
        Ok(transfer.message_id())
    }

    async fn spawn_retransmit_timer(self: &Arc<Self>, transfer: &Arc<OutboundTransfer>) {
        let registry = Arc::downgrade(self);
        let timer_transfer = transfer.clone();

        let handle = tokio::spawn(async move {
            while let Some(deadline) = timer_transfer.retransmit_deadline().await {
                tokio::time::sleep_until(deadline).await;

                match timer_transfer.on_retransmit_timer().await {
                    TimerOutcome::Rearmed => {}
                    TimerOutcome::Finished => break,
                    TimerOutcome::Abandoned { retries } => {
                        if let Some(registry) = registry.upgrade() {
                            registry.finish_outbound(timer_transfer.message_id(), Err(DeliveryError::RetryLimitExceeded { retries })).await;
                        }
                        break;
                    }
                }
            }
        });
        transfer.set_timer(handle).await;
    }

    async fn finish_outbound(&self, message_id: MessageId, result: Result<(), DeliveryError>) {
        let Some(transfer) = self.outbound.write().await.remove(&message_id) else {
            return;
        };
        transfer.cancel_timer().await;

        match result {
            Ok(()) => {
                debug!("message {:?} was delivered to {:?}", message_id, self.peer_id);
                self.delivery_handler.on_delivery_confirmed(message_id);
            }
            Err(e) => {
                debug!("delivery of message {:?} to {:?} failed: {}", message_id, self.peer_id, e);
                self.delivery_handler.on_delivery_failed(message_id, e);
            }
        }
    }

    async fn get_outbound(&self, message_id: MessageId) -> Option<Arc<OutboundTransfer>> {
        self.outbound.read().await
            .get(&message_id)
            .cloned()
    }

    pub async fn on_ack(&self, ack: AckPacket) {
        let message_id = ack.header.message_id;
        let Some(transfer) = self.get_outbound(message_id).await else {
            trace!("ACK for unknown message {:?} - ignoring", message_id);
            return;
        };

        if transfer.on_ack(&ack).await == AckOutcome::Completed {
            self.finish_outbound(message_id, Ok(())).await;
        }
    }

    pub async fn on_nack(&self, nack: NackPacket) {
        let message_id = nack.header.message_id;
        match self.get_outbound(message_id).await {
            Some(transfer) => transfer.on_nack(&nack).await,
            None => trace!("NACK for unknown message {:?} - ignoring", message_id),
        }
    }

    /// Returns false if there is no active outbound transfer with this id
    pub async fn cancel(&self, message_id: MessageId) -> bool {
        let Some(transfer) = self.get_outbound(message_id).await else {
            return false;
        };
        if !transfer.cancel().await {
            return false;
        }
        self.finish_outbound(message_id, Err(DeliveryError::Cancelled)).await;
        true
    }

    pub async fn on_data(self: &Arc<Self>, packet: DataPacket) {
        let message_id = packet.header.message_id;

        if self.is_tombstoned(message_id).await {
            trace!("chunk #{} for delivered message {:?} - sending final ACK", packet.chunk_index, message_id);
            let final_ack = encode_ack(&packet.header.reversed(), Some(packet.total_chunks.saturating_sub(1).prechecked_cast()), 0);
            self.datagram_sender.send_datagram(&final_ack).await;
            return;
        }

        let existing = self.inbound.read().await
            .get(&message_id)
            .cloned();
        let transfer = match existing {
            Some(transfer) => transfer,
            None => match self.create_inbound(&packet).await {
                Some(transfer) => transfer,
                None => return,
            }
        };

        if let Some(message) = transfer.on_chunk(&packet).await {
            self.tombstones.write().await
                .insert(message_id, Instant::now());
            debug!("delivering message {:?} from {:?}: {} bytes", message_id, transfer.sender(), message.len());
            self.delivery_handler.on_delivered(transfer.sender(), message);
        }
    }

    async fn create_inbound(self: &Arc<Self>, packet: &DataPacket) -> Option<Arc<InboundTransfer>> {
        let message_id = packet.header.message_id;

        // the reassembly buffer is allocated for the announced size, so we check that before
        //  trusting it
        let max_total_chunks = self.config.max_total_chunks();
        if packet.total_chunks > max_total_chunks {
            debug!("message {:?} from {:?} announces {} chunks, exceeding the maximum of {} - dropping chunk", message_id, packet.header.sender, packet.total_chunks, max_total_chunks);
            return None;
        }
        if packet.chunk_index >= packet.total_chunks {
            debug!("chunk #{} of message {:?} is out of range for {} chunks - dropping", packet.chunk_index, message_id, packet.total_chunks);
            return None;
        }

        let transfer = Arc::new(InboundTransfer::new(self.config.clone(), &packet.header, packet.total_chunks, self.datagram_sender.clone()));
        self.spawn_inbound_timer(&transfer).await;

        match self.inbound.write().await.entry(message_id) {
            Entry::Occupied(e) => {
                // created concurrently
                transfer.cancel_timer().await;
                Some(e.get().clone())
            }
            Entry::Vacant(e) => {
                debug!("receiving new message {:?} from {:?}: {} chunks", message_id, packet.header.sender, packet.total_chunks);
                e.insert(transfer.clone());
                Some(transfer)
            }
        }
    }

    async fn spawn_inbound_timer(self: &Arc<Self>, transfer: &Arc<InboundTransfer>) {
        let registry = Arc::downgrade(self);
        let timer_transfer = transfer.clone();
        let nack_interval = self.config.nack_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(nack_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                if timer_transfer.on_timer().await == InboundTimerOutcome::Release {
                    Self::release_inbound(&registry, &timer_transfer).await;
                    break;
                }
            }
        });
        transfer.set_timer(handle).await;
    }

    async fn release_inbound(registry: &Weak<TransferRegistry>, transfer: &Arc<InboundTransfer>) {
        let Some(registry) = registry.upgrade() else {
            return;
        };

        {
            let mut inbound = registry.inbound.write().await;
            if let Some(registered) = inbound.get(&transfer.message_id()) {
                if Arc::ptr_eq(registered, transfer) {
                    inbound.remove(&transfer.message_id());
                    debug!("released inbound message {:?} from {:?}", transfer.message_id(), transfer.sender());
                }
            }
        }
        registry.purge_tombstones().await;
    }

    pub async fn on_fin(&self, fin: FinPacket) {
        let message_id = fin.header.message_id;
        let removed = self.inbound.write().await.remove(&message_id);

        match removed {
            Some(transfer) => {
                let previous = transfer.on_fin().await;
                debug!("FIN for message {:?} from {:?} in state {:?} - released", message_id, transfer.sender(), previous);
            }
            None => trace!("FIN for unknown message {:?} - ignoring", message_id),
        }
        self.purge_tombstones().await;
    }

    async fn is_tombstoned(&self, message_id: MessageId) -> bool {
        match self.tombstones.read().await.get(&message_id) {
            Some(delivered_at) => delivered_at.elapsed() < self.config.delivered_tombstone_ttl,
            None => false,
        }
    }

    async fn purge_tombstones(&self) {
        let ttl = self.config.delivered_tombstone_ttl;
        self.tombstones.write().await
            .retain(|_, delivered_at| delivered_at.elapsed() < ttl);
    }

    pub async fn outbound_in_flight(&self) -> Vec<TransferStatus> {
        let transfers = self.outbound.read().await
            .values()
            .cloned()
            .collect::<Vec<_>>();

        let mut result = Vec::with_capacity(transfers.len());
        for transfer in transfers {
            result.push(transfer.status().await);
        }
        result.sort_by_key(|s| s.message_id);
        result
    }

    pub async fn inbound_in_flight(&self) -> Vec<TransferStatus> {
        let transfers = self.inbound.read().await
            .values()
            .cloned()
            .collect::<Vec<_>>();

        let mut result = Vec::with_capacity(transfers.len());
        for transfer in transfers {
            result.push(transfer.status().await);
        }
        result.sort_by_key(|s| s.message_id);
        result
    }

    /// Stops all timers and forgets all transfers. Outbound transfers that were still active are
    ///  reported as cancelled.
    pub async fn shutdown(&self) {
        let outbound = std::mem::take(&mut *self.outbound.write().await);
        let inbound = std::mem::take(&mut *self.inbound.write().await);
        self.tombstones.write().await.clear();
        debug!("shutting down connection to {:?}: {} outbound and {} inbound transfers", self.peer_id, outbound.len(), inbound.len());

        for (message_id, transfer) in outbound {
            if transfer.cancel().await {
                self.delivery_handler.on_delivery_failed(message_id, DeliveryError::Cancelled);
            }
            transfer.cancel_timer().await;
        }
        for transfer in inbound.into_values() {
            transfer.cancel_timer().await;
        }
    }
}
