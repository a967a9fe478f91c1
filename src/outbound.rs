use std::cmp::min;
use std::sync::Arc;
use bit_set::BitSet;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use crate::backoff::RetransmitBackoff;
use crate::chunker::ChunkSplitter;
use crate::config::RmpConfig;
use crate::datagram::DatagramSender;
use crate::message_id::MessageId;
use crate::packet::{encode_data_chunk, encode_fin, AckPacket, NackPacket, PacketHeader};
use crate::registry::{TransferState, TransferStatus};
use crate::safe_converter::SafeCast;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutboundState {
    Sending,
    AwaitingAck,
    /// all chunks were acknowledged and FIN was sent
    Completing,
    Abandoned,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckOutcome {
    InProgress,
    Completed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerOutcome {
    Rearmed,
    Abandoned { retries: u32 },
    /// the transfer reached a terminal state, the timer has nothing more to do
    Finished,
}


struct OutboundTransferInner {
    config: Arc<RmpConfig>,
    header: PacketHeader,
    chunks: ChunkSplitter,
    datagram_sender: Arc<dyn DatagramSender>,

    acked: BitSet,
    num_acked: u32,
    /// lowest chunk index that is not acknowledged yet
    next_unacked: u32,
    last_retransmit: FxHashMap<u32, Instant>,

    state: OutboundState,
    /// consecutive retransmit timeouts without acknowledgement progress
    retries: u32,
    backoff: RetransmitBackoff,
    retransmit_deadline: Instant,
    retransmit_timer: Option<JoinHandle<()>>,
}
impl OutboundTransferInner {
    fn total_chunks(&self) -> u32 {
        self.chunks.total_chunks()
    }

    fn is_active(&self) -> bool {
        matches!(self.state, OutboundState::Sending | OutboundState::AwaitingAck)
    }

    fn is_acked(&self, index: u32) -> bool {
        self.acked.contains(index.safe_cast())
    }

    /// returns true if the chunk was not acknowledged before
    fn mark_acked(&mut self, index: u32) -> bool {
        if !self.acked.insert(index.safe_cast()) {
            return false;
        }
        self.num_acked += 1;
        self.last_retransmit.remove(&index);
        true
    }

    async fn send_chunk(&self, index: u32) {
        let Some(payload) = self.chunks.chunk(index) else {
            error!("attempting to send chunk #{} of message {:?} which has only {} chunks - this is a bug", index, self.header.message_id, self.total_chunks());
            return;
        };

        match encode_data_chunk(&self.header, index, self.total_chunks(), &payload) {
            Ok(packet) => self.datagram_sender.send_datagram(&packet).await,
            Err(e) => error!("error encoding chunk #{} of message {:?}: {}", index, self.header.message_id, e),
        }
    }

    async fn retransmit_chunk(&mut self, index: u32) {
        trace!("retransmitting chunk #{} of message {:?}", index, self.header.message_id);
        self.last_retransmit.insert(index, Instant::now());
        self.send_chunk(index).await;
    }

    fn rearm(&mut self) {
        self.retransmit_deadline = Instant::now() + self.backoff.current();
    }
}


/// The sender's side of a single message transfer.
///
/// All chunks are sent once when the transfer starts. After that, chunks are only sent again
///  when they are reported or implied to be missing:
/// * an ACK covering chunks beyond an unacknowledged chunk implies that the chunk was lost
/// * a NACK explicitly lists missing chunks
/// * when the retransmit timer expires without acknowledgement progress, all unacknowledged
///    chunks in the 64 chunk window after the cumulative ACK point are sent again
pub struct OutboundTransfer {
    message_id: MessageId,
    total_chunks: u32,
    inner: RwLock<OutboundTransferInner>,
}

impl OutboundTransfer {
    /// NB: the payload is assumed to be validated against the configuration, i.e. non-empty
    ///      and within the limits for the maximum number of chunks
    pub fn new(
        config: Arc<RmpConfig>,
        header: PacketHeader,
        payload: Bytes,
        datagram_sender: Arc<dyn DatagramSender>,
    ) -> OutboundTransfer {
        let chunks = ChunkSplitter::split(payload, config.max_chunk_size);
        let total_chunks = chunks.total_chunks();
        let backoff = RetransmitBackoff::new(&config);

        let inner = OutboundTransferInner {
            header: header.clone(),
            chunks,
            datagram_sender,
            acked: BitSet::with_capacity(total_chunks.safe_cast()),
            num_acked: 0,
            next_unacked: 0,
            last_retransmit: FxHashMap::default(),
            state: OutboundState::Sending,
            retries: 0,
            retransmit_deadline: Instant::now() + backoff.current(),
            backoff,
            retransmit_timer: None,
            config,
        };

        OutboundTransfer {
            message_id: header.message_id,
            total_chunks,
            inner: RwLock::new(inner),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Sends all chunks in index order and starts waiting for acknowledgements
    pub async fn start(&self) {
        let mut inner = self.inner.write().await;
        if inner.state != OutboundState::Sending {
            return;
        }
        debug!("sending message {:?} to {:?}: {} bytes in {} chunks", self.message_id, inner.header.receiver, inner.chunks.payload_len(), self.total_chunks);

        let mut chunks = inner.chunks.clone();
        chunks.restart();
        for chunk in chunks {
            inner.send_chunk(chunk.index).await;
        }

        inner.state = OutboundState::AwaitingAck;
        inner.rearm();
    }

    pub async fn on_ack(&self, ack: &AckPacket) -> AckOutcome {
        let mut inner = self.inner.write().await;
        trace!("received ACK for message {:?}: highest consecutive {:?}, bitmap {:064b}", self.message_id, ack.highest_consecutive, ack.bitmap);

        if !inner.is_active() {
            return AckOutcome::InProgress;
        }

        let total_chunks = self.total_chunks;
        let mut progress = false;
        if let Some(highest_consecutive) = ack.highest_consecutive {
            let upper: u32 = min(highest_consecutive.safe_cast(), total_chunks - 1);
            for index in inner.next_unacked..=upper {
                progress |= inner.mark_acked(index);
            }
        }
        for index in ack.selectively_acked() {
            if index < total_chunks {
                progress |= inner.mark_acked(index);
            }
        }
        while inner.next_unacked < total_chunks && inner.is_acked(inner.next_unacked) {
            inner.next_unacked += 1;
        }

        if inner.num_acked == total_chunks {
            debug!("all {} chunks of message {:?} were acknowledged - sending FIN", total_chunks, self.message_id);
            let fin = encode_fin(&inner.header);
            inner.datagram_sender.send_datagram(&fin).await;
            inner.state = OutboundState::Completing;
            return AckOutcome::Completed;
        }

        if progress {
            inner.retries = 0;
            inner.rearm();
        }

        // every unacknowledged chunk below the highest chunk covered by this ACK was either lost
        //  or is reordered. Since every received chunk triggers an ACK, the same gap is reported
        //  repeatedly, and we rate limit retransmissions per chunk.
        if let Some(highest_covered) = ack.highest_covered() {
            let now = Instant::now();
            let holdoff = inner.config.fast_retransmit_holdoff;
            let upper = min(highest_covered, total_chunks - 1);
            for index in inner.next_unacked..upper {
                if inner.is_acked(index) {
                    continue;
                }
                if let Some(&last) = inner.last_retransmit.get(&index) {
                    if now.duration_since(last) < holdoff {
                        continue;
                    }
                }
                inner.retransmit_chunk(index).await;
            }
        }

        AckOutcome::InProgress
    }

    pub async fn on_nack(&self, nack: &NackPacket) {
        let mut inner = self.inner.write().await;
        trace!("received NACK for message {:?} - resending chunks {:?}", self.message_id, nack.missing);

        if !inner.is_active() {
            return;
        }

        for &index in &nack.missing {
            if index >= self.total_chunks {
                debug!("NACK for message {:?} requested chunk #{} which is out of range", self.message_id, index);
                continue;
            }
            if inner.is_acked(index) {
                // the NACK may have overtaken a later ACK, or the NACK is simply stale
                continue;
            }
            inner.retransmit_chunk(index).await;
        }
    }

    /// Called by the timer task when the retransmit deadline is reached. The deadline may have
    ///  moved in the meantime, in which case this does nothing and the timer waits for the new
    ///  deadline.
    pub async fn on_retransmit_timer(&self) -> TimerOutcome {
        let mut inner = self.inner.write().await;
        if !inner.is_active() {
            return TimerOutcome::Finished;
        }
        if Instant::now() < inner.retransmit_deadline {
            return TimerOutcome::Rearmed;
        }

        if inner.retries >= inner.config.max_retries {
            warn!("abandoning message {:?} to {:?} after {} retransmissions without progress: {} of {} chunks acknowledged",
                self.message_id, inner.header.receiver, inner.retries, inner.num_acked, self.total_chunks);
            inner.state = OutboundState::Abandoned;
            // NB: this is called from the timer task itself, so we detach rather than abort it
            inner.retransmit_timer = None;
            return TimerOutcome::Abandoned { retries: inner.retries };
        }

        inner.retries += 1;
        let window_start = inner.next_unacked;
        let window_end = min(window_start.saturating_add(AckPacket::WINDOW_LEN), self.total_chunks);
        debug!("retransmit timeout #{} for message {:?} - resending unacknowledged chunks in [{}, {})", inner.retries, self.message_id, window_start, window_end);

        for index in window_start..window_end {
            if !inner.is_acked(index) {
                inner.retransmit_chunk(index).await;
            }
        }

        let interval = inner.backoff.back_off();
        inner.retransmit_deadline = Instant::now() + interval;
        TimerOutcome::Rearmed
    }

    /// `None` once the transfer reached a terminal state
    pub async fn retransmit_deadline(&self) -> Option<Instant> {
        let inner = self.inner.read().await;
        inner.is_active()
            .then_some(inner.retransmit_deadline)
    }

    pub async fn set_timer(&self, handle: JoinHandle<()>) {
        let mut inner = self.inner.write().await;
        if !inner.is_active() {
            handle.abort();
            return;
        }
        if let Some(previous) = inner.retransmit_timer.replace(handle) {
            previous.abort();
        }
    }

    pub async fn cancel_timer(&self) {
        if let Some(handle) = self.inner.write().await.retransmit_timer.take() {
            handle.abort();
        }
    }

    /// Abandons the transfer on the application's request. No FIN is sent: the peer will time
    ///  out its side of the transfer. Returns false if the transfer was already finished.
    pub async fn cancel(&self) -> bool {
        let mut inner = self.inner.write().await;
        if !inner.is_active() {
            return false;
        }
        debug!("cancelling message {:?} to {:?}", self.message_id, inner.header.receiver);
        inner.state = OutboundState::Abandoned;
        if let Some(handle) = inner.retransmit_timer.take() {
            handle.abort();
        }
        true
    }

    pub async fn state(&self) -> OutboundState {
        self.inner.read().await.state
    }

    pub async fn status(&self) -> TransferStatus {
        let inner = self.inner.read().await;
        TransferStatus {
            message_id: self.message_id,
            total_chunks: self.total_chunks,
            completed_chunks: inner.num_acked,
            state: TransferState::Outbound(inner.state),
        }
    }
}
