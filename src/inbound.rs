use std::cmp::max;
use std::sync::Arc;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::chunker::Reassembler;
use crate::config::RmpConfig;
use crate::datagram::DatagramSender;
use crate::error::ReassemblyError;
use crate::message_id::MessageId;
use crate::packet::{encode_ack, encode_nack, AckPacket, DataPacket, PacketHeader};
use crate::peer_id::PeerId;
use crate::registry::{TransferState, TransferStatus};
use crate::safe_converter::PrecheckedCast;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InboundState {
    Receiving,
    /// the message was handed to the application, waiting for FIN
    Delivered,
    Abandoned,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InboundTimerOutcome {
    Continue,
    Release,
}


struct InboundTransferInner {
    config: Arc<RmpConfig>,
    /// header for ACK and NACK packets, i.e. addressed to the message's sender
    reply_header: PacketHeader,
    datagram_sender: Arc<dyn DatagramSender>,

    reassembler: Reassembler,
    /// all chunks up to and including this index were received. Never decreases.
    highest_consecutive: Option<u32>,
    highest_seen: u32,
    last_nacked: FxHashMap<u32, Instant>,

    state: InboundState,
    last_activity: Instant,
    delivered_at: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}
impl InboundTransferInner {
    fn window_start(&self) -> u32 {
        self.highest_consecutive
            .map(|h| h + 1)
            .unwrap_or(0)
    }

    fn total_chunks(&self) -> u32 {
        self.reassembler.total_chunks()
    }

    fn has_gaps(&self) -> bool {
        self.window_start() < self.highest_seen
    }

    fn ack_bitmap(&self) -> u64 {
        let window_start = self.window_start();
        let mut bitmap = 0u64;
        for bit in 0..AckPacket::WINDOW_LEN {
            let index = window_start.saturating_add(bit);
            if index >= self.total_chunks() {
                break;
            }
            if self.reassembler.contains(index) {
                bitmap |= 1 << bit;
            }
        }
        bitmap
    }

    fn advance_highest_consecutive(&mut self) {
        let mut next = self.window_start();
        while next < self.total_chunks() && self.reassembler.contains(next) {
            next += 1;
        }
        if next > 0 {
            self.highest_consecutive = Some(next - 1);
        }
    }

    async fn send_ack(&self) {
        // NB: total chunks are limited to 0xFFFF, so the highest index is 0xFFFE and does not
        //      collide with the 'nothing received' marker
        let highest_consecutive = self.highest_consecutive
            .map(|h| h.prechecked_cast());
        let ack = encode_ack(&self.reply_header, highest_consecutive, self.ack_bitmap());
        self.datagram_sender.send_datagram(&ack).await;
    }

    /// Missing chunks below the highest chunk seen so far. Chunks that were NACKed within the
    ///  NACK interval are left out to give the retransmission time to arrive.
    async fn send_nack(&mut self) {
        let now = Instant::now();
        let mut missing = Vec::new();
        for index in self.window_start()..self.highest_seen {
            if missing.len() >= self.config.max_nack_entries {
                break;
            }
            if self.reassembler.contains(index) {
                continue;
            }
            if let Some(&last) = self.last_nacked.get(&index) {
                if now.duration_since(last) < self.config.nack_interval {
                    continue;
                }
            }
            missing.push(index);
        }

        if missing.is_empty() {
            return;
        }
        for &index in &missing {
            self.last_nacked.insert(index, now);
        }

        debug!("sending NACK for message {:?} to {:?}: missing chunks {:?}", self.reply_header.message_id, self.reply_header.receiver, missing);
        let nack = encode_nack(&self.reply_header, &missing);
        self.datagram_sender.send_datagram(&nack).await;
    }

    fn check_total_chunks(&self, total_chunks: u32) -> Result<(), ReassemblyError> {
        if total_chunks != self.total_chunks() {
            return Err(ReassemblyError::TotalChunksMismatch { expected: self.total_chunks(), actual: total_chunks });
        }
        Ok(())
    }
}


/// The receiver's side of a single message transfer. Every new chunk is acknowledged right
///  away with the cumulative ACK point and the 64 bit selective window after it. Gaps are
///  reported through NACKs, immediately when a chunk arrives too far ahead of the cumulative
///  ACK point and periodically on the transfer's timer.
pub struct InboundTransfer {
    message_id: MessageId,
    sender: PeerId,
    total_chunks: u32,
    inner: RwLock<InboundTransferInner>,
}

impl InboundTransfer {
    /// `header` is the header of the first DATA packet, i.e. as sent by the message's sender
    pub fn new(
        config: Arc<RmpConfig>,
        header: &PacketHeader,
        total_chunks: u32,
        datagram_sender: Arc<dyn DatagramSender>,
    ) -> InboundTransfer {
        let inner = InboundTransferInner {
            reply_header: header.reversed(),
            datagram_sender,
            reassembler: Reassembler::new(total_chunks, config.max_chunk_size),
            highest_consecutive: None,
            highest_seen: 0,
            last_nacked: FxHashMap::default(),
            state: InboundState::Receiving,
            last_activity: Instant::now(),
            delivered_at: None,
            timer: None,
            config,
        };

        InboundTransfer {
            message_id: header.message_id,
            sender: header.sender,
            total_chunks,
            inner: RwLock::new(inner),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    /// Stores a chunk and acknowledges it. Returns the complete message when this chunk was the
    ///  last missing one; this happens at most once per transfer.
    pub async fn on_chunk(&self, packet: &DataPacket) -> Option<Bytes> {
        let mut inner = self.inner.write().await;

        let state = inner.state;
        match state {
            InboundState::Receiving => {}
            InboundState::Delivered => {
                trace!("chunk #{} for already delivered message {:?} - re-sending final ACK", packet.chunk_index, self.message_id);
                inner.send_ack().await;
                return None;
            }
            InboundState::Abandoned => {
                return None;
            }
        }

        if !packet.is_intact() {
            debug!("dropping corrupted chunk #{} of message {:?}", packet.chunk_index, self.message_id);
            return None;
        }

        let inserted = inner.check_total_chunks(packet.total_chunks)
            .and_then(|_| inner.reassembler.insert(packet.chunk_index, &packet.payload));
        match inserted {
            Ok(true) => {}
            Ok(false) => {
                trace!("duplicate chunk #{} of message {:?}", packet.chunk_index, self.message_id);
                inner.send_ack().await;
                return None;
            }
            Err(e) => {
                debug!("dropping chunk of message {:?} from {:?}: {}", self.message_id, self.sender, e);
                return None;
            }
        }

        inner.last_activity = Instant::now();
        inner.highest_seen = max(inner.highest_seen, packet.chunk_index);
        inner.advance_highest_consecutive();

        if inner.reassembler.is_complete() {
            let message = inner.reassembler.take_message();
            inner.state = InboundState::Delivered;
            inner.delivered_at = Some(Instant::now());
            inner.last_nacked.clear();
            debug!("received all {} chunks of message {:?} from {:?}", self.total_chunks, self.message_id, self.sender);
            inner.send_ack().await;
            return message;
        }

        inner.send_ack().await;

        let nack_threshold = inner.window_start().saturating_add(inner.config.nack_slack);
        if packet.chunk_index > nack_threshold {
            inner.send_nack().await;
        }
        None
    }

    /// Driven periodically (every NACK interval) by the transfer's timer task
    pub async fn on_timer(&self) -> InboundTimerOutcome {
        let mut inner = self.inner.write().await;
        let now = Instant::now();

        let state = inner.state;
        let outcome = match state {
            InboundState::Receiving => {
                if now.duration_since(inner.last_activity) >= inner.config.inbound_idle_timeout {
                    warn!("abandoning inbound message {:?} from {:?}: no new chunks for {:?}, {} of {} chunks received",
                        self.message_id, self.sender, inner.config.inbound_idle_timeout, inner.reassembler.num_received(), self.total_chunks);
                    inner.state = InboundState::Abandoned;
                    InboundTimerOutcome::Release
                }
                else {
                    if inner.has_gaps() {
                        inner.send_nack().await;
                    }
                    InboundTimerOutcome::Continue
                }
            }
            InboundState::Delivered => {
                let grace_period = inner.config.delivered_grace_period;
                match inner.delivered_at {
                    Some(delivered_at) if now.duration_since(delivered_at) < grace_period => InboundTimerOutcome::Continue,
                    _ => {
                        debug!("no FIN for delivered message {:?} from {:?} within the grace period", self.message_id, self.sender);
                        InboundTimerOutcome::Release
                    }
                }
            }
            InboundState::Abandoned => InboundTimerOutcome::Release,
        };

        if outcome == InboundTimerOutcome::Release {
            // NB: this is called from the timer task itself, so we detach rather than abort it
            inner.timer = None;
        }
        outcome
    }

    /// The sender finished (or gave up on) the transfer. Returns the state the transfer was in.
    pub async fn on_fin(&self) -> InboundState {
        let mut inner = self.inner.write().await;
        let previous = inner.state;
        if previous == InboundState::Receiving {
            debug!("FIN for incomplete message {:?} from {:?} - abandoning", self.message_id, self.sender);
            inner.state = InboundState::Abandoned;
        }
        if let Some(handle) = inner.timer.take() {
            handle.abort();
        }
        previous
    }

    pub async fn set_timer(&self, handle: JoinHandle<()>) {
        let mut inner = self.inner.write().await;
        if let Some(previous) = inner.timer.replace(handle) {
            previous.abort();
        }
    }

    pub async fn cancel_timer(&self) {
        if let Some(handle) = self.inner.write().await.timer.take() {
            handle.abort();
        }
    }

    pub async fn state(&self) -> InboundState {
        self.inner.read().await.state
    }

    pub async fn highest_consecutive(&self) -> Option<u32> {
        self.inner.read().await.highest_consecutive
    }

    pub async fn status(&self) -> TransferStatus {
        let inner = self.inner.read().await;
        TransferStatus {
            message_id: self.message_id,
            total_chunks: self.total_chunks,
            completed_chunks: inner.reassembler.num_received(),
            state: TransferState::Inbound(inner.state),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use crate::chunker::ChunkSplitter;
    use crate::datagram::MockDatagramSender;
    use crate::packet::{checksum, decode, Packet};
    use crate::peer_id::PeerId;

    const CHUNK_SIZE: usize = 10;

    fn header() -> PacketHeader {
        PacketHeader::new(
            PeerId::try_from("alice").unwrap(),
            PeerId::try_from("bob").unwrap(),
            MessageId(99),
        )
    }

    fn test_config() -> RmpConfig {
        RmpConfig {
            max_chunk_size: CHUNK_SIZE,
            ..RmpConfig::default()
        }
    }

    fn message(num_chunks: u32) -> Bytes {
        (0..num_chunks as usize * CHUNK_SIZE - 4).map(|i| i as u8).collect::<Vec<_>>().into()
    }

    fn chunk(num_chunks: u32, index: u32) -> DataPacket {
        let payload = ChunkSplitter::split(message(num_chunks), CHUNK_SIZE).chunk(index).unwrap();
        DataPacket {
            header: header(),
            chunk_index: index,
            total_chunks: num_chunks,
            crc32: checksum(&payload),
            payload,
        }
    }

    #[derive(Debug, Clone, Eq, PartialEq)]
    enum Reply {
        Ack(Option<u16>, u64),
        Nack(Vec<u32>),
    }

    fn recording_sender() -> (Arc<dyn DatagramSender>, Arc<Mutex<Vec<Reply>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent2 = sent.clone();

        let mut sender = MockDatagramSender::new();
        sender.expect_send_datagram()
            .returning(move |datagram| {
                let reply = match decode(datagram).unwrap() {
                    Packet::Ack(ack) => {
                        assert_eq!(ack.header, header().reversed());
                        Reply::Ack(ack.highest_consecutive, ack.bitmap)
                    }
                    Packet::Nack(nack) => {
                        assert_eq!(nack.header, header().reversed());
                        Reply::Nack(nack.missing)
                    }
                    other => panic!("unexpected packet from the receiver: {:?}", other),
                };
                sent2.lock().unwrap().push(reply);
            });
        (Arc::new(sender), sent)
    }

    fn take_sent(sent: &Mutex<Vec<Reply>>) -> Vec<Reply> {
        std::mem::take(&mut *sent.lock().unwrap())
    }

    fn new_transfer(config: RmpConfig, num_chunks: u32) -> (InboundTransfer, Arc<Mutex<Vec<Reply>>>) {
        let (sender, sent) = recording_sender();
        let transfer = InboundTransfer::new(Arc::new(config), &header(), num_chunks, sender);
        (transfer, sent)
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap()
    }

    #[test]
    fn test_in_order() {
        paused_runtime().block_on(async {
            let (transfer, sent) = new_transfer(test_config(), 3);

            assert_eq!(transfer.on_chunk(&chunk(3, 0)).await, None);
            assert_eq!(transfer.on_chunk(&chunk(3, 1)).await, None);
            assert_eq!(transfer.on_chunk(&chunk(3, 2)).await, Some(message(3)));

            assert_eq!(take_sent(&sent), vec![
                Reply::Ack(Some(0), 0),
                Reply::Ack(Some(1), 0),
                Reply::Ack(Some(2), 0),
            ]);
            assert_eq!(transfer.state().await, InboundState::Delivered);
            assert_eq!(transfer.status().await.completed_chunks, 3);
        });
    }

    #[rstest]
    #[case::reversed(vec![3, 2, 1, 0], vec![Reply::Ack(None, 0b1000), Reply::Nack(vec![0, 1, 2]), Reply::Ack(None, 0b1100), Reply::Ack(None, 0b1110), Reply::Ack(Some(3), 0)])]
    #[case::gap_filled(vec![0, 2, 3, 1], vec![Reply::Ack(Some(0), 0), Reply::Ack(Some(0), 0b10), Reply::Ack(Some(0), 0b110), Reply::Ack(Some(3), 0)])]
    fn test_out_of_order(#[case] order: Vec<u32>, #[case] expected_replies: Vec<Reply>) {
        paused_runtime().block_on(async {
            let (transfer, sent) = new_transfer(test_config(), 4);

            let mut delivered = Vec::new();
            for index in order {
                delivered.extend(transfer.on_chunk(&chunk(4, index)).await);
            }
            assert_eq!(delivered, vec![message(4)]);
            assert_eq!(take_sent(&sent), expected_replies);
        });
    }

    #[test]
    fn test_duplicate_chunk() {
        paused_runtime().block_on(async {
            let (transfer, sent) = new_transfer(test_config(), 3);

            transfer.on_chunk(&chunk(3, 0)).await;
            transfer.on_chunk(&chunk(3, 2)).await;
            assert_eq!(transfer.highest_consecutive().await, Some(0));
            take_sent(&sent);

            assert_eq!(transfer.on_chunk(&chunk(3, 0)).await, None);
            assert_eq!(transfer.on_chunk(&chunk(3, 2)).await, None);
            assert_eq!(transfer.highest_consecutive().await, Some(0));
            assert_eq!(transfer.status().await.completed_chunks, 2);
            assert_eq!(take_sent(&sent), vec![Reply::Ack(Some(0), 0b10), Reply::Ack(Some(0), 0b10)]);

            assert_eq!(transfer.on_chunk(&chunk(3, 1)).await, Some(message(3)));
            take_sent(&sent);

            // chunks after delivery are acknowledged, but never delivered again
            assert_eq!(transfer.on_chunk(&chunk(3, 1)).await, None);
            assert_eq!(transfer.on_chunk(&chunk(3, 2)).await, None);
            assert_eq!(take_sent(&sent), vec![Reply::Ack(Some(2), 0), Reply::Ack(Some(2), 0)]);
        });
    }

    #[rstest]
    #[case::corrupt(|p: &mut DataPacket| p.crc32 ^= 1)]
    #[case::total_mismatch(|p: &mut DataPacket| p.total_chunks = 4)]
    #[case::index_out_of_range(|p: &mut DataPacket| p.chunk_index = 3)]
    #[case::short_chunk(|p: &mut DataPacket| { p.payload = p.payload.slice(1..); p.crc32 = checksum(&p.payload); })]
    fn test_invalid_chunk_is_dropped(#[case] tweak: fn(&mut DataPacket)) {
        paused_runtime().block_on(async {
            let (transfer, sent) = new_transfer(test_config(), 3);

            let mut packet = chunk(3, 0);
            tweak(&mut packet);
            assert_eq!(transfer.on_chunk(&packet).await, None);

            assert!(take_sent(&sent).is_empty());
            assert_eq!(transfer.highest_consecutive().await, None);
            assert_eq!(transfer.status().await.completed_chunks, 0);
            assert_eq!(transfer.state().await, InboundState::Receiving);
        });
    }

    #[test]
    fn test_immediate_nack_beyond_slack() {
        paused_runtime().block_on(async {
            let (transfer, sent) = new_transfer(RmpConfig { nack_slack: 0, ..test_config() }, 8);

            for index in 0..5 {
                transfer.on_chunk(&chunk(8, index)).await;
            }
            take_sent(&sent);

            transfer.on_chunk(&chunk(8, 6)).await;
            assert_eq!(take_sent(&sent), vec![Reply::Ack(Some(4), 0b10), Reply::Nack(vec![5])]);

            // chunk 5 was NACKed just now
            transfer.on_chunk(&chunk(8, 7)).await;
            assert_eq!(take_sent(&sent), vec![Reply::Ack(Some(4), 0b110)]);

            assert_eq!(transfer.on_chunk(&chunk(8, 5)).await, Some(message(8)));
            assert_eq!(take_sent(&sent), vec![Reply::Ack(Some(7), 0)]);
        });
    }

    #[test]
    fn test_small_gap_waits_for_timer() {
        paused_runtime().block_on(async {
            let (transfer, sent) = new_transfer(test_config(), 8);

            for index in [0, 1, 2, 3, 4, 6, 7] {
                transfer.on_chunk(&chunk(8, index)).await;
            }
            assert!(take_sent(&sent).iter().all(|r| matches!(r, Reply::Ack(..))));

            assert_eq!(transfer.on_timer().await, InboundTimerOutcome::Continue);
            assert_eq!(take_sent(&sent), vec![Reply::Nack(vec![5])]);

            // rate limited per chunk
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(transfer.on_timer().await, InboundTimerOutcome::Continue);
            assert!(take_sent(&sent).is_empty());

            tokio::time::sleep(Duration::from_millis(150)).await;
            assert_eq!(transfer.on_timer().await, InboundTimerOutcome::Continue);
            assert_eq!(take_sent(&sent), vec![Reply::Nack(vec![5])]);
        });
    }

    #[test]
    fn test_nack_is_capped() {
        paused_runtime().block_on(async {
            let (transfer, sent) = new_transfer(RmpConfig { max_nack_entries: 3, ..test_config() }, 20);

            transfer.on_chunk(&chunk(20, 10)).await;
            assert_eq!(take_sent(&sent), vec![Reply::Ack(None, 1 << 10), Reply::Nack(vec![0, 1, 2])]);

            transfer.on_chunk(&chunk(20, 11)).await;
            assert_eq!(take_sent(&sent), vec![Reply::Ack(None, 0b11 << 10), Reply::Nack(vec![3, 4, 5])]);
        });
    }

    #[test]
    fn test_idle_timeout() {
        paused_runtime().block_on(async {
            let (transfer, sent) = new_transfer(test_config(), 3);
            transfer.on_chunk(&chunk(3, 1)).await;
            take_sent(&sent);

            tokio::time::sleep(Duration::from_secs(29)).await;
            assert_eq!(transfer.on_timer().await, InboundTimerOutcome::Continue);
            assert_eq!(take_sent(&sent), vec![Reply::Nack(vec![0])]);

            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(transfer.on_timer().await, InboundTimerOutcome::Release);
            assert_eq!(transfer.state().await, InboundState::Abandoned);
            assert!(take_sent(&sent).is_empty());

            assert_eq!(transfer.on_chunk(&chunk(3, 0)).await, None);
            assert!(take_sent(&sent).is_empty());
        });
    }

    #[test]
    fn test_grace_period_after_delivery() {
        paused_runtime().block_on(async {
            let (transfer, _sent) = new_transfer(test_config(), 1);
            assert!(transfer.on_chunk(&chunk(1, 0)).await.is_some());

            tokio::time::sleep(Duration::from_millis(4999)).await;
            assert_eq!(transfer.on_timer().await, InboundTimerOutcome::Continue);
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert_eq!(transfer.on_timer().await, InboundTimerOutcome::Release);
        });
    }

    #[rstest]
    #[case::receiving(false, InboundState::Receiving, InboundState::Abandoned)]
    #[case::delivered(true, InboundState::Delivered, InboundState::Delivered)]
    fn test_on_fin(#[case] complete: bool, #[case] expected_previous: InboundState, #[case] expected_after: InboundState) {
        paused_runtime().block_on(async {
            let (transfer, _sent) = new_transfer(test_config(), 2);
            transfer.on_chunk(&chunk(2, 0)).await;
            if complete {
                transfer.on_chunk(&chunk(2, 1)).await;
            }

            assert_eq!(transfer.on_fin().await, expected_previous);
            assert_eq!(transfer.state().await, expected_after);
        });
    }
}
