use std::time::Duration;
use anyhow::bail;
use crate::backoff::RetransmitBackoff;
use crate::packet::{NackPacket, MAX_CHUNK_PAYLOAD, MAX_PACKET_LEN, MAX_TOTAL_CHUNKS};
use crate::safe_converter::SafeCast;

#[derive(Debug, Clone)]
pub struct RmpConfig {
    /// This is the payload size of a single chunk. It is a protocol-level agreement: the receiver
    ///  places chunk `i` at offset `i * max_chunk_size`, so both peers *must* be configured with
    ///  the same value.
    ///
    /// The default (and maximum) of 1133 bytes keeps every DATA packet at or below 1200 bytes,
    ///  which leaves room for lower-layer overhead (IP, UDP, encryption, NAT traversal wrappers)
    ///  on common path MTUs. There is no MTU discovery.
    pub max_chunk_size: usize,

    /// Messages longer than this are rejected on submission. The receiver uses the same limit
    ///  to refuse transfers announcing more chunks than a message of this size could have, which
    ///  bounds the reassembly buffer a peer can make us allocate.
    pub max_message_size: usize,

    pub initial_retransmit_timeout: Duration,
    pub max_retransmit_timeout: Duration,
    /// growth of the retransmit interval per timeout, in eighths: 8 keeps the interval constant,
    ///  16 doubles it
    pub retransmit_backoff_factor_eighths: u32,
    /// number of consecutive retransmit timeouts without acknowledgement progress after which a
    ///  transfer is abandoned
    pub max_retries: u32,
    /// An ACK implies loss for every unacknowledged chunk below the highest index it covers.
    ///  Since every arriving chunk triggers an ACK, the same gap is reported many times in a row;
    ///  this is the minimum time between two ACK-triggered retransmissions of the same chunk.
    ///  NAK triggered retransmissions are not affected.
    pub fast_retransmit_holdoff: Duration,

    /// A chunk arriving more than this many chunks beyond the next expected index triggers an
    ///  immediate NACK. Smaller gaps are left to reordering and the periodic NACK timer.
    pub nack_slack: u32,
    /// configure to roughly 2x RTT
    pub nack_interval: Duration,
    pub max_nack_entries: usize,

    pub delivered_grace_period: Duration,
    pub inbound_idle_timeout: Duration,
    pub delivered_tombstone_ttl: Duration,
}

impl Default for RmpConfig {
    fn default() -> Self {
        RmpConfig {
            max_chunk_size: MAX_CHUNK_PAYLOAD,
            max_message_size: 16*1024*1024,
            initial_retransmit_timeout: Duration::from_millis(500),
            max_retransmit_timeout: Duration::from_secs(8),
            retransmit_backoff_factor_eighths: 16,
            max_retries: 8,
            fast_retransmit_holdoff: Duration::from_millis(100),
            nack_slack: 2,
            nack_interval: Duration::from_millis(250),
            max_nack_entries: 256,
            delivered_grace_period: Duration::from_secs(5),
            inbound_idle_timeout: Duration::from_secs(30),
            delivered_tombstone_ttl: Duration::from_secs(60),
        }
    }
}

impl RmpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_chunk_size == 0 || self.max_chunk_size > MAX_CHUNK_PAYLOAD {
            bail!("chunk size must be between 1 and {}, was {}", MAX_CHUNK_PAYLOAD, self.max_chunk_size);
        }
        if self.max_message_size == 0 {
            bail!("maximum message size must not be zero");
        }
        if self.max_message_size.div_ceil(self.max_chunk_size) > MAX_TOTAL_CHUNKS.safe_cast() {
            bail!("maximum message size {} requires more than {} chunks of {} bytes", self.max_message_size, MAX_TOTAL_CHUNKS, self.max_chunk_size);
        }
        if self.initial_retransmit_timeout.is_zero() {
            bail!("initial retransmit timeout must not be zero");
        }
        if self.max_retransmit_timeout < self.initial_retransmit_timeout {
            bail!("maximum retransmit timeout must not be smaller than the initial retransmit timeout");
        }
        if self.retransmit_backoff_factor_eighths < 8 {
            bail!("retransmit backoff factor must not shrink the interval, was {}/8", self.retransmit_backoff_factor_eighths);
        }
        if self.nack_interval.is_zero() {
            bail!("NACK interval must not be zero");
        }
        if self.max_nack_entries == 0 {
            bail!("a NACK must be able to hold at least one entry");
        }
        if NackPacket::serialized_len(self.max_nack_entries) > MAX_PACKET_LEN {
            bail!("{} NACK entries do not fit into a single packet of {} bytes", self.max_nack_entries, MAX_PACKET_LEN);
        }

        // a sender may retransmit for this long after the receiver delivered, and the receiver
        //  must still recognize the message
        let min_tombstone_ttl = self.max_retransmit_span().saturating_add(self.delivered_grace_period);
        if self.delivered_tombstone_ttl < min_tombstone_ttl {
            bail!("delivered tombstone TTL of {:?} is shorter than the retransmit span plus grace period ({:?})", self.delivered_tombstone_ttl, min_tombstone_ttl);
        }
        Ok(())
    }

    /// The longest time an outbound transfer keeps retransmitting without acknowledgement
    ///  progress before it is abandoned, i.e. the sum of the backed-off intervals of
    ///  `max_retries + 1` timeouts.
    ///
    /// NB: requires a backoff factor of at least 8 eighths
    pub fn max_retransmit_span(&self) -> Duration {
        let mut backoff = RetransmitBackoff::new(self);
        let mut interval = backoff.current();
        let mut span = Duration::ZERO;

        for timeout in 0..=self.max_retries {
            span = span.saturating_add(interval);
            let next = backoff.back_off();
            if next == interval {
                // the interval does not grow any more
                return span.saturating_add(interval.saturating_mul(self.max_retries - timeout));
            }
            interval = next;
        }
        span
    }

    /// The largest number of chunks a valid transfer can announce
    pub fn max_total_chunks(&self) -> u32 {
        // validate() ensures that this fits
        self.max_message_size.div_ceil(self.max_chunk_size) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        RmpConfig::default().validate().unwrap();
    }

    #[rstest]
    #[case::zero_chunk(|c: &mut RmpConfig| c.max_chunk_size = 0)]
    #[case::chunk_too_big(|c: &mut RmpConfig| c.max_chunk_size = 1134)]
    #[case::zero_message(|c: &mut RmpConfig| c.max_message_size = 0)]
    #[case::too_many_chunks(|c: &mut RmpConfig| { c.max_chunk_size = 100; c.max_message_size = 100 * 65536; })]
    #[case::zero_timeout(|c: &mut RmpConfig| c.initial_retransmit_timeout = Duration::ZERO)]
    #[case::max_below_initial(|c: &mut RmpConfig| c.max_retransmit_timeout = Duration::from_millis(1))]
    #[case::shrinking_backoff(|c: &mut RmpConfig| c.retransmit_backoff_factor_eighths = 7)]
    #[case::zero_nack_interval(|c: &mut RmpConfig| c.nack_interval = Duration::ZERO)]
    #[case::no_nack_entries(|c: &mut RmpConfig| c.max_nack_entries = 0)]
    #[case::nack_too_big(|c: &mut RmpConfig| c.max_nack_entries = 287)]
    #[case::tombstone_shorter_than_retries(|c: &mut RmpConfig| c.max_retries = 16)]
    #[case::tombstone_shorter_than_grace(|c: &mut RmpConfig| c.delivered_grace_period = Duration::from_secs(13))]
    fn test_validate_rejects(#[case] tweak: fn(&mut RmpConfig)) {
        let mut config = RmpConfig::default();
        tweak(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::largest_nack(|c: &mut RmpConfig| c.max_nack_entries = 286)]
    #[case::constant_backoff(|c: &mut RmpConfig| c.retransmit_backoff_factor_eighths = 8)]
    #[case::max_chunks(|c: &mut RmpConfig| { c.max_chunk_size = 100; c.max_message_size = 100 * 65535; })]
    #[case::long_retries_long_tombstone(|c: &mut RmpConfig| { c.max_retries = 16; c.delivered_tombstone_ttl = Duration::from_secs(120); })]
    #[case::tombstone_at_minimum(|c: &mut RmpConfig| c.delivered_tombstone_ttl = Duration::from_millis(52_500))]
    fn test_validate_accepts(#[case] tweak: fn(&mut RmpConfig)) {
        let mut config = RmpConfig::default();
        tweak(&mut config);
        config.validate().unwrap();
    }

    #[rstest]
    #[case::default(|_: &mut RmpConfig| {}, 47_500)]
    #[case::constant(|c: &mut RmpConfig| c.retransmit_backoff_factor_eighths = 8, 4_500)]
    #[case::no_retries(|c: &mut RmpConfig| c.max_retries = 0, 500)]
    #[case::never_capped(|c: &mut RmpConfig| c.max_retries = 3, 7_500)]
    #[case::long_retries(|c: &mut RmpConfig| c.max_retries = 16, 111_500)]
    #[case::many_retries(|c: &mut RmpConfig| c.max_retries = u32::MAX, 15_500 + 8_000 * (u32::MAX as u64 - 4))]
    fn test_max_retransmit_span(#[case] tweak: fn(&mut RmpConfig), #[case] expected_millis: u64) {
        let mut config = RmpConfig::default();
        tweak(&mut config);
        assert_eq!(config.max_retransmit_span(), Duration::from_millis(expected_millis));
    }

    #[rstest]
    #[case(1133, 1133, 1)]
    #[case(1133, 1134, 2)]
    #[case(1133, 16*1024*1024, 14808)]
    #[case(100, 100 * 65535, 65535)]
    fn test_max_total_chunks(#[case] max_chunk_size: usize, #[case] max_message_size: usize, #[case] expected: u32) {
        let config = RmpConfig {
            max_chunk_size,
            max_message_size,
            ..RmpConfig::default()
        };
        assert_eq!(config.max_total_chunks(), expected);
    }
}
