use bit_set::BitSet;
use bytes::Bytes;
use crate::error::ReassemblyError;
use crate::safe_converter::{PrecheckedCast, SafeCast};

pub fn total_chunks(payload_len: usize, max_chunk_size: usize) -> usize {
    payload_len.div_ceil(max_chunk_size)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Chunk {
    pub index: u32,
    pub payload: Bytes,
}

/// Splits a message into chunks of `max_chunk_size` bytes (the last one possibly shorter).
///
/// Chunks are zero-copy slices of the message buffer, so the splitter can be kept around for
///  the lifetime of a transfer and asked for individual chunks again for retransmission. As an
///  [Iterator], it yields chunks in ascending index order, and [ChunkSplitter::restart] starts
///  over.
#[derive(Clone, Debug)]
pub struct ChunkSplitter {
    payload: Bytes,
    max_chunk_size: usize,
    total_chunks: u32,
    next_index: u32,
}
impl ChunkSplitter {
    /// NB: the caller is responsible for ensuring that the number of chunks fits the wire format
    pub fn split(payload: Bytes, max_chunk_size: usize) -> ChunkSplitter {
        assert!(max_chunk_size > 0);
        let total_chunks = total_chunks(payload.len(), max_chunk_size).prechecked_cast();
        ChunkSplitter {
            payload,
            max_chunk_size,
            total_chunks,
            next_index: 0,
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn chunk(&self, index: u32) -> Option<Bytes> {
        if index >= self.total_chunks {
            return None;
        }
        let offs = index.safe_cast() * self.max_chunk_size;
        let end = (offs + self.max_chunk_size).min(self.payload.len());
        Some(self.payload.slice(offs..end))
    }

    pub fn restart(&mut self) {
        self.next_index = 0;
    }
}
impl Iterator for ChunkSplitter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Self::Item> {
        let payload = self.chunk(self.next_index)?;
        let index = self.next_index;
        self.next_index += 1;
        Some(Chunk { index, payload })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total_chunks - self.next_index).safe_cast();
        (remaining, Some(remaining))
    }
}
impl ExactSizeIterator for ChunkSplitter {}


/// Places incoming chunks at their final offset in a buffer for the whole message, so the
///  complete message is available without further copying once every chunk arrived.
pub struct Reassembler {
    buf: Vec<u8>,
    max_chunk_size: usize,
    total_chunks: u32,
    received: BitSet,
    num_received: u32,
    last_chunk_len: Option<usize>,
}
impl Reassembler {
    pub fn new(total_chunks: u32, max_chunk_size: usize) -> Reassembler {
        Reassembler {
            buf: vec![0; total_chunks.safe_cast() * max_chunk_size],
            max_chunk_size,
            total_chunks,
            received: BitSet::with_capacity(total_chunks.safe_cast()),
            num_received: 0,
            last_chunk_len: None,
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn num_received(&self) -> u32 {
        self.num_received
    }

    pub fn contains(&self, index: u32) -> bool {
        self.received.contains(index.safe_cast())
    }

    pub fn is_complete(&self) -> bool {
        self.num_received == self.total_chunks
    }

    /// Returns `Ok(false)` for a chunk that was received before, leaving the buffer unchanged.
    pub fn insert(&mut self, index: u32, payload: &[u8]) -> Result<bool, ReassemblyError> {
        if index >= self.total_chunks {
            return Err(ReassemblyError::IndexOutOfRange { index, total_chunks: self.total_chunks });
        }

        let is_last = index + 1 == self.total_chunks;
        let valid_len = if is_last {
            payload.len() <= self.max_chunk_size
        }
        else {
            payload.len() == self.max_chunk_size
        };
        if !valid_len {
            return Err(ReassemblyError::InvalidChunkLength { index, len: payload.len() });
        }

        if !self.received.insert(index.safe_cast()) {
            return Ok(false);
        }

        let offs = index.safe_cast() * self.max_chunk_size;
        self.buf[offs..offs + payload.len()].copy_from_slice(payload);
        self.num_received += 1;
        if is_last {
            self.last_chunk_len = Some(payload.len());
        }
        Ok(true)
    }

    /// The complete message, or `None` if chunks are still missing
    pub fn take_message(&mut self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let len = (self.total_chunks - 1).safe_cast() * self.max_chunk_size + self.last_chunk_len?;
        let mut buf = std::mem::take(&mut self.buf);
        buf.truncate(len);
        Some(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::packet::MAX_CHUNK_PAYLOAD;

    fn message(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    #[rstest]
    #[case::one_byte(1, 1)]
    #[case::exactly_one(1133, 1)]
    #[case::one_more(1134, 2)]
    #[case::five_thousand(5000, 5)]
    #[case::exactly_eight(8 * 1133, 8)]
    fn test_total_chunks(#[case] len: usize, #[case] expected: usize) {
        assert_eq!(total_chunks(len, MAX_CHUNK_PAYLOAD), expected);
        assert_eq!(ChunkSplitter::split(message(len), MAX_CHUNK_PAYLOAD).count(), expected);
    }

    #[test]
    fn test_split_5000() {
        let chunks = ChunkSplitter::split(message(5000), MAX_CHUNK_PAYLOAD).collect::<Vec<_>>();

        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(chunks.iter().map(|c| c.payload.len()).collect::<Vec<_>>(), vec![1133, 1133, 1133, 1133, 468]);
        assert_eq!(chunks[4].payload.as_ref(), &message(5000)[4 * 1133..]);
    }

    #[test]
    fn test_split_restart() {
        let mut splitter = ChunkSplitter::split(message(300), 100);
        assert_eq!(splitter.len(), 3);
        assert_eq!(splitter.next().unwrap().index, 0);
        assert_eq!(splitter.next().unwrap().index, 1);
        assert_eq!(splitter.len(), 1);

        splitter.restart();
        assert_eq!(splitter.map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_chunk_by_index() {
        let splitter = ChunkSplitter::split(message(250), 100);
        assert_eq!(splitter.chunk(1).unwrap().as_ref(), &message(250)[100..200]);
        assert_eq!(splitter.chunk(2).unwrap().len(), 50);
        assert_eq!(splitter.chunk(3), None);
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3, 4])]
    #[case::reversed(vec![4, 3, 2, 1, 0])]
    #[case::shuffled(vec![2, 4, 0, 3, 1])]
    #[case::with_duplicates(vec![1, 1, 4, 0, 4, 2, 3, 0])]
    fn test_reassemble(#[case] order: Vec<u32>) {
        let original = message(5000);
        let splitter = ChunkSplitter::split(original.clone(), MAX_CHUNK_PAYLOAD);
        let mut reassembler = Reassembler::new(splitter.total_chunks(), MAX_CHUNK_PAYLOAD);

        let mut seen = BitSet::new();
        for index in order {
            if seen.len() < 5 {
                assert!(!reassembler.is_complete());
                assert_eq!(reassembler.take_message(), None);
            }

            let is_new = reassembler.insert(index, &splitter.chunk(index).unwrap()).unwrap();
            assert_eq!(is_new, seen.insert(index as usize));
            assert!(reassembler.contains(index));
        }

        assert!(reassembler.is_complete());
        assert_eq!(reassembler.num_received(), 5);
        assert_eq!(reassembler.take_message().unwrap(), original);
    }

    #[test]
    fn test_duplicate_after_completion_is_ignored() {
        let original = message(250);
        let splitter = ChunkSplitter::split(original.clone(), 100);
        let mut reassembler = Reassembler::new(3, 100);
        for index in 0..3 {
            assert_eq!(reassembler.insert(index, &splitter.chunk(index).unwrap()), Ok(true));
        }
        assert!(reassembler.is_complete());

        // same index, different content
        assert_eq!(reassembler.insert(0, &[0xff; 100]), Ok(false));
        assert_eq!(reassembler.num_received(), 3);
        assert_eq!(reassembler.take_message().unwrap(), original);
    }

    #[rstest]
    #[case::index_out_of_range(3, 10, ReassemblyError::IndexOutOfRange { index: 3, total_chunks: 3 })]
    #[case::short_middle_chunk(1, 99, ReassemblyError::InvalidChunkLength { index: 1, len: 99 })]
    #[case::long_middle_chunk(0, 101, ReassemblyError::InvalidChunkLength { index: 0, len: 101 })]
    #[case::long_last_chunk(2, 101, ReassemblyError::InvalidChunkLength { index: 2, len: 101 })]
    fn test_insert_invalid(#[case] index: u32, #[case] len: usize, #[case] expected: ReassemblyError) {
        let mut reassembler = Reassembler::new(3, 100);
        assert_eq!(reassembler.insert(index, &vec![1u8; len]), Err(expected));
        assert_eq!(reassembler.num_received(), 0);
    }

    #[test]
    fn test_duplicate_does_not_overwrite() {
        let mut reassembler = Reassembler::new(1, 100);
        assert_eq!(reassembler.insert(0, b"first"), Ok(true));
        assert_eq!(reassembler.insert(0, b"other"), Ok(false));
        assert_eq!(reassembler.take_message().unwrap().as_ref(), b"first");
    }
}
