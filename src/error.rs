//! Errors surfaced to applications. Wire level errors live with the codec, see
//!  [crate::packet::PacketError].

/// Returned synchronously when a message is submitted; nothing was sent in that case
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SubmitError {
    #[error("messages must not be empty")]
    EmptyMessage,
    #[error("message of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Reported asynchronously through [crate::DeliveryHandler::on_delivery_failed]
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    #[error("no acknowledgement progress after {retries} retransmissions")]
    RetryLimitExceeded { retries: u32 },
    #[error("cancelled by the application")]
    Cancelled,
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("chunk index {index} is outside of a transfer with {total_chunks} chunks")]
    IndexOutOfRange { index: u32, total_chunks: u32 },
    #[error("chunk announces {actual} total chunks, but the transfer has {expected}")]
    TotalChunksMismatch { expected: u32, actual: u32 },
    #[error("chunk #{index} has {len} bytes which is invalid for its position")]
    InvalidChunkLength { index: u32, len: usize },
}
