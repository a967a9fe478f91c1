//! Reliable delivery of large messages between two peers over an unreliable datagram channel
//!  (typically UDP), with selective acknowledgement and retransmission.
//!
//! ## Protocol
//!
//! A message is split into chunks that fit into a single datagram (no IP level fragmentation),
//!  and each chunk is sent as a DATA packet. The receiver buffers chunks in any order and
//!  delivers the reassembled message exactly once when all chunks are present.
//!
//! * The receiver acknowledges every chunk immediately. An ACK carries the highest index up to
//!   which all chunks arrived, plus a 64 bit bitmap for the chunks following it.
//! * Missing chunks are reported in NACK packets, either immediately when a chunk arrives too far
//!   ahead of the contiguous prefix, or periodically while there are gaps.
//! * The sender retransmits chunks that are NACKed or that ACKs imply to be missing, and
//!   everything unacknowledged in the window after a retransmit timeout. The timeout backs off
//!   exponentially, and the message is abandoned after a configured number of consecutive
//!   timeouts without progress.
//! * When all chunks are acknowledged, the sender confirms delivery to the application and sends
//!   a FIN to release the receiver's state. The receiver keeps a tombstone for delivered
//!   messages so that late retransmits are acknowledged rather than delivered again.
//!
//! ## Wire format
//!
//! All numbers are big endian. Every packet starts with a signature byte (DATA=0x01, ACK=0x02,
//!  NACK=0x03, FIN=0x04), followed by sender and receiver peer id (length byte + 20 bytes each)
//!  and the 64 bit message id:
//!
//! ```ascii
//! DATA: header | chunk index u32 | total chunks u32 | payload length u32 | CRC-32 u32 | payload
//! ACK:  header | highest consecutive index u16 (0xFFFF for none) | bitmap u64
//! NACK: header | count u32 | count * chunk index u32
//! FIN:  header
//! ```
//!
//! No packet exceeds [packet::MAX_PACKET_LEN] bytes.

pub mod backoff;
pub mod chunker;
pub mod config;
pub mod connection;
pub mod datagram;
pub mod delivery;
pub mod error;
pub mod inbound;
pub mod message_id;
pub mod outbound;
pub mod packet;
pub mod peer_id;
pub mod registry;
pub mod safe_converter;
pub mod test_util;

pub use config::RmpConfig;
pub use connection::PeerConnection;
pub use datagram::{connect_udp, DatagramSender};
pub use delivery::DeliveryHandler;
pub use error::{DeliveryError, ReassemblyError, SubmitError};
pub use message_id::MessageId;
pub use peer_id::PeerId;
pub use registry::{TransferState, TransferStatus};
