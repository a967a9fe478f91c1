use std::fmt::{Debug, Display, Formatter};

/// Identifies a single transfer between a pair of peers. It is chosen by the sender and echoed
///  in every packet that belongs to the transfer, in both directions.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MessageId(pub u64);
impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl MessageId {
    pub fn random() -> MessageId {
        MessageId(rand::random())
    }
}
