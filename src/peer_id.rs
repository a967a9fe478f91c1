use std::fmt::{Debug, Display, Formatter};
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use crate::packet::PacketError;

/// The identity of a peer as it appears on the wire: up to 20 bytes of opaque data (typically a
///  short textual handle or a truncated key fingerprint).
///
/// ```ascii
/// 0: length (u8), 1..=20
/// 1: identifier bytes, zero-padded to 20 bytes
/// ```
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PeerId {
    len: u8,
    raw: [u8; PeerId::MAX_LEN],
}
impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self)
    }
}
impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => {
                for b in self.as_bytes() {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

impl PeerId {
    pub const MAX_LEN: usize = 20;
    pub const SERIALIZED_LEN: usize = 1 + Self::MAX_LEN;

    pub fn new(id: &[u8]) -> anyhow::Result<PeerId> {
        if id.is_empty() || id.len() > Self::MAX_LEN {
            bail!("peer id must be between 1 and {} bytes long, was {}", Self::MAX_LEN, id.len());
        }

        let mut raw = [0u8; Self::MAX_LEN];
        raw[..id.len()].copy_from_slice(id);
        Ok(PeerId {
            len: id.len() as u8,
            raw,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw[..self.len as usize]
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.len);
        buf.put_slice(&self.raw);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<PeerId, PacketError> {
        let len = buf.try_get_u8()?;
        if len == 0 || len as usize > Self::MAX_LEN {
            return Err(PacketError::Malformed(format!("peer id length {} outside of 1..={}", len, Self::MAX_LEN)));
        }

        let mut raw = [0u8; Self::MAX_LEN];
        buf.try_copy_to_slice(&mut raw)?;

        // the padding is ignored rather than validated, but we normalize it so that equality
        //  and hashing only depend on the significant bytes
        raw[len as usize..].fill(0);
        Ok(PeerId { len, raw })
    }
}

impl TryFrom<&str> for PeerId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        PeerId::new(value.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::short(b"a")]
    #[case::medium(b"alice")]
    #[case::max(b"01234567890123456789")]
    fn test_new_valid(#[case] id: &[u8]) {
        let peer_id = PeerId::new(id).unwrap();
        assert_eq!(peer_id.as_bytes(), id);
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::too_long(b"012345678901234567890")]
    fn test_new_invalid(#[case] id: &[u8]) {
        assert!(PeerId::new(id).is_err());
    }

    #[test]
    fn test_ser() {
        let mut buf = BytesMut::new();
        PeerId::new(b"bob").unwrap().ser(&mut buf);
        assert_eq!(buf.as_ref(), b"\x03bob\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0");
        assert_eq!(buf.len(), PeerId::SERIALIZED_LEN);
    }

    #[rstest]
    #[case::valid(b"\x03bob\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0", Some("bob"), b"")]
    #[case::remainder(b"\x01xy\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\x42", Some("x"), b"\x42")]
    #[case::zero_len(b"\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0", None, b"")]
    #[case::len_too_big(b"\x15bob\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0", None, b"")]
    #[case::truncated(b"\x03bob", None, b"")]
    #[case::empty(b"", None, b"")]
    fn test_deser(#[case] mut buf: &[u8], #[case] expected: Option<&str>, #[case] buf_after: &[u8]) {
        match PeerId::deser(&mut buf) {
            Ok(actual) => {
                assert_eq!(actual, PeerId::try_from(expected.unwrap()).unwrap());
                assert_eq!(buf, buf_after);
            }
            Err(e) => {
                assert!(expected.is_none(), "unexpected error {}", e);
            }
        }
    }

    #[test]
    fn test_display_non_utf8() {
        let peer_id = PeerId::new(&[0xff, 0x01]).unwrap();
        assert_eq!(peer_id.to_string(), "ff01");
    }
}
