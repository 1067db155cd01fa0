use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use std::fmt::{Debug, Formatter};

/// Opaque caller-unique token identifying an outbound message. Peers echo it
///  in the reply-to field of their acknowledgment, which is the only way an
///  ack is matched back to a pending job.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; 4]);

impl MessageId {
    pub const SERIALIZED_LEN: usize = 4;

    pub fn random() -> MessageId {
        let mut raw = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut raw);
        MessageId(raw)
    }

    pub fn from_raw(raw: [u8; 4]) -> MessageId {
        MessageId(raw)
    }

    pub fn to_raw(self) -> [u8; 4] {
        self.0
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageId> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            anyhow::bail!("buffer too short for a message id");
        }
        let mut raw = [0u8; 4];
        buf.copy_to_slice(&mut raw);
        Ok(MessageId(raw))
    }
}

impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case([0, 0, 0, 0])]
    #[case([1, 2, 3, 4])]
    #[case([0xff, 0xfe, 0x80, 0x01])]
    fn test_ser_deser(#[case] raw: [u8; 4]) {
        let original = MessageId::from_raw(raw);

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), MessageId::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = MessageId::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_deser_too_short() {
        let mut b: &[u8] = &[1, 2, 3];
        assert!(MessageId::deser(&mut b).is_err());
    }

    #[test]
    fn test_debug_is_hex() {
        let id = MessageId::from_raw([0xca, 0xfe, 0x00, 0x5a]);
        assert_eq!(format!("{:?}", id), "cafe005a");
    }
}
