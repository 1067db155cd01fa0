use crate::wire::message_id::MessageId;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Payload kinds as they appear on the wire. `Text`, `Binary` and `Ack` take
///  part in the dispatcher's request/response matching; `Session` frames are
///  routed to their owning session before the dispatcher ever sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PayloadKind {
    Binary = 0,
    Text = 1,
    Ack = 2,
    Session = 3,
}

const FLAG_NO_ACK: u8 = 1;
const FLAG_HAS_REPLY_TO: u8 = 2;

/// The decoded inner payload of a relay envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub kind: PayloadKind,
    pub message_id: MessageId,
    /// Present on replies and acknowledgments, absent on originating messages.
    pub reply_to: Option<MessageId>,
    /// Asks the receiver not to send an automatic empty ACK.
    pub no_ack: bool,
    /// Body bytes for `Text`/`Binary`/`Session`; empty for a bare `Ack`.
    pub body: Bytes,
}

impl Payload {
    pub fn text(message_id: MessageId, reply_to: Option<MessageId>, no_ack: bool, text: &str) -> Payload {
        Payload {
            kind: PayloadKind::Text,
            message_id,
            reply_to,
            no_ack,
            body: Bytes::copy_from_slice(text.as_bytes()),
        }
    }

    pub fn binary(message_id: MessageId, reply_to: Option<MessageId>, no_ack: bool, body: Bytes) -> Payload {
        Payload {
            kind: PayloadKind::Binary,
            message_id,
            reply_to,
            no_ack,
            body,
        }
    }

    /// An empty acknowledgment. Acks never request acks themselves.
    pub fn ack(reply_to: MessageId) -> Payload {
        Payload {
            kind: PayloadKind::Ack,
            message_id: MessageId::random(),
            reply_to: Some(reply_to),
            no_ack: true,
            body: Bytes::new(),
        }
    }

    pub fn session(body: Bytes) -> Payload {
        Payload {
            kind: PayloadKind::Session,
            message_id: MessageId::random(),
            reply_to: None,
            no_ack: true,
            body,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.into());

        let mut flags = 0u8;
        if self.no_ack {
            flags |= FLAG_NO_ACK;
        }
        if self.reply_to.is_some() {
            flags |= FLAG_HAS_REPLY_TO;
        }
        buf.put_u8(flags);

        self.message_id.ser(buf);
        if let Some(reply_to) = self.reply_to {
            reply_to.ser(buf);
        }

        buf.put_usize_varint(self.body.len());
        buf.put_slice(&self.body);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Payload> {
        let kind_raw = buf.try_get_u8()?;
        let kind = match PayloadKind::try_from(kind_raw) {
            Ok(kind) => kind,
            Err(_) => bail!("invalid payload kind {}", kind_raw),
        };

        let flags = buf.try_get_u8()?;
        let message_id = MessageId::deser(buf)?;
        let reply_to = if flags & FLAG_HAS_REPLY_TO != 0 {
            Some(MessageId::deser(buf)?)
        }
        else {
            None
        };

        let body_len = buf.try_get_usize_varint()?;
        if buf.remaining() < body_len {
            bail!("payload body truncated: declared {} bytes, {} available", body_len, buf.remaining());
        }
        let body = buf.copy_to_bytes(body_len);

        Ok(Payload {
            kind,
            message_id,
            reply_to,
            no_ack: flags & FLAG_NO_ACK != 0,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn id(b: u8) -> MessageId {
        MessageId::from_raw([b, b, b, b])
    }

    #[rstest]
    #[case::text(Payload::text(id(1), None, false, "hello"))]
    #[case::text_reply(Payload::text(id(2), Some(id(1)), false, "re: hello"))]
    #[case::binary_no_ack(Payload::binary(id(3), None, true, Bytes::from_static(b"\xca\xfe")))]
    #[case::empty_body(Payload::binary(id(4), None, false, Bytes::new()))]
    #[case::ack(Payload { kind: PayloadKind::Ack, message_id: id(5), reply_to: Some(id(4)), no_ack: true, body: Bytes::new() })]
    #[case::session(Payload::session(Bytes::from_static(b"abc")))]
    fn test_ser_deser(#[case] original: Payload) {
        let mut buf = BytesMut::new();
        original.ser(&mut buf);

        let mut b: &[u8] = &buf;
        let deser = Payload::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_ack_suppresses_further_acks() {
        let ack = Payload::ack(id(7));
        assert!(ack.no_ack);
        assert_eq!(ack.reply_to, Some(id(7)));
        assert!(ack.body.is_empty());
    }

    #[rstest]
    #[case::invalid_kind(&[9, 0, 1, 1, 1, 1, 0])]
    #[case::truncated_id(&[0, 0, 1, 1])]
    #[case::truncated_body(&[0, 0, 1, 1, 1, 1, 5, 0xaa])]
    #[case::empty(&[])]
    fn test_deser_malformed(#[case] mut buf: &[u8]) {
        assert!(Payload::deser(&mut buf).is_err());
    }
}
