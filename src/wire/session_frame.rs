use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// Session traffic rides inside `PayloadKind::Session` payloads. Every frame
///  names its session so one connection can carry many concurrent sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFrame {
    pub session_id: Bytes,
    pub op: SessionOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOp {
    /// One sequence-numbered chunk of the ordered byte stream.
    Data { seq: u64, data: Bytes },
    /// Acknowledges the contiguous run `[start_seq, start_seq + count)`.
    Ack { start_seq: u64, count: u64 },
    /// Graceful shutdown notification after the sender drained its queues.
    Close,
}

const OP_DATA: u8 = 0;
const OP_ACK: u8 = 1;
const OP_CLOSE: u8 = 2;

impl SessionFrame {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_usize_varint(self.session_id.len());
        buf.put_slice(&self.session_id);

        match &self.op {
            SessionOp::Data { seq, data } => {
                buf.put_u8(OP_DATA);
                buf.put_u64(*seq);
                buf.put_usize_varint(data.len());
                buf.put_slice(data);
            }
            SessionOp::Ack { start_seq, count } => {
                buf.put_u8(OP_ACK);
                buf.put_u64(*start_seq);
                buf.put_u64_varint(*count);
            }
            SessionOp::Close => {
                buf.put_u8(OP_CLOSE);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SessionFrame> {
        let id_len = buf.try_get_usize_varint()?;
        if buf.remaining() < id_len {
            bail!("session id truncated");
        }
        let session_id = buf.copy_to_bytes(id_len);

        let op = match buf.try_get_u8()? {
            OP_DATA => {
                let seq = buf.try_get_u64()?;
                let data_len = buf.try_get_usize_varint()?;
                if buf.remaining() < data_len {
                    bail!("chunk data truncated: declared {} bytes, {} available", data_len, buf.remaining());
                }
                SessionOp::Data {
                    seq,
                    data: buf.copy_to_bytes(data_len),
                }
            }
            OP_ACK => SessionOp::Ack {
                start_seq: buf.try_get_u64()?,
                count: buf.try_get_u64_varint()?,
            },
            OP_CLOSE => SessionOp::Close,
            op => bail!("invalid session frame op {}", op),
        };

        Ok(SessionFrame { session_id, op })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::data(SessionOp::Data { seq: 1, data: Bytes::from_static(b"chunk") })]
    #[case::data_empty(SessionOp::Data { seq: u64::MAX, data: Bytes::new() })]
    #[case::ack(SessionOp::Ack { start_seq: 4, count: 3 })]
    #[case::close(SessionOp::Close)]
    fn test_ser_deser(#[case] op: SessionOp) {
        let original = SessionFrame {
            session_id: Bytes::from_static(b"sess-1"),
            op,
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);

        let mut b: &[u8] = &buf;
        let deser = SessionFrame::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[rstest]
    #[case::bad_op(&[1, 0xaa, 9])]
    #[case::truncated_seq(&[0, 0, 1, 2, 3])]
    #[case::empty(&[])]
    fn test_deser_malformed(#[case] mut buf: &[u8]) {
        assert!(SessionFrame::deser(&mut buf).is_err());
    }
}
